// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! REST API backend (`primary-remote` and `local-origin`).
//!
//! Both API modes speak the same protocol and differ only in base URL:
//!
//! | Operation | Request                               |
//! |-----------|---------------------------------------|
//! | health    | `GET {base}/health`                   |
//! | list      | `GET {base}/{table}?field=v&limit=n`  |
//! | get       | `GET {base}/{table}/{id}`             |
//! | create    | `POST {base}/{table}`                 |
//! | update    | `PUT {base}/{table}/{id}`             |
//! | delete    | `DELETE {base}/{table}/{id}`          |
//!
//! Composite ids (page content) go as query parameters on the collection
//! path instead of a path segment.
//!
//! Responses are wrapped in `{"success": bool, "data": ..., "error": "..."}`.
//! Bodies without a `success` field are taken as bare data.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use super::{BackendMode, EntityBackend};
use crate::entity::{EntityKind, ListFilter, RecordId};
use crate::error::BackendError;

pub struct ApiBackend {
    mode: BackendMode,
    base_url: Url,
    client: Client,
}

impl ApiBackend {
    pub fn new(mode: BackendMode, base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| BackendError::Connection(format!("invalid base url '{}': {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        Ok(Self { mode, base_url, client })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Connection(format!("base url cannot take a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Request targeting one record: `/{table}/{id}` or `/{table}?page_name=..&content_key=..`.
    fn record_request(&self, method: Method, kind: EntityKind, id: &RecordId) -> Result<RequestBuilder, BackendError> {
        match id {
            RecordId::Id(id) => Ok(self.client.request(method, self.url(&[kind.table(), id.as_str()])?)),
            RecordId::Composite { .. } => {
                let query: Vec<(&str, String)> = id.match_fields();
                Ok(self.client.request(method, self.url(&[kind.table()])?).query(&query))
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, BackendError> {
        let response = request.send().await?;
        unwrap_envelope(response).await
    }
}

/// Normalize an API response into its `data` payload.
async fn unwrap_envelope(response: Response) -> Result<Value, BackendError> {
    let status = response.status();
    let text = response.text().await?;
    let body: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                BackendError::Decode(e.to_string())
            } else {
                BackendError::Status { status: status.as_u16(), message: text.clone() }
            }
        })?
    };

    let error_message = || {
        body.get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string())
    };

    if status == StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound);
    }
    if !status.is_success() {
        return Err(BackendError::Status { status: status.as_u16(), message: error_message() });
    }

    match body.get("success").and_then(Value::as_bool) {
        Some(false) => Err(BackendError::Status {
            status: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
            message: error_message(),
        }),
        Some(true) => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
        None => Ok(body),
    }
}

fn expect_array(data: Value) -> Result<Vec<Value>, BackendError> {
    match data {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        other => Err(BackendError::Decode(format!("expected a list, got {}", other))),
    }
}

/// A single-record read may come back as the object or as a one-element list.
fn expect_record(data: Value) -> Result<Value, BackendError> {
    match data {
        Value::Object(_) => Ok(data),
        Value::Array(rows) => rows.into_iter().next().ok_or(BackendError::NotFound),
        Value::Null => Err(BackendError::NotFound),
        other => Err(BackendError::Decode(format!("expected a record, got {}", other))),
    }
}

/// A write acknowledged with `{"success": true}` and no data still
/// succeeded; echo what was sent.
fn written_record(data: Value, payload: &Value) -> Result<Value, BackendError> {
    match data {
        Value::Null => Ok(payload.clone()),
        Value::Array(rows) if rows.is_empty() => Ok(payload.clone()),
        other => expect_record(other),
    }
}

#[async_trait]
impl EntityBackend for ApiBackend {
    fn mode(&self) -> BackendMode {
        self.mode
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let response = self.client.get(self.url(&["health"])?).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!("health returned {}", status)));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let healthy = match &body {
            Value::Bool(ok) => *ok,
            Value::Object(map) => map.get("success").and_then(Value::as_bool).unwrap_or(true),
            _ => true,
        };
        if healthy {
            Ok(())
        } else {
            Err(BackendError::Unavailable("health check reported failure".into()))
        }
    }

    async fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError> {
        let mut query: Vec<(String, String)> = filter
            .equals
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        if let Some(order) = &filter.order_by {
            query.push(("order_by".into(), order.field.clone()));
            query.push(("order".into(), if order.descending { "desc" } else { "asc" }.into()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit".into(), limit.to_string()));
        }

        debug!(mode = %self.mode, table = kind.table(), "API list");
        let data = self.send(self.client.get(self.url(&[kind.table()])?).query(&query)).await?;
        // The API may ignore unknown parameters; apply locally so every mode agrees.
        Ok(filter.apply(expect_array(data)?))
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Value, BackendError> {
        let data = self.send(self.record_request(Method::GET, kind, id)?).await?;
        expect_record(data)
    }

    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Value, BackendError> {
        let data = self.send(self.client.post(self.url(&[kind.table()])?).json(payload)).await?;
        written_record(data, payload)
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, payload: &Value) -> Result<Value, BackendError> {
        let data = self.send(self.record_request(Method::PUT, kind, id)?.json(payload)).await?;
        written_record(data, payload)
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), BackendError> {
        self.send(self.record_request(Method::DELETE, kind, id)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(base: &str) -> ApiBackend {
        ApiBackend::new(BackendMode::PrimaryRemote, base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_url_building() {
        let api = backend("https://example.com/api/");
        assert_eq!(api.url(&["products", "7"]).unwrap().as_str(), "https://example.com/api/products/7");
        assert_eq!(api.url(&["health"]).unwrap().as_str(), "https://example.com/api/health");
    }

    #[test]
    fn test_ids_are_path_escaped() {
        let api = backend("https://example.com/api");
        let url = api.url(&["news", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/news/a%2Fb");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(ApiBackend::new(BackendMode::LocalOrigin, "not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_expect_record_shapes() {
        assert_eq!(expect_record(json!([{"id": 1}])).unwrap(), json!({"id": 1}));
        assert_eq!(expect_record(json!([])).unwrap_err(), BackendError::NotFound);
        assert!(matches!(expect_record(json!(3)), Err(BackendError::Decode(_))));
        assert_eq!(expect_array(Value::Null).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_bare_write_acknowledgement_echoes_payload() {
        let payload = json!({"name": "Ada", "email": "ada@example.com"});
        assert_eq!(written_record(Value::Null, &payload).unwrap(), payload);
        assert_eq!(written_record(json!([]), &payload).unwrap(), payload);
        assert_eq!(written_record(json!({"id": 9}), &payload).unwrap(), json!({"id": 9}));
        assert!(matches!(written_record(json!("ok"), &payload), Err(BackendError::Decode(_))));
    }
}
