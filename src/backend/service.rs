// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Direct backend-as-a-service connection (`direct-service`).
//!
//! PostgREST-style table access under `/rest/v1` plus a server-sent-events
//! change feed under `/realtime/v1/{table}`:
//!
//! ```text
//! GET    /rest/v1/products?select=*&category=eq.indoor&order=sort_order.asc&limit=5
//! POST   /rest/v1/products                       Prefer: return=representation
//! PATCH  /rest/v1/products?id=eq.7               Prefer: return=representation
//! DELETE /rest/v1/page_content?page_name=eq.home&content_key=eq.hero_title
//!
//! GET    /realtime/v1/products                   Accept: text/event-stream
//! data: {"operation":"UPDATE","record":{"id":7,"name":"New Name"}}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{BackendMode, ChangeFeed, EntityBackend};
use crate::entity::{ChangeEvent, ChangeOp, EntityKind, ListFilter, RecordId};
use crate::error::BackendError;

pub struct ServiceBackend {
    base_url: Url,
    client: Client,
    /// Separate client without a total timeout: feeds are long-lived.
    feed_client: Client,
}

impl ServiceBackend {
    pub fn new(base_url: &str, api_key: impl AsRef<str>, timeout: Duration) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| BackendError::Connection(format!("invalid service url '{}': {}", base_url, e)))?;

        let key = api_key.as_ref();
        let mut headers = HeaderMap::new();
        let invalid_key = |_| BackendError::Connection("service key is not a valid header value".into());
        headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid_key)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid_key)?,
        );

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        let feed_client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(Self { base_url, client, feed_client })
    }

    fn url(&self, prefix: &str, table: &str) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Connection(format!("service url cannot take a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(prefix.split('/'))
            .push(table);
        Ok(url)
    }

    fn table_url(&self, kind: EntityKind) -> Result<Url, BackendError> {
        self.url("rest/v1", kind.table())
    }

    fn returning(request: RequestBuilder) -> RequestBuilder {
        request.header("Prefer", "return=representation")
    }

    async fn send_rows(&self, request: RequestBuilder) -> Result<Vec<Value>, BackendError> {
        let response = request.send().await?;
        let body = check_status(response).await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body).map_err(|e| BackendError::Decode(e.to_string()))? {
            Value::Array(rows) => Ok(rows),
            obj @ Value::Object(_) => Ok(vec![obj]),
            other => Err(BackendError::Decode(format!("expected rows, got {}", other))),
        }
    }
}

/// Map PostgREST status codes onto backend errors; returns the body text.
async fn check_status(response: Response) -> Result<String, BackendError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    Err(BackendError::Status { status: status.as_u16(), message })
}

/// `col=eq.value` pairs selecting one record.
fn id_filters(id: &RecordId) -> Vec<(&'static str, String)> {
    id.match_fields()
        .into_iter()
        .map(|(column, value)| (column, format!("eq.{}", value)))
        .collect()
}

fn list_query(filter: &ListFilter) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    for (field, value) in &filter.equals {
        query.push((field.clone(), format!("eq.{}", value)));
    }
    if let Some(order) = &filter.order_by {
        let direction = if order.descending { "desc" } else { "asc" };
        query.push(("order".into(), format!("{}.{}", order.field, direction)));
    }
    if let Some(limit) = filter.limit {
        query.push(("limit".into(), limit.to_string()));
    }
    query
}

#[derive(Deserialize)]
struct FeedMessage {
    #[serde(alias = "type", alias = "eventType")]
    operation: ChangeOp,
    #[serde(default, alias = "new")]
    record: Option<Value>,
    #[serde(default, alias = "old")]
    old_record: Option<Value>,
}

/// Parse one SSE frame (lines up to a blank line) into a change event.
///
/// Comment/keep-alive frames and frames without `data:` yield `Ok(None)`.
pub(crate) fn parse_sse_frame(kind: EntityKind, frame: &str) -> Result<Option<ChangeEvent>, BackendError> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        return Ok(None);
    }
    let message: FeedMessage = serde_json::from_str(&data.join("\n"))
        .map_err(|e| BackendError::Decode(format!("bad change frame: {}", e)))?;

    // Deletes usually only carry the old row.
    let record = match message.operation {
        ChangeOp::Delete => message.old_record.or(message.record),
        _ => message.record.or(message.old_record),
    }
    .unwrap_or(Value::Null);
    Ok(Some(ChangeEvent::new(kind, message.operation, record)))
}

struct FeedState {
    chunks: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: Vec<u8>,
    kind: EntityKind,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Split the first complete frame off the buffer. Works on bytes so a
/// multi-byte character split across chunks is never mangled.
fn take_frame(buffer: &mut Vec<u8>) -> Option<String> {
    let (end, separator) = [(find(buffer, b"\r\n\r\n"), 4), (find(buffer, b"\n\n"), 2)]
        .into_iter()
        .filter_map(|(pos, len)| pos.map(|p| (p, len)))
        .min_by_key(|(pos, _)| *pos)?;
    let frame = String::from_utf8_lossy(&buffer[..end]).replace("\r\n", "\n");
    buffer.drain(..end + separator);
    Some(frame)
}

fn sse_events(kind: EntityKind, response: Response) -> ChangeFeed {
    let state = FeedState {
        chunks: response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed(),
        buffer: Vec::new(),
        kind,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            while let Some(frame) = take_frame(&mut state.buffer) {
                match parse_sse_frame(state.kind, &frame) {
                    Ok(Some(event)) => return Some((Ok(event), state)),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(entity = %state.kind, error = %e, "Skipping malformed change frame");
                        continue;
                    }
                }
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(BackendError::from(e)), state)),
                None => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl EntityBackend for ServiceBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::DirectService
    }

    /// Minimal metadata read.
    async fn health_check(&self) -> Result<(), BackendError> {
        let request = self
            .client
            .get(self.table_url(EntityKind::SiteSettings)?)
            .query(&[("select", "id"), ("limit", "1")]);
        check_status(request.send().await?).await.map(|_| ())
    }

    async fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError> {
        debug!(table = kind.table(), "Service list");
        self.send_rows(self.client.get(self.table_url(kind)?).query(&list_query(filter))).await
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Value, BackendError> {
        let request = self
            .client
            .get(self.table_url(kind)?)
            .query(&[("select", "*")])
            .query(&id_filters(id));
        self.send_rows(request).await?.into_iter().next().ok_or(BackendError::NotFound)
    }

    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Value, BackendError> {
        let request = Self::returning(self.client.post(self.table_url(kind)?).json(payload));
        self.send_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("insert returned no rows".into()))
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, payload: &Value) -> Result<Value, BackendError> {
        let request = Self::returning(self.client.patch(self.table_url(kind)?).query(&id_filters(id)).json(payload));
        self.send_rows(request).await?.into_iter().next().ok_or(BackendError::NotFound)
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), BackendError> {
        let request = Self::returning(self.client.delete(self.table_url(kind)?).query(&id_filters(id)));
        let deleted = self.send_rows(request).await?;
        if deleted.is_empty() {
            Err(BackendError::NotFound)
        } else {
            Ok(())
        }
    }

    async fn open_feed(&self, kind: EntityKind) -> Result<Option<ChangeFeed>, BackendError> {
        let response = self
            .feed_client
            .get(self.url("realtime/v1", kind.table())?)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: "change feed refused".into(),
            });
        }
        debug!(table = kind.table(), "Change feed opened");
        Ok(Some(sse_events(kind, response)))
    }
}
