// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity client.
//!
//! Typed read/create/update/delete for each entity, built on the executor.
//! Callers never see which backend mode served a call: results are the
//! normalized records and errors are [`ClientError`]s.
//!
//! # Caching
//!
//! | Operation    | Cache key                  |
//! |--------------|----------------------------|
//! | `get_all`    | `{table}:all:{filter}`     |
//! | `get_by_id`  | `{table}:id:{id}`          |
//!
//! A successful write removes every `{table}:` key before returning, so the
//! next read of that entity is live.
//!
//! # Offline writes
//!
//! When every backend is unreachable a write is stored in the durable
//! mutation queue and [`MutationOutcome::Queued`] is returned. Callers should
//! show this as provisional success ("saved, will sync").
//!
//! # Example
//!
//! ```
//! use site_sync::{BackendMode, BackendSet, ClientConfig, ClientContext, EntityClient, MemoryBackend};
//! use site_sync::entity::Product;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), site_sync::ClientError> {
//! let backends = BackendSet::new().with(MemoryBackend::new(BackendMode::DirectService));
//! let client = EntityClient::new(ClientContext::new(ClientConfig::default(), backends));
//!
//! let created = client.products().create(&Product::new("Indoor P2.5", "indoor")).await?;
//! assert!(!created.is_queued());
//!
//! let all = client.products().get_all(None).await?;
//! assert_eq!(all[0].name, "Indoor P2.5");
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;

use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::context::ClientContext;
use crate::entity::{Entity, EntityKind, Inquiry, ListFilter, NewsArticle, PageContent, Product, RecordId, SiteSetting};
use crate::error::{ClientError, ValidationError};
use crate::executor::{ExecuteOptions, Executor};
use crate::queue::{MutationQueue, MutationRequest, QueuedMutation};

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    /// Delivered; carries the stored record.
    Succeeded(T),
    /// Every backend was down; stored durably for later delivery.
    Queued { mutation_id: String },
}

impl<T> MutationOutcome<T> {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    pub fn succeeded(self) -> Option<T> {
        match self {
            Self::Succeeded(value) => Some(value),
            Self::Queued { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MutationOutcome<U> {
        match self {
            Self::Succeeded(value) => MutationOutcome::Succeeded(f(value)),
            Self::Queued { mutation_id } => MutationOutcome::Queued { mutation_id },
        }
    }
}

#[derive(Clone)]
pub struct EntityClient {
    ctx: ClientContext,
    executor: Executor,
    queue: Option<MutationQueue>,
}

impl EntityClient {
    /// Writes can only be queued when the context has a local store.
    pub fn new(ctx: ClientContext) -> Self {
        let queue = ctx.store().cloned().map(MutationQueue::new);
        Self {
            executor: Executor::new(ctx.clone()),
            ctx,
            queue,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    #[must_use]
    pub fn queue(&self) -> Option<&MutationQueue> {
        self.queue.as_ref()
    }

    pub fn products(&self) -> Collection<Product> {
        self.collection()
    }

    pub fn news(&self) -> Collection<NewsArticle> {
        self.collection()
    }

    pub fn inquiries(&self) -> Collection<Inquiry> {
        self.collection()
    }

    pub fn page_content(&self) -> Collection<PageContent> {
        self.collection()
    }

    pub fn site_settings(&self) -> Collection<SiteSetting> {
        self.collection()
    }

    pub fn collection<E: Entity>(&self) -> Collection<E> {
        Collection {
            raw: self.raw(E::KIND),
            _entity: PhantomData,
        }
    }

    /// Untyped access, used by the reconciler and the queue.
    pub fn raw(&self, kind: EntityKind) -> RawCollection {
        RawCollection {
            client: self.clone(),
            kind,
        }
    }

    /// Send a queued mutation without re-queuing it on failure.
    pub async fn deliver(&self, mutation: &QueuedMutation) -> Result<Value, ClientError> {
        self.send(mutation.entity, &mutation.request).await
    }

    /// Run a write through the executor and invalidate the entity's cache.
    async fn send(&self, kind: EntityKind, request: &MutationRequest) -> Result<Value, ClientError> {
        let target = request
            .record_id()
            .map(ToString::to_string)
            .unwrap_or_else(|| "new".to_string());
        let op_key = format!("{}:{}:{}", kind.table(), request.operation(), target);
        let options = ExecuteOptions::write(&self.ctx.config());

        let value = self
            .executor
            .execute(&op_key, &options, |backend| {
                let request = request.clone();
                async move {
                    match request {
                        MutationRequest::Create { payload } => backend.create(kind, &payload).await,
                        MutationRequest::Update { id, payload } => backend.update(kind, &id, &payload).await,
                        MutationRequest::Delete { id } => backend.delete(kind, &id).await.map(|_| Value::Null),
                    }
                }
                .boxed()
            })
            .await?;

        let removed = self.ctx.cache().invalidate_prefix(&format!("{}:", kind.table()));
        debug!(op = %op_key, invalidated = removed, "Write succeeded");
        Ok(value)
    }

    /// Write, falling back to the durable queue when every backend is down.
    async fn mutate(&self, kind: EntityKind, request: MutationRequest) -> Result<MutationOutcome<Value>, ClientError> {
        match self.send(kind, &request).await {
            Ok(value) => Ok(MutationOutcome::Succeeded(value)),
            Err(ClientError::BackendUnavailable { operation, last_error }) => match &self.queue {
                Some(queue) => {
                    let mutation = QueuedMutation::new(kind, request);
                    queue.enqueue(&mutation).await?;
                    Ok(MutationOutcome::Queued { mutation_id: mutation.id })
                }
                None => Err(ClientError::BackendUnavailable { operation, last_error }),
            },
            Err(e) => Err(e),
        }
    }
}

/// Required-field checks for an untyped create payload.
fn validate_payload(kind: EntityKind, payload: &Value) -> Result<(), ValidationError> {
    fn check<E: Entity>(payload: &Value) -> Result<(), ValidationError> {
        let entity: E = serde_json::from_value(payload.clone())
            .map_err(|e| ValidationError::new(E::KIND, "payload", e.to_string()))?;
        entity.validate()
    }
    match kind {
        EntityKind::Products => check::<Product>(payload),
        EntityKind::News => check::<NewsArticle>(payload),
        EntityKind::Inquiries => check::<Inquiry>(payload),
        EntityKind::PageContent => check::<PageContent>(payload),
        EntityKind::SiteSettings => check::<SiteSetting>(payload),
    }
}

/// Untyped operations on one entity.
#[derive(Clone)]
pub struct RawCollection {
    client: EntityClient,
    kind: EntityKind,
}

impl RawCollection {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub async fn get_all(&self, filter: Option<&ListFilter>) -> Result<Vec<Value>, ClientError> {
        let filter = filter.cloned().unwrap_or_default();
        let kind = self.kind;
        let op_key = format!("{}:all:{}", kind.table(), filter.cache_fragment());
        let options = ExecuteOptions::read(&self.client.ctx.config(), kind);

        let value = self
            .client
            .executor
            .execute(&op_key, &options, |backend| {
                let filter = filter.clone();
                async move { backend.list(kind, &filter).await.map(Value::Array) }.boxed()
            })
            .await?;

        match value {
            Value::Array(rows) => Ok(rows),
            other => Err(ClientError::Decode(format!("expected a list for {}, got {}", op_key, other))),
        }
    }

    /// `Ok(None)` when the record does not exist.
    pub async fn get_by_id(&self, id: &RecordId) -> Result<Option<Value>, ClientError> {
        let kind = self.kind;
        let op_key = format!("{}:id:{}", kind.table(), id);
        let options = ExecuteOptions::read(&self.client.ctx.config(), kind);

        let result = self
            .client
            .executor
            .execute(&op_key, &options, |backend| {
                let id = id.clone();
                async move { backend.get(kind, &id).await }.boxed()
            })
            .await;

        match result {
            Ok(value) => Ok(Some(value)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validates against the entity's required fields before any network call.
    pub async fn create(&self, payload: Value) -> Result<MutationOutcome<Value>, ClientError> {
        validate_payload(self.kind, &payload)?;
        self.client.mutate(self.kind, MutationRequest::Create { payload }).await
    }

    /// Partial update: only the fields present in `payload` change.
    pub async fn update(&self, id: &RecordId, payload: Value) -> Result<MutationOutcome<Value>, ClientError> {
        if !payload.is_object() {
            return Err(ValidationError::new(self.kind, "payload", "must be an object").into());
        }
        self.client
            .mutate(self.kind, MutationRequest::Update { id: id.clone(), payload })
            .await
    }

    pub async fn delete(&self, id: &RecordId) -> Result<MutationOutcome<()>, ClientError> {
        let outcome = self.client.mutate(self.kind, MutationRequest::Delete { id: id.clone() }).await?;
        Ok(outcome.map(|_| ()))
    }
}

/// Typed operations on one entity.
pub struct Collection<E> {
    raw: RawCollection,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Collection<E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _entity: PhantomData,
        }
    }
}

fn decode<E: Entity>(value: Value) -> Result<E, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::Decode(format!("{}: {}", E::KIND, e)))
}

fn encode<E: Entity>(entity: &E) -> Result<Value, ClientError> {
    serde_json::to_value(entity).map_err(|e| ClientError::Decode(format!("{}: {}", E::KIND, e)))
}

impl<E: Entity> Collection<E> {
    #[must_use]
    pub fn raw(&self) -> &RawCollection {
        &self.raw
    }

    pub async fn get_all(&self, filter: Option<&ListFilter>) -> Result<Vec<E>, ClientError> {
        self.raw.get_all(filter).await?.into_iter().map(decode).collect()
    }

    pub async fn get_by_id(&self, id: impl Into<RecordId>) -> Result<Option<E>, ClientError> {
        self.raw.get_by_id(&id.into()).await?.map(decode).transpose()
    }

    pub async fn create(&self, entity: &E) -> Result<MutationOutcome<E>, ClientError> {
        entity.validate()?;
        let payload = encode(entity)?;
        match self.raw.client.mutate(E::KIND, MutationRequest::Create { payload }).await? {
            MutationOutcome::Succeeded(value) => Ok(MutationOutcome::Succeeded(decode(value)?)),
            MutationOutcome::Queued { mutation_id } => Ok(MutationOutcome::Queued { mutation_id }),
        }
    }

    /// Full update: the entity is validated and sent whole.
    pub async fn update(&self, id: impl Into<RecordId>, entity: &E) -> Result<MutationOutcome<E>, ClientError> {
        entity.validate()?;
        let payload = encode(entity)?;
        match self.raw.update(&id.into(), payload).await? {
            MutationOutcome::Succeeded(value) => Ok(MutationOutcome::Succeeded(decode(value)?)),
            MutationOutcome::Queued { mutation_id } => Ok(MutationOutcome::Queued { mutation_id }),
        }
    }

    pub async fn delete(&self, id: impl Into<RecordId>) -> Result<MutationOutcome<()>, ClientError> {
        self.raw.delete(&id.into()).await
    }
}
