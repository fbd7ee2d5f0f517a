// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backend.
//!
//! Backs tests, the demo and offline use. Several [`MemoryBackend`]s can
//! share one [`MemoryDataset`] to model three modes fronting the same
//! database, each with its own availability switch and latency.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{BackendMode, ChangeFeed, EntityBackend};
use crate::entity::{ChangeEvent, ChangeOp, EntityKind, ListFilter, RecordId};
use crate::error::BackendError;

/// Tables shared by one or more memory backends.
pub struct MemoryDataset {
    tables: DashMap<EntityKind, Vec<Value>>,
    next_id: AtomicI64,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryDataset {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            tables: DashMap::new(),
            next_id: AtomicI64::new(1),
            events,
        }
    }

    /// Snapshot of one table, in insertion order.
    #[must_use]
    pub fn records(&self, kind: EntityKind) -> Vec<Value> {
        self.tables.get(&kind).map(|rows| rows.clone()).unwrap_or_default()
    }

    fn publish(&self, kind: EntityKind, operation: ChangeOp, record: Value) {
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.events.send(ChangeEvent::new(kind, operation, record));
    }

    /// Insert a record, assigning `id` and audit timestamps.
    pub fn insert(&self, kind: EntityKind, payload: &Value) -> Result<Value, BackendError> {
        let Value::Object(fields) = payload else {
            return Err(BackendError::Status { status: 400, message: "payload must be an object".into() });
        };
        let mut record = Value::Object(fields.clone());

        let mut rows = self.tables.entry(kind).or_default();
        if let Some(id) = kind.record_id_of(&record) {
            if rows.iter().any(|row| id.matches(row)) {
                return Err(BackendError::Status { status: 409, message: format!("duplicate {} {}", kind, id) });
            }
        }
        if record.get("id").map_or(true, Value::is_null) {
            record["id"] = Value::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        }
        let now = timestamp();
        record["created_at"] = Value::from(now.clone());
        record["updated_at"] = Value::from(now);
        rows.push(record.clone());
        drop(rows);

        self.publish(kind, ChangeOp::Insert, record.clone());
        Ok(record)
    }

    /// Merge fields into an existing record and bump `updated_at`.
    pub fn merge(&self, kind: EntityKind, id: &RecordId, payload: &Value) -> Result<Value, BackendError> {
        let Value::Object(fields) = payload else {
            return Err(BackendError::Status { status: 400, message: "payload must be an object".into() });
        };
        let mut rows = self.tables.entry(kind).or_default();
        let row = rows.iter_mut().find(|row| id.matches(row)).ok_or(BackendError::NotFound)?;
        for (field, value) in fields {
            if field != "id" && field != "created_at" {
                row[field.as_str()] = value.clone();
            }
        }
        row["updated_at"] = Value::from(timestamp());
        let record = row.clone();
        drop(rows);

        self.publish(kind, ChangeOp::Update, record.clone());
        Ok(record)
    }

    pub fn remove(&self, kind: EntityKind, id: &RecordId) -> Result<Value, BackendError> {
        let mut rows = self.tables.entry(kind).or_default();
        let index = rows.iter().position(|row| id.matches(row)).ok_or(BackendError::NotFound)?;
        let record = rows.remove(index);
        drop(rows);

        self.publish(kind, ChangeOp::Delete, record.clone());
        Ok(record)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

impl Default for MemoryDataset {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A [`EntityBackend`] over a [`MemoryDataset`]. Cheap to clone; clones
/// share state, so a test can keep a handle after registering it.
#[derive(Clone)]
pub struct MemoryBackend {
    mode: BackendMode,
    data: Arc<MemoryDataset>,
    available: Arc<AtomicBool>,
    latency: Arc<Mutex<Duration>>,
    calls: Arc<AtomicU64>,
}

impl MemoryBackend {
    /// A backend with its own empty dataset.
    pub fn new(mode: BackendMode) -> Self {
        Self::with_dataset(mode, Arc::new(MemoryDataset::new()))
    }

    /// A backend for `mode` fronting the same data as `other`.
    pub fn sharing(mode: BackendMode, other: &MemoryBackend) -> Self {
        Self::with_dataset(mode, other.data.clone())
    }

    pub fn with_dataset(mode: BackendMode, data: Arc<MemoryDataset>) -> Self {
        Self {
            mode,
            data,
            available: Arc::new(AtomicBool::new(true)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn dataset(&self) -> &Arc<MemoryDataset> {
        &self.data
    }

    /// Simulate the backend going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Delay applied before every call (tokio time, so paused tests can advance past it).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Calls made against this backend, including failed ones.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn enter(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::Connection(format!("{} is offline", self.mode)))
        }
    }
}

#[async_trait]
impl EntityBackend for MemoryBackend {
    fn mode(&self) -> BackendMode {
        self.mode
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.enter().await
    }

    async fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError> {
        self.enter().await?;
        Ok(filter.apply(self.data.records(kind)))
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Value, BackendError> {
        self.enter().await?;
        self.data
            .records(kind)
            .into_iter()
            .find(|row| id.matches(row))
            .ok_or(BackendError::NotFound)
    }

    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Value, BackendError> {
        self.enter().await?;
        self.data.insert(kind, payload)
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, payload: &Value) -> Result<Value, BackendError> {
        self.enter().await?;
        self.data.merge(kind, id, payload)
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), BackendError> {
        self.enter().await?;
        self.data.remove(kind, id).map(|_| ())
    }

    async fn open_feed(&self, kind: EntityKind) -> Result<Option<ChangeFeed>, BackendError> {
        if !self.mode.supports_push() {
            return Ok(None);
        }
        self.enter().await?;

        let rx = self.data.subscribe();
        let feed = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.entity == kind => return Some((Ok(event), rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Some((Err(BackendError::Unavailable("change feed lagged".into())), rx))
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Some(feed.boxed()))
    }
}
