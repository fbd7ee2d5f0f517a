// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence fallback: the durable mutation queue.
//!
//! When every backend is unreachable, a create/update/delete is stored in
//! the local SQLite `mutation_queue` table and reported to the caller as
//! queued. A drain pass later delivers the queue through the entity client.
//!
//! # Drain rules
//!
//! - FIFO by insertion sequence, one mutation at a time, state persisted
//!   after every step; a row left in flight by a crash is queued again at
//!   the start of the next pass
//! - Delivered → row deleted
//! - Transient failure → attempts incremented, pass stops (order is kept,
//!   nothing skips ahead)
//! - Attempts reach the configured maximum → permanently failed, kept for
//!   the user to resubmit or discard, excluded from later drains
//! - Rejected by the server → permanently failed at once (retrying cannot help)
//! - Only one drain runs at a time; a concurrent call returns immediately
//!
//! # Mutation lifecycle
//!
//! ```text
//! Pending ──→ InFlight ──┬──→ Succeeded          (terminal)
//!                        ├──→ Queued ──→ InFlight (each drain attempt)
//!                        └──→ PermanentlyFailed  (terminal)
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::EntityClient;
use crate::entity::{EntityKind, RecordId};
use crate::error::ClientError;
use crate::metrics;
use crate::state::{LocalStore, QueueRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown mutation operation '{}'", other)),
        }
    }
}

/// A write, with exactly the inputs its operation needs.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRequest {
    Create { payload: Value },
    Update { id: RecordId, payload: Value },
    Delete { id: RecordId },
}

impl MutationRequest {
    #[must_use]
    pub fn operation(&self) -> MutationOp {
        match self {
            Self::Create { .. } => MutationOp::Create,
            Self::Update { .. } => MutationOp::Update,
            Self::Delete { .. } => MutationOp::Delete,
        }
    }

    #[must_use]
    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            Self::Create { .. } => None,
            Self::Update { id, .. } | Self::Delete { id } => Some(id),
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Create { payload } | Self::Update { payload, .. } => Some(payload),
            Self::Delete { .. } => None,
        }
    }
}

/// Lifecycle of one mutation. Stored in the `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    InFlight,
    Succeeded,
    Queued,
    PermanentlyFailed,
}

impl MutationState {
    #[must_use]
    pub fn can_transition_to(&self, next: MutationState) -> bool {
        use MutationState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Succeeded)
                | (InFlight, Queued)
                | (InFlight, PermanentlyFailed)
                | (Queued, InFlight)
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PermanentlyFailed)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Queued => "queued",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "succeeded" => Ok(Self::Succeeded),
            "queued" => Ok(Self::Queued),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(format!("unknown mutation state '{}'", other)),
        }
    }
}

/// A write stored for later delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
    pub id: String,
    pub entity: EntityKind,
    pub request: MutationRequest,
    pub state: MutationState,
    pub attempts_made: u32,
    pub queued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueuedMutation {
    pub fn new(entity: EntityKind, request: MutationRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity,
            request,
            state: MutationState::Pending,
            attempts_made: 0,
            queued_at: Utc::now(),
            last_error: None,
        }
    }

    #[must_use]
    pub fn operation(&self) -> MutationOp {
        self.request.operation()
    }

    fn to_row(&self) -> Result<QueueRow, ClientError> {
        let encode = |e: serde_json::Error| ClientError::Storage(format!("encode mutation: {}", e));
        Ok(QueueRow {
            seq: 0,
            id: self.id.clone(),
            entity: self.entity.table().to_string(),
            operation: self.operation().as_str().to_string(),
            record_id: self.request.record_id().map(serde_json::to_string).transpose().map_err(encode)?,
            payload: self.request.payload().map(serde_json::to_string).transpose().map_err(encode)?,
            attempts: i64::from(self.attempts_made),
            queued_at: self.queued_at.to_rfc3339(),
            state: self.state.as_str().to_string(),
            last_error: self.last_error.clone(),
        })
    }

    fn from_row(row: QueueRow) -> Result<Self, String> {
        let entity: EntityKind = row.entity.parse()?;
        let operation: MutationOp = row.operation.parse()?;
        let state: MutationState = row.state.parse()?;
        let record_id: Option<RecordId> = row
            .record_id
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| format!("bad record id: {}", e))?;
        let payload: Option<Value> = row
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| format!("bad payload: {}", e))?;

        let request = match (operation, record_id, payload) {
            (MutationOp::Create, _, Some(payload)) => MutationRequest::Create { payload },
            (MutationOp::Update, Some(id), Some(payload)) => MutationRequest::Update { id, payload },
            (MutationOp::Delete, Some(id), _) => MutationRequest::Delete { id },
            (op, _, _) => return Err(format!("{} mutation is missing its inputs", op)),
        };
        let queued_at = DateTime::parse_from_rfc3339(&row.queued_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("bad timestamp: {}", e))?;

        Ok(Self {
            id: row.id,
            entity,
            request,
            state,
            attempts_made: u32::try_from(row.attempts).unwrap_or(0),
            queued_at,
            last_error: row.last_error,
        })
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// "Saved, will sync"
    Queued { mutation_id: String, entity: EntityKind },
    Delivered { mutation_id: String, entity: EntityKind },
    /// Needs manual resubmission
    PermanentlyFailed { mutation_id: String, entity: EntityKind, error: ClientError },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub permanently_failed: usize,
    /// Mutation the pass stopped on after a transient failure
    pub stopped_on: Option<String>,
    /// Queued mutations left after the pass
    pub remaining: u64,
    /// Another drain was already running
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub permanently_failed: u64,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct QueueInner {
    store: LocalStore,
    draining: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    pub fn new(store: LocalStore) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(QueueInner {
                store,
                draining: AtomicBool::new(false),
                events,
            }),
        }
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No listeners is fine.
        let _ = self.inner.events.send(event);
    }

    /// Append a mutation to the durable queue. It enters as `Queued`,
    /// whatever state it carries.
    pub async fn enqueue(&self, mutation: &QueuedMutation) -> Result<(), ClientError> {
        let row = QueuedMutation {
            state: MutationState::Queued,
            ..mutation.clone()
        }
        .to_row()?;
        let seq = self.inner.store.push_mutation(&row).await?;
        info!(
            id = %mutation.id,
            entity = %mutation.entity,
            operation = %mutation.operation(),
            seq,
            "Mutation queued for later delivery"
        );
        metrics::record_mutation_queued(mutation.entity.table());
        self.refresh_depth().await;
        self.emit(QueueEvent::Queued {
            mutation_id: mutation.id.clone(),
            entity: mutation.entity,
        });
        Ok(())
    }

    async fn load(&self, state: MutationState) -> Result<Vec<QueuedMutation>, ClientError> {
        let rows = self.inner.store.mutations_in_state(state.as_str(), None).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                QueuedMutation::from_row(row)
                    .map_err(|e| warn!(id = %id, error = %e, "Skipping undecodable queue row"))
                    .ok()
            })
            .collect())
    }

    /// Mutations awaiting delivery, oldest first.
    pub async fn pending(&self) -> Result<Vec<QueuedMutation>, ClientError> {
        self.load(MutationState::Queued).await
    }

    /// Mutations that exhausted their retries or were rejected.
    pub async fn failed(&self) -> Result<Vec<QueuedMutation>, ClientError> {
        self.load(MutationState::PermanentlyFailed).await
    }

    pub async fn len(&self) -> Result<u64, ClientError> {
        self.inner.store.count_mutations(MutationState::Queued.as_str()).await
    }

    pub async fn is_empty(&self) -> Result<bool, ClientError> {
        Ok(self.len().await? == 0)
    }

    pub async fn stats(&self) -> Result<QueueStats, ClientError> {
        Ok(QueueStats {
            queued: self.inner.store.count_mutations(MutationState::Queued.as_str()).await?,
            permanently_failed: self.inner.store.count_mutations(MutationState::PermanentlyFailed.as_str()).await?,
        })
    }

    /// Drop a mutation (typically a permanently failed one the user gave up on).
    pub async fn discard(&self, mutation_id: &str) -> Result<bool, ClientError> {
        let removed = self.inner.store.delete_mutation(mutation_id).await?;
        if removed {
            debug!(id = %mutation_id, "Mutation discarded");
            self.refresh_depth().await;
        }
        Ok(removed)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    async fn refresh_depth(&self) {
        if let Ok(depth) = self.len().await {
            metrics::set_queue_depth(depth as usize);
        }
    }

    /// Move `mutation` to `next`, persisting attempts and error with it.
    /// `Succeeded` removes the row.
    async fn transition(
        &self,
        mutation: &mut QueuedMutation,
        next: MutationState,
        attempts: u32,
        error: Option<String>,
    ) -> Result<(), ClientError> {
        if !mutation.state.can_transition_to(next) {
            return Err(ClientError::Storage(format!(
                "mutation {} cannot move from {} to {}",
                mutation.id, mutation.state, next
            )));
        }
        if next == MutationState::Succeeded {
            self.inner.store.delete_mutation(&mutation.id).await?;
        } else {
            let error = error.or_else(|| mutation.last_error.clone());
            self.inner
                .store
                .update_mutation(&mutation.id, i64::from(attempts), next.as_str(), error.as_deref())
                .await?;
            mutation.last_error = error;
        }
        mutation.state = next;
        mutation.attempts_made = attempts;
        Ok(())
    }

    /// Rows a crashed drain left in flight go back to the queue, keeping
    /// their place.
    async fn requeue_in_flight(&self) -> Result<(), ClientError> {
        let stuck = self
            .inner
            .store
            .mutations_in_state(MutationState::InFlight.as_str(), None)
            .await?;
        for row in stuck {
            warn!(id = %row.id, "Requeueing mutation interrupted mid-delivery");
            self.inner
                .store
                .update_mutation(&row.id, row.attempts, MutationState::Queued.as_str(), row.last_error.as_deref())
                .await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, mutation: &mut QueuedMutation, attempts: u32, error: ClientError) -> Result<(), ClientError> {
        let message = error.to_string();
        self.transition(mutation, MutationState::PermanentlyFailed, attempts, Some(message.clone()))
            .await?;
        warn!(
            id = %mutation.id,
            entity = %mutation.entity,
            attempts,
            error = %message,
            "Queued mutation failed permanently"
        );
        metrics::record_permanent_failure(mutation.entity.table());
        self.emit(QueueEvent::PermanentlyFailed {
            mutation_id: mutation.id.clone(),
            entity: mutation.entity,
            error: ClientError::PermanentFailure {
                mutation_id: mutation.id.clone(),
                attempts,
                last_error: message,
            },
        });
        Ok(())
    }

    /// Deliver queued mutations in FIFO order until the queue is empty or
    /// a transient failure stops the pass.
    #[tracing::instrument(skip(self, client))]
    pub async fn drain(&self, client: &EntityClient) -> Result<DrainReport, ClientError> {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            // Already draining
            return Ok(DrainReport { skipped: true, ..Default::default() });
        }
        let _guard = DrainGuard(&self.inner.draining);

        let max_attempts = client.context().config().max_queue_attempts.max(1);
        let mut report = DrainReport::default();
        self.requeue_in_flight().await?;

        loop {
            let Some(row) = self
                .inner
                .store
                .mutations_in_state(MutationState::Queued.as_str(), Some(1))
                .await?
                .into_iter()
                .next()
            else {
                break;
            };

            let row_id = row.id.clone();
            let mut mutation = match QueuedMutation::from_row(row) {
                Ok(mutation) => mutation,
                Err(e) => {
                    warn!(id = %row_id, error = %e, "Undecodable queue row marked failed");
                    self.inner
                        .store
                        .update_mutation(&row_id, 0, MutationState::PermanentlyFailed.as_str(), Some(e.as_str()))
                        .await?;
                    report.permanently_failed += 1;
                    continue;
                }
            };

            let attempts = mutation.attempts_made + 1;
            let made = mutation.attempts_made;
            self.transition(&mut mutation, MutationState::InFlight, made, None).await?;
            match client.deliver(&mutation).await {
                Ok(_) => {
                    self.finish_delivered(&mut mutation, attempts).await?;
                    report.delivered += 1;
                }
                // Already gone is what a delete wanted.
                Err(ClientError::NotFound(_)) if mutation.operation() == MutationOp::Delete => {
                    self.finish_delivered(&mut mutation, attempts).await?;
                    report.delivered += 1;
                }
                Err(e) if e.is_retryable() => {
                    if attempts >= max_attempts {
                        self.mark_failed(&mut mutation, attempts, e).await?;
                        report.permanently_failed += 1;
                    } else {
                        self.transition(&mut mutation, MutationState::Queued, attempts, Some(e.to_string()))
                            .await?;
                        debug!(id = %mutation.id, attempts, max_attempts, "Delivery failed, will retry");
                    }
                    report.stopped_on = Some(mutation.id.clone());
                    break;
                }
                Err(e) => {
                    self.mark_failed(&mut mutation, attempts, e).await?;
                    report.permanently_failed += 1;
                }
            }
        }

        report.remaining = self.len().await?;
        metrics::set_queue_depth(report.remaining as usize);
        metrics::record_drain(report.delivered, report.stopped_on.is_some());
        if report.delivered > 0 || report.permanently_failed > 0 {
            info!(
                delivered = report.delivered,
                failed = report.permanently_failed,
                remaining = report.remaining,
                "Mutation queue drained"
            );
        }
        Ok(report)
    }

    async fn finish_delivered(&self, mutation: &mut QueuedMutation, attempts: u32) -> Result<(), ClientError> {
        self.transition(mutation, MutationState::Succeeded, attempts, None).await?;
        debug!(id = %mutation.id, entity = %mutation.entity, "Queued mutation delivered");
        self.emit(QueueEvent::Delivered {
            mutation_id: mutation.id.clone(),
            entity: mutation.entity,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_machine() {
        use MutationState::*;
        assert!(Pending.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Queued));
        assert!(Queued.can_transition_to(InFlight));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(InFlight));
        assert!(!PermanentlyFailed.can_transition_to(InFlight));
        assert!(Succeeded.is_terminal() && PermanentlyFailed.is_terminal());
        assert!(!Queued.is_terminal());
    }

    #[test]
    fn test_state_column_names() {
        use MutationState::*;
        for state in [Pending, InFlight, Succeeded, Queued, PermanentlyFailed] {
            assert_eq!(state.as_str().parse::<MutationState>(), Ok(state));
        }
        assert!("done".parse::<MutationState>().is_err());
    }

    #[tokio::test]
    async fn test_in_flight_row_is_requeued_in_place() {
        let store = LocalStore::open(None).await.unwrap();
        let queue = MutationQueue::new(store.clone());
        let first = QueuedMutation::new(EntityKind::News, MutationRequest::Delete { id: RecordId::from(1) });
        let second = QueuedMutation::new(EntityKind::News, MutationRequest::Delete { id: RecordId::from(2) });
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        // Simulate a crash after the first row was marked in flight
        store
            .update_mutation(&first.id, 2, MutationState::InFlight.as_str(), Some("timeout"))
            .await
            .unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        queue.requeue_in_flight().await.unwrap();
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[0].state, MutationState::Queued);
        assert_eq!(pending[0].attempts_made, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_refused() {
        let queue = MutationQueue::new(LocalStore::open(None).await.unwrap());
        let mut mutation = QueuedMutation::new(EntityKind::News, MutationRequest::Delete { id: RecordId::from(1) });
        queue.enqueue(&mutation).await.unwrap();
        mutation.state = MutationState::Queued;

        let err = queue
            .transition(&mut mutation, MutationState::Succeeded, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Storage(_)));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[test]
    fn test_row_roundtrip_keeps_inputs() {
        let mutation = QueuedMutation::new(
            EntityKind::PageContent,
            MutationRequest::Update {
                id: RecordId::composite("home", "hero_title"),
                payload: json!({"content_value": "Hello"}),
            },
        );
        let row = mutation.to_row().unwrap();
        assert_eq!(row.operation, "update");
        let back = QueuedMutation::from_row(row).unwrap();
        assert_eq!(back.request, mutation.request);
        assert_eq!(back.entity, EntityKind::PageContent);
    }

    #[test]
    fn test_row_missing_inputs_rejected() {
        let mut row = QueuedMutation::new(EntityKind::News, MutationRequest::Delete { id: RecordId::from(3) })
            .to_row()
            .unwrap();
        row.record_id = None;
        assert!(QueuedMutation::from_row(row).is_err());
    }

    #[tokio::test]
    async fn test_enqueue_emits_and_persists() {
        let queue = MutationQueue::new(LocalStore::open(None).await.unwrap());
        let mut events = queue.subscribe_events();

        let mutation = QueuedMutation::new(
            EntityKind::Inquiries,
            MutationRequest::Create { payload: json!({"name": "Ada"}) },
        );
        queue.enqueue(&mutation).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(queue.pending().await.unwrap()[0].id, mutation.id);
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Queued { .. }));

        assert!(queue.discard(&mutation.id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }
}
