// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change subscriber.
//!
//! Turns remote changes into a stream of [`ChangeEvent`]s, one background
//! task per entity:
//!
//! ```text
//!             ┌─ push feed (direct-service) ─────────────┐
//! active mode ┤                                          ├──▶ bounded channel ──▶ Subscription
//!             └─ poll list() every interval, diff ───────┘
//! ```
//!
//! The subscriber does not deduplicate; the reconciler orders events by
//! timestamp. Dropped feeds and failed polls reconnect with capped backoff
//! and are never surfaced to the consumer. A feed that is refused outright,
//! or drops [`FEED_ATTEMPTS_BEFORE_POLLING`] times running, is replaced by
//! polling for [`FALLBACK_POLLS`] intervals before push is tried again. A
//! mode switch re-selects push or polling on the new backend.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, trace};

use crate::backend::{BackendMode, ChangeFeed, EntityBackend};
use crate::context::ClientContext;
use crate::entity::{ChangeEvent, ChangeOp, EntityKind, ListFilter};
use crate::error::BackendError;
use crate::metrics;
use crate::probe::BackendProbe;

/// Consecutive transient feed failures tolerated before polling instead.
pub const FEED_ATTEMPTS_BEFORE_POLLING: u32 = 3;

/// Poll intervals to spend on polling before retrying a refused feed.
pub const FALLBACK_POLLS: u32 = 10;

#[derive(Clone)]
pub struct ChangeSubscriber {
    ctx: ClientContext,
}

impl ChangeSubscriber {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Start watching one entity.
    pub fn subscribe(&self, kind: EntityKind) -> Subscription {
        self.subscribe_all(&[kind])
    }

    /// Watch several entities through one stream. Events of the same
    /// entity keep their order.
    pub fn subscribe_all(&self, kinds: &[EntityKind]) -> Subscription {
        let capacity = self.ctx.config().channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let tasks = kinds
            .iter()
            .map(|&kind| tokio::spawn(watch_entity(self.ctx.clone(), kind, tx.clone())))
            .collect();
        debug!(entities = ?kinds, "Subscribed to entity changes");
        Subscription {
            kinds: kinds.to_vec(),
            rx,
            tasks,
            closed: false,
        }
    }
}

/// Live change stream. Dropping it unsubscribes.
pub struct Subscription {
    kinds: Vec<EntityKind>,
    rx: mpsc::Receiver<ChangeEvent>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Subscription {
    #[must_use]
    pub fn kinds(&self) -> &[EntityKind] {
        &self.kinds
    }

    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Stop watching. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in &self.tasks {
            task.abort();
        }
        self.rx.close();
        debug!(entities = ?self.kinds, "Unsubscribed from entity changes");
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.closed && self.tasks.iter().any(|t| !t.is_finished())
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Why a feed or poll loop returned.
enum Interrupt {
    /// Consumer went away.
    Closed,
    /// The active mode switched; re-select on the new backend.
    ModeChanged,
    /// Transport failure; reconnect after backoff.
    Dropped(BackendError),
    /// Fallback polling ran its course; try the push feed again.
    RetryFeed,
}

async fn watch_entity(ctx: ClientContext, kind: EntityKind, tx: mpsc::Sender<ChangeEvent>) {
    let probe = BackendProbe::new(ctx.clone());
    let mut mode_rx = ctx.mode_receiver();
    let mut snapshot: Option<Vec<Value>> = None;
    let mut failures: u32 = 0;
    let mut feed_failures: u32 = 0;
    let mut feed_refused = false;

    loop {
        if tx.is_closed() {
            return;
        }
        let mode = probe.ensure_mode().await;
        mode_rx.borrow_and_update();

        let interrupt = match ctx.backend(mode) {
            Some(backend) => {
                let feed = if feed_refused {
                    Ok(None)
                } else {
                    backend.open_feed(kind).await
                };
                match feed {
                    Ok(Some(feed)) => {
                        failures = 0;
                        feed_failures = 0;
                        // Events missed between snapshot and feed are not replayed.
                        snapshot = None;
                        trace!(entity = %kind, mode = %mode, "Push feed opened");
                        forward_feed(feed, &tx, &mut mode_rx).await
                    }
                    Ok(None) => {
                        let budget = feed_refused.then_some(FALLBACK_POLLS);
                        poll_changes(&ctx, &backend, kind, &tx, &mut snapshot, &mut mode_rx, &mut failures, budget).await
                    }
                    Err(e) => {
                        feed_failures = feed_failures.saturating_add(1);
                        if !e.is_transient() || feed_failures >= FEED_ATTEMPTS_BEFORE_POLLING {
                            debug!(entity = %kind, mode = %mode, error = %e, "Push feed unavailable, polling instead");
                            feed_refused = true;
                            poll_changes(&ctx, &backend, kind, &tx, &mut snapshot, &mut mode_rx, &mut failures, Some(FALLBACK_POLLS))
                                .await
                        } else {
                            Interrupt::Dropped(e)
                        }
                    }
                }
            }
            None => Interrupt::Dropped(BackendError::Unavailable(format!("{} is not configured", mode))),
        };

        match interrupt {
            Interrupt::Closed => return,
            Interrupt::ModeChanged => {
                feed_refused = false;
                feed_failures = 0;
                debug!(entity = %kind, mode = ?ctx.active_mode(), "Mode changed, resubscribing");
            }
            Interrupt::RetryFeed => {
                feed_refused = false;
                trace!(entity = %kind, "Retrying push feed");
            }
            Interrupt::Dropped(e) => {
                let delay = ctx.config().reconnect_config().delay_for(failures);
                failures = failures.saturating_add(1);
                metrics::record_subscriber_reconnect(kind.table());
                debug!(entity = %kind, error = %e, ?delay, "Change feed dropped, reconnecting");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = tx.closed() => return,
                }
            }
        }
    }
}

async fn forward_feed(
    mut feed: ChangeFeed,
    tx: &mpsc::Sender<ChangeEvent>,
    mode_rx: &mut watch::Receiver<Option<BackendMode>>,
) -> Interrupt {
    loop {
        tokio::select! {
            item = feed.next() => match item {
                Some(Ok(event)) => {
                    if tx.send(event).await.is_err() {
                        return Interrupt::Closed;
                    }
                }
                Some(Err(e)) => return Interrupt::Dropped(e),
                None => return Interrupt::Dropped(BackendError::Connection("change feed closed".into())),
            },
            changed = mode_rx.changed() => {
                return if changed.is_ok() { Interrupt::ModeChanged } else { Interrupt::Closed };
            }
            _ = tx.closed() => return Interrupt::Closed,
        }
    }
}

/// Poll and diff until interrupted, or until `budget` polls have run.
#[allow(clippy::too_many_arguments)]
async fn poll_changes(
    ctx: &ClientContext,
    backend: &Arc<dyn EntityBackend>,
    kind: EntityKind,
    tx: &mpsc::Sender<ChangeEvent>,
    snapshot: &mut Option<Vec<Value>>,
    mode_rx: &mut watch::Receiver<Option<BackendMode>>,
    failures: &mut u32,
    mut budget: Option<u32>,
) -> Interrupt {
    let config = ctx.config();
    let mut ticker = interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let filter = ListFilter::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match budget.as_mut() {
                    Some(0) => return Interrupt::RetryFeed,
                    Some(left) => *left -= 1,
                    None => {}
                }
                let rows = match timeout(config.timeout(), backend.list(kind, &filter)).await {
                    Ok(Ok(rows)) => rows,
                    Ok(Err(e)) => return Interrupt::Dropped(e),
                    Err(_) => return Interrupt::Dropped(BackendError::Timeout),
                };
                *failures = 0;
                if let Some(previous) = snapshot.as_deref() {
                    for event in diff_snapshot(kind, previous, &rows) {
                        if tx.send(event).await.is_err() {
                            return Interrupt::Closed;
                        }
                    }
                }
                *snapshot = Some(rows);
            }
            changed = mode_rx.changed() => {
                return if changed.is_ok() { Interrupt::ModeChanged } else { Interrupt::Closed };
            }
            _ = tx.closed() => return Interrupt::Closed,
        }
    }
}

/// Events that turn `previous` into `current`.
///
/// Records are matched by identity. A record counts as changed when its
/// `updated_at` differs, or when it has none and any field differs.
/// Records without an identity are ignored.
pub fn diff_snapshot(kind: EntityKind, previous: &[Value], current: &[Value]) -> Vec<ChangeEvent> {
    let key = |record: &Value| kind.record_id_of(record).map(|id| id.to_string());
    let before: HashMap<String, &Value> = previous.iter().filter_map(|r| Some((key(r)?, r))).collect();

    let mut events = Vec::new();
    let mut seen = Vec::with_capacity(current.len());
    for record in current {
        let Some(id) = key(record) else { continue };
        match before.get(&id) {
            None => events.push(ChangeEvent::new(kind, ChangeOp::Insert, record.clone())),
            Some(old) if changed(old, record) => {
                events.push(ChangeEvent::new(kind, ChangeOp::Update, record.clone()));
            }
            Some(_) => {}
        }
        seen.push(id);
    }
    for record in previous {
        match key(record) {
            Some(id) if !seen.contains(&id) => events.push(ChangeEvent::new(kind, ChangeOp::Delete, record.clone())),
            _ => {}
        }
    }
    events
}

fn changed(old: &Value, new: &Value) -> bool {
    match (old.get("updated_at"), new.get("updated_at")) {
        (Some(a), Some(b)) if !a.is_null() && !b.is_null() => a != b,
        _ => old != new,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSet, MemoryBackend};
    use crate::config::ClientConfig;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_diff_detects_insert_update_delete() {
        let previous = vec![
            json!({"id": 1, "name": "A", "updated_at": "2026-01-01T00:00:00Z"}),
            json!({"id": 2, "name": "B", "updated_at": "2026-01-01T00:00:00Z"}),
        ];
        let current = vec![
            json!({"id": 1, "name": "A2", "updated_at": "2026-01-02T00:00:00Z"}),
            json!({"id": 3, "name": "C"}),
        ];
        let events = diff_snapshot(EntityKind::Products, &previous, &current);
        let ops: Vec<_> = events.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![ChangeOp::Update, ChangeOp::Insert, ChangeOp::Delete]);
        assert_eq!(events[2].record["id"], 2);
    }

    #[test]
    fn test_diff_same_timestamp_is_unchanged() {
        let rows = vec![json!({"id": 1, "name": "A", "updated_at": "2026-01-01T00:00:00Z"})];
        assert!(diff_snapshot(EntityKind::News, &rows, &rows).is_empty());

        // Without timestamps any field change counts.
        let before = vec![json!({"setting_key": "phone", "setting_value": "1", "id": 4})];
        let after = vec![json!({"setting_key": "phone", "setting_value": "2", "id": 4})];
        assert_eq!(diff_snapshot(EntityKind::SiteSettings, &before, &after).len(), 1);
    }

    #[test]
    fn test_diff_uses_composite_identity() {
        let before = vec![json!({"page_name": "home", "content_key": "hero_title", "content_value": "Hi"})];
        let after = vec![json!({"page_name": "home", "content_key": "hero_title", "content_value": "Hello"})];
        let events = diff_snapshot(EntityKind::PageContent, &before, &after);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, ChangeOp::Update);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_feed_delivers_events() {
        let backend = MemoryBackend::new(BackendMode::DirectService);
        let ctx = ClientContext::new(ClientConfig::default(), BackendSet::new().with(backend.clone()));
        ctx.set_active_mode(BackendMode::DirectService);

        let mut sub = ChangeSubscriber::new(ctx).subscribe(EntityKind::News);
        sleep(Duration::from_millis(10)).await;

        backend
            .dataset()
            .insert(EntityKind::Products, &json!({"name": "ignored", "category": "x"}))
            .unwrap();
        backend
            .dataset()
            .insert(EntityKind::News, &json!({"title": "Launch", "content": "..."}))
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.entity, EntityKind::News);
        assert_eq!(event.operation, ChangeOp::Insert);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_mode_emits_after_baseline() {
        let backend = MemoryBackend::new(BackendMode::LocalOrigin);
        backend
            .dataset()
            .insert(EntityKind::Products, &json!({"name": "Existing", "category": "x"}))
            .unwrap();
        let ctx = ClientContext::new(ClientConfig::default(), BackendSet::new().with(backend.clone()));

        let mut sub = ChangeSubscriber::new(ctx.clone()).subscribe(EntityKind::Products);
        sleep(Duration::from_millis(10)).await;

        backend
            .dataset()
            .insert(EntityKind::Products, &json!({"name": "New", "category": "x"}))
            .unwrap();
        sleep(ctx.config().poll_interval()).await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.operation, ChangeOp::Insert);
        assert_eq!(event.record["name"], "New");
    }

    /// Direct-service backend whose realtime endpoint answers with `status`.
    struct RefusedFeed {
        inner: MemoryBackend,
        status: u16,
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EntityBackend for RefusedFeed {
        fn mode(&self) -> BackendMode {
            BackendMode::DirectService
        }
        async fn health_check(&self) -> Result<(), BackendError> {
            self.inner.health_check().await
        }
        async fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError> {
            self.inner.list(kind, filter).await
        }
        async fn get(&self, kind: EntityKind, id: &crate::entity::RecordId) -> Result<Value, BackendError> {
            self.inner.get(kind, id).await
        }
        async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Value, BackendError> {
            self.inner.create(kind, payload).await
        }
        async fn update(&self, kind: EntityKind, id: &crate::entity::RecordId, payload: &Value) -> Result<Value, BackendError> {
            self.inner.update(kind, id, payload).await
        }
        async fn delete(&self, kind: EntityKind, id: &crate::entity::RecordId) -> Result<(), BackendError> {
            self.inner.delete(kind, id).await
        }
        async fn open_feed(&self, _kind: EntityKind) -> Result<Option<ChangeFeed>, BackendError> {
            self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(BackendError::Status { status: self.status, message: "realtime disabled".into() })
        }
    }

    async fn refused_feed_delivers_by_polling(status: u16) -> usize {
        let inner = MemoryBackend::new(BackendMode::DirectService);
        let backend = Arc::new(RefusedFeed { inner: inner.clone(), status, attempts: Default::default() });
        let mut set = BackendSet::new();
        set.insert(backend.clone());
        let ctx = ClientContext::new(ClientConfig::default(), set);
        ctx.set_active_mode(BackendMode::DirectService);

        let mut sub = ChangeSubscriber::new(ctx.clone()).subscribe(EntityKind::Products);
        // Allow for the reconnect backoff before polling takes over
        sleep(Duration::from_secs(30)).await;
        inner
            .dataset()
            .insert(EntityKind::Products, &json!({"name": "New", "category": "x"}))
            .unwrap();

        let event = timeout(ctx.config().poll_interval() * 3, sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.operation, ChangeOp::Insert);
        assert_eq!(event.record["name"], "New");
        backend.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_feed_falls_back_to_polling() {
        assert_eq!(refused_feed_delivers_by_polling(404).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_feed_falls_back_to_polling() {
        let attempts = refused_feed_delivers_by_polling(503).await;
        assert_eq!(attempts, FEED_ATTEMPTS_BEFORE_POLLING as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_feed_is_retried_after_fallback_polls() {
        let inner = MemoryBackend::new(BackendMode::DirectService);
        let backend = Arc::new(RefusedFeed { inner, status: 404, attempts: Default::default() });
        let mut set = BackendSet::new();
        set.insert(backend.clone());
        let ctx = ClientContext::new(ClientConfig::default(), set);
        ctx.set_active_mode(BackendMode::DirectService);

        let _sub = ChangeSubscriber::new(ctx.clone()).subscribe(EntityKind::Products);
        sleep(ctx.config().poll_interval() * (FALLBACK_POLLS + 1)).await;
        assert_eq!(backend.attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_polls_reconnect_silently() {
        let backend = MemoryBackend::new(BackendMode::LocalOrigin);
        let ctx = ClientContext::new(ClientConfig::default(), BackendSet::new().with(backend.clone()));
        ctx.set_active_mode(BackendMode::LocalOrigin);

        let mut sub = ChangeSubscriber::new(ctx.clone()).subscribe(EntityKind::News);
        sleep(Duration::from_millis(10)).await;
        backend.set_available(false);
        sleep(ctx.config().poll_interval() * 2).await;
        backend.set_available(true);
        backend
            .dataset()
            .insert(EntityKind::News, &json!({"title": "Back", "content": "online"}))
            .unwrap();

        // The pre-outage snapshot survives the reconnect, so the insert is seen.
        let event = timeout(ctx.config().poll_interval() * 4, sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.operation, ChangeOp::Insert);
        assert_eq!(event.record["title"], "Back");
        assert!(sub.is_active());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let backend = MemoryBackend::new(BackendMode::LocalOrigin);
        let ctx = ClientContext::new(ClientConfig::default(), BackendSet::new().with(backend));
        let mut sub = ChangeSubscriber::new(ctx).subscribe_all(&[EntityKind::News, EntityKind::Products]);
        assert_eq!(sub.kinds().len(), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(sub.recv().await, None);
    }
}
