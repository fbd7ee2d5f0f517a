// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Orchestration: wires probe, queue, reconciler and subscriber together.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start()──▶ Probing ──▶ Draining ──▶ Reconciling ──▶ Ready
//!                                                                 │
//!                                            run() ◀──────────────┘
//!                                              │
//!   drain tick ─── drain queue                 ▼
//!   mode change ── drain queue (regained)   Running ──shutdown()──▶ ShuttingDown
//!   degraded ───── re-probe every poll interval
//!   config ─────── apply to context
//!   change event ─ reconcile into the document
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::EntityClient;
use crate::config::ClientConfig;
use crate::context::ClientContext;
use crate::entity::EntityKind;
use crate::error::ClientError;
use crate::metrics;
use crate::probe::{BackendProbe, ProbeReport};
use crate::queue::DrainReport;
use crate::reconciler::{ContentReconciler, Document, ReconcileReport, RegionMap};
use crate::subscriber::{ChangeSubscriber, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Created,
    /// Finding a reachable backend
    Probing,
    /// Delivering mutations queued by an earlier session
    Draining,
    /// Initial bulk render
    Reconciling,
    Ready,
    Running,
    ShuttingDown,
}

impl SyncState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Probing => "probing",
            Self::Draining => "draining",
            Self::Reconciling => "reconciling",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entities kept live on the page.
const WATCHED: [EntityKind; 4] = [
    EntityKind::PageContent,
    EntityKind::SiteSettings,
    EntityKind::Products,
    EntityKind::News,
];

/// Stops a running [`SiteSync::run`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // Stores a permit if run() is not waiting yet.
        self.notify.notify_one();
    }
}

/// What `start()` did.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupReport {
    pub probe: ProbeReport,
    pub drain: Option<DrainReport>,
    pub reconcile: ReconcileReport,
}

pub struct SiteSync<D> {
    client: EntityClient,
    subscriber: ChangeSubscriber,
    reconciler: ContentReconciler<D>,
    config_rx: watch::Receiver<ClientConfig>,
    state: watch::Sender<SyncState>,
    shutdown: Arc<Notify>,
    subscription: Option<Subscription>,
}

impl<D: Document> SiteSync<D> {
    pub fn new(
        ctx: ClientContext,
        document: D,
        regions: RegionMap,
        config_rx: watch::Receiver<ClientConfig>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Created);
        Self {
            client: EntityClient::new(ctx.clone()),
            subscriber: ChangeSubscriber::new(ctx),
            reconciler: ContentReconciler::new(regions, document),
            config_rx,
            state,
            shutdown: Arc::new(Notify::new()),
            subscription: None,
        }
    }

    /// Build HTTP backends and the local store from `config_rx`'s current value.
    pub async fn connect(
        document: D,
        regions: RegionMap,
        config_rx: watch::Receiver<ClientConfig>,
    ) -> Result<Self, ClientError> {
        let config = config_rx.borrow().clone();
        let ctx = ClientContext::connect(config).await?;
        Ok(Self::new(ctx, document, regions, config_rx))
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn client(&self) -> &EntityClient {
        &self.client
    }

    #[must_use]
    pub fn reconciler(&self) -> &ContentReconciler<D> {
        &self.reconciler
    }

    #[must_use]
    pub fn document(&self) -> &D {
        self.reconciler.document()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: self.shutdown.clone(),
        }
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
        metrics::set_sync_state(state.as_str());
        debug!(state = %state, "Sync state changed");
    }

    /// Probe, deliver leftovers from the last session, render the page
    /// and subscribe to changes.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<StartupReport, ClientError> {
        info!("Starting site sync");

        self.set_state(SyncState::Probing);
        let probe = BackendProbe::new(self.client.context().clone()).detect_best_backend().await;
        if probe.is_degraded() {
            warn!(mode = %probe.mode, "No backend reachable at startup, continuing degraded");
        }

        self.set_state(SyncState::Draining);
        let drain = self.drain_queue("startup").await;

        self.set_state(SyncState::Reconciling);
        let reconcile = self.reconciler.reconcile_initial(&self.client).await;

        self.subscription = Some(self.subscriber.subscribe_all(&WATCHED));
        self.set_state(SyncState::Ready);
        info!(
            mode = %probe.mode,
            degraded = probe.is_degraded(),
            records = reconcile.records,
            "Site sync ready"
        );
        Ok(StartupReport { probe, drain, reconcile })
    }

    async fn drain_queue(&self, reason: &'static str) -> Option<DrainReport> {
        let queue = self.client.queue()?;
        match queue.drain(&self.client).await {
            Ok(report) => {
                if report.delivered > 0 || report.stopped_on.is_some() {
                    debug!(reason, delivered = report.delivered, remaining = report.remaining, "Queue drain finished");
                }
                Some(report)
            }
            Err(e) => {
                warn!(reason, error = %e, "Queue drain failed");
                None
            }
        }
    }

    fn ticker(period: std::time::Duration) -> Interval {
        let period = period.max(std::time::Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Run until [`ShutdownHandle::shutdown`] is called.
    #[tracing::instrument(skip(self))]
    pub async fn run(&mut self) {
        self.set_state(SyncState::Running);
        info!("Site sync running");

        let ctx = self.client.context().clone();
        let probe = BackendProbe::new(ctx.clone());
        let mut mode_rx = ctx.mode_receiver();
        mode_rx.borrow_and_update();
        let shutdown = self.shutdown.clone();

        let config = ctx.config();
        let mut drain_interval = Self::ticker(config.drain_interval());
        let mut reprobe_interval = Self::ticker(config.poll_interval());

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,

                Ok(()) = self.config_rx.changed() => {
                    let new_config = self.config_rx.borrow_and_update().clone();
                    let old_config = ctx.config();
                    if new_config.drain_interval_ms != old_config.drain_interval_ms {
                        drain_interval = Self::ticker(new_config.drain_interval());
                    }
                    if new_config.poll_interval_ms != old_config.poll_interval_ms {
                        reprobe_interval = Self::ticker(new_config.poll_interval());
                    }
                    info!(retries = new_config.retries, timeout_ms = new_config.timeout_ms, "Config updated");
                    ctx.update_config(new_config);
                }

                _ = drain_interval.tick() => {
                    self.drain_queue("interval").await;
                }

                _ = reprobe_interval.tick(), if ctx.is_degraded() => {
                    let report = probe.detect_best_backend().await;
                    if !report.is_degraded() {
                        info!(mode = %report.mode, "Connectivity regained");
                        self.drain_queue("reconnected").await;
                    }
                }

                Ok(()) = mode_rx.changed() => {
                    let mode = *mode_rx.borrow_and_update();
                    debug!(mode = ?mode, "Backend mode switched, draining queue");
                    self.drain_queue("mode_change").await;
                }

                Some(event) = next_event(&mut self.subscription) => {
                    self.reconciler.apply_event(&event);
                }
            }
        }
        info!("Site sync run loop stopped");
    }

    /// Stop the subscription and make a last delivery attempt.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        self.set_state(SyncState::ShuttingDown);
        info!("Shutting down site sync");
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(report) = self.drain_queue("shutdown").await {
            if report.remaining > 0 {
                info!(remaining = report.remaining, "Mutations left queued for the next session");
            }
        }
        info!("Site sync shutdown complete");
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<crate::entity::ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendMode, BackendSet, MemoryBackend};
    use crate::reconciler::VirtualDocument;
    use serde_json::json;
    use std::time::Duration;

    fn site(backend: &MemoryBackend) -> (watch::Sender<ClientConfig>, SiteSync<VirtualDocument>) {
        let (config_tx, config_rx) = watch::channel(ClientConfig::default());
        let ctx = ClientContext::new(ClientConfig::default(), BackendSet::new().with(backend.clone()));
        let doc = VirtualDocument::new().with_region("#hero h1", "Static").with_region("footer .phone", "000");
        (config_tx, SiteSync::new(ctx, doc, RegionMap::builtin(), config_rx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_renders_initial_content() {
        let backend = MemoryBackend::new(BackendMode::DirectService);
        backend
            .dataset()
            .insert(
                EntityKind::PageContent,
                &json!({"page_name": "home", "content_key": "hero_title", "content_value": "Live"}),
            )
            .unwrap();
        let (_config_tx, mut sync) = site(&backend);
        assert_eq!(sync.state(), SyncState::Created);

        let report = sync.start().await.unwrap();
        assert_eq!(sync.state(), SyncState::Ready);
        assert_eq!(report.probe.mode, BackendMode::DirectService);
        assert!(report.drain.is_none());
        assert_eq!(report.reconcile.records, 1);
        assert_eq!(sync.document().text("#hero h1"), Some("Live"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_pushed_changes_until_shutdown() {
        let backend = MemoryBackend::new(BackendMode::DirectService);
        let (_config_tx, mut sync) = site(&backend);
        sync.start().await.unwrap();
        let handle = sync.shutdown_handle();

        let writer = backend.clone();
        tokio::join!(sync.run(), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .dataset()
                .insert(
                    EntityKind::SiteSettings,
                    &json!({"setting_key": "contact_phone", "setting_value": "+62 811"}),
                )
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.shutdown();
        });

        assert_eq!(sync.document().text("footer .phone"), Some("+62 811"));
        sync.shutdown().await;
        assert_eq!(sync.state(), SyncState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_updates_reach_context() {
        let backend = MemoryBackend::new(BackendMode::DirectService);
        let (config_tx, mut sync) = site(&backend);
        sync.start().await.unwrap();
        let handle = sync.shutdown_handle();
        let ctx = sync.client().context().clone();

        tokio::join!(sync.run(), async move {
            let config = ClientConfig { retries: 7, ..ClientConfig::default() };
            config_tx.send(config).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.shutdown();
        });
        assert_eq!(ctx.config().retries, 7);
    }
}
