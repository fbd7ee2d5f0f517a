// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared client state.
//!
//! [`ClientContext`] owns everything the components share: configuration,
//! the backend set, the active [`BackendMode`], the request cache, per-mode
//! health and the durable local store. It is cheap to clone and is passed to
//! every component explicitly, so independent clients can coexist in one
//! process and tests get fully isolated state.
//!
//! # Example
//!
//! ```
//! use site_sync::{BackendMode, BackendSet, ClientConfig, ClientContext, MemoryBackend};
//!
//! let backends = BackendSet::new().with(MemoryBackend::new(BackendMode::DirectService));
//! let ctx = ClientContext::new(ClientConfig::default(), backends);
//!
//! assert_eq!(ctx.active_mode(), None); // resolved by the probe on first use
//! ctx.set_active_mode(BackendMode::DirectService);
//! assert_eq!(ctx.active_mode(), Some(BackendMode::DirectService));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{BackendMode, BackendSet, EntityBackend};
use crate::cache::RequestCache;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::metrics;
use crate::resilience::health::{HealthTransition, ModeHealth, ModeTracker};
use crate::state::LocalStore;

/// `kv_state` key holding the last successfully probed mode.
pub const MODE_HINT_KEY: &str = "backend_mode_hint";

struct ContextInner {
    config: RwLock<ClientConfig>,
    backends: BackendSet,
    /// Active mode. The watch channel doubles as the storage cell.
    mode: watch::Sender<Option<BackendMode>>,
    cache: RequestCache,
    health: BTreeMap<BackendMode, ModeTracker>,
    store: Option<LocalStore>,
    degraded: AtomicBool,
}

#[derive(Clone)]
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl ClientContext {
    /// Context without durable state: the mode hint is not persisted and
    /// mutations cannot be queued.
    pub fn new(config: ClientConfig, backends: BackendSet) -> Self {
        Self::build(config, backends, None)
    }

    pub fn with_store(config: ClientConfig, backends: BackendSet, store: LocalStore) -> Self {
        Self::build(config, backends, Some(store))
    }

    fn build(config: ClientConfig, backends: BackendSet, store: Option<LocalStore>) -> Self {
        let (mode, _) = watch::channel(None);
        let health = BackendMode::PRIORITY
            .into_iter()
            .map(|m| (m, ModeTracker::new(m)))
            .collect();
        Self {
            inner: Arc::new(ContextInner {
                cache: RequestCache::new(config.cache_max_entries),
                config: RwLock::new(config),
                backends,
                mode,
                health,
                store,
                degraded: AtomicBool::new(false),
            }),
        }
    }

    /// Build HTTP backends from the config's endpoints, open the local
    /// store and restore the last session's mode hint.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let backends = BackendSet::from_config(&config).map_err(|e| ClientError::Config(e.to_string()))?;
        if backends.is_empty() {
            return Err(ClientError::Config("no backend endpoint configured".into()));
        }
        let store = LocalStore::open(config.state_path.as_deref()).await?;
        let ctx = Self::with_store(config, backends, store);
        ctx.restore_mode_hint().await;
        Ok(ctx)
    }

    #[must_use]
    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().clone()
    }

    /// Replace configuration. Takes effect for subsequent operations.
    pub fn update_config(&self, config: ClientConfig) {
        *self.inner.config.write() = config;
    }

    #[must_use]
    pub fn backends(&self) -> &BackendSet {
        &self.inner.backends
    }

    #[must_use]
    pub fn backend(&self, mode: BackendMode) -> Option<Arc<dyn EntityBackend>> {
        self.inner.backends.get(mode)
    }

    #[must_use]
    pub fn cache(&self) -> &RequestCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn store(&self) -> Option<&LocalStore> {
        self.inner.store.as_ref()
    }

    #[must_use]
    pub fn active_mode(&self) -> Option<BackendMode> {
        *self.inner.mode.borrow()
    }

    /// Switch the process-wide mode. Returns whether it changed.
    pub fn set_active_mode(&self, mode: BackendMode) -> bool {
        let mut previous = None;
        let changed = self.inner.mode.send_if_modified(|current| {
            if *current == Some(mode) {
                return false;
            }
            previous = current.replace(mode);
            true
        });
        if changed {
            info!(from = ?previous.map(|m| m.as_str()), to = %mode, "Active backend mode changed");
            for m in BackendMode::PRIORITY {
                metrics::set_active_mode(m.as_str(), m == mode);
            }
        }
        changed
    }

    /// Watch active-mode changes (e.g. to drain the queue on regained connectivity).
    #[must_use]
    pub fn mode_receiver(&self) -> watch::Receiver<Option<BackendMode>> {
        self.inner.mode.subscribe()
    }

    /// Whether the last probe found every backend unreachable.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        self.inner.degraded.store(degraded, Ordering::Release);
        metrics::set_backend_degraded(degraded);
    }

    pub(crate) fn record_success(&self, mode: BackendMode) {
        let Some(tracker) = self.inner.health.get(&mode) else { return };
        if tracker.record_success() == HealthTransition::Recovered {
            info!(mode = %mode, "Backend recovered");
            metrics::set_backend_healthy(mode.as_str(), true);
        }
    }

    pub(crate) fn record_failure(&self, mode: BackendMode) {
        let Some(tracker) = self.inner.health.get(&mode) else { return };
        if tracker.record_failure() == HealthTransition::BecameUnhealthy {
            warn!(
                mode = %mode,
                failures = tracker.snapshot().consecutive_failures,
                "Backend marked unhealthy"
            );
            metrics::set_backend_healthy(mode.as_str(), false);
        }
    }

    /// Health of every configured mode, in priority order.
    #[must_use]
    pub fn health(&self) -> Vec<ModeHealth> {
        self.inner
            .backends
            .configured_modes()
            .into_iter()
            .filter_map(|mode| self.inner.health.get(&mode).map(ModeTracker::snapshot))
            .collect()
    }

    /// Load the persisted mode hint as a provisional active mode.
    /// Returns the mode adopted, if any.
    pub async fn restore_mode_hint(&self) -> Option<BackendMode> {
        let store = self.store()?;
        let hint = match store.get_value(MODE_HINT_KEY).await {
            Ok(hint) => hint?,
            Err(e) => {
                warn!(error = %e, "Failed to read backend mode hint");
                return None;
            }
        };
        match hint.parse::<BackendMode>() {
            Ok(mode) if self.backend(mode).is_some() => {
                debug!(mode = %mode, "Restored backend mode hint");
                self.set_active_mode(mode);
                Some(mode)
            }
            Ok(mode) => {
                debug!(mode = %mode, "Ignoring hint for unconfigured mode");
                None
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed backend mode hint");
                None
            }
        }
    }

    pub(crate) async fn persist_mode_hint(&self, mode: BackendMode) {
        if let Some(store) = self.store() {
            if let Err(e) = store.set_value(MODE_HINT_KEY, mode.as_str()).await {
                warn!(error = %e, mode = %mode, "Failed to persist backend mode hint");
            }
        }
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("backends", &self.inner.backends)
            .field("active_mode", &self.active_mode())
            .field("cache_entries", &self.inner.cache.len())
            .field("has_store", &self.inner.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn ctx() -> ClientContext {
        let backends = BackendSet::new()
            .with(MemoryBackend::new(BackendMode::PrimaryRemote))
            .with(MemoryBackend::new(BackendMode::DirectService));
        ClientContext::new(ClientConfig::default(), backends)
    }

    #[test]
    fn test_mode_switch_notifies_once() {
        let ctx = ctx();
        let mut rx = ctx.mode_receiver();
        assert!(ctx.set_active_mode(BackendMode::PrimaryRemote));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!ctx.set_active_mode(BackendMode::PrimaryRemote));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = ctx();
        let other = ctx.clone();
        other.set_active_mode(BackendMode::DirectService);
        assert_eq!(ctx.active_mode(), Some(BackendMode::DirectService));
    }

    #[test]
    fn test_health_reports_configured_modes() {
        let ctx = ctx();
        for _ in 0..3 {
            ctx.record_failure(BackendMode::PrimaryRemote);
        }
        let health = ctx.health();
        assert_eq!(health.len(), 2);
        assert!(!health[0].healthy);
        assert!(health[1].healthy);

        ctx.record_success(BackendMode::PrimaryRemote);
        assert!(ctx.health()[0].healthy);
    }

    #[tokio::test]
    async fn test_mode_hint_roundtrip() {
        let store = LocalStore::open(None).await.unwrap();
        let backends = BackendSet::new().with(MemoryBackend::new(BackendMode::LocalOrigin));
        let ctx = ClientContext::with_store(ClientConfig::default(), backends.clone(), store.clone());
        ctx.persist_mode_hint(BackendMode::LocalOrigin).await;

        let fresh = ClientContext::with_store(ClientConfig::default(), backends, store);
        assert_eq!(fresh.restore_mode_hint().await, Some(BackendMode::LocalOrigin));
        assert_eq!(fresh.active_mode(), Some(BackendMode::LocalOrigin));
    }

    #[tokio::test]
    async fn test_hint_for_unconfigured_mode_ignored() {
        let store = LocalStore::open(None).await.unwrap();
        store.set_value(MODE_HINT_KEY, "primary-remote").await.unwrap();
        let backends = BackendSet::new().with(MemoryBackend::new(BackendMode::DirectService));
        let ctx = ClientContext::with_store(ClientConfig::default(), backends, store);
        assert_eq!(ctx.restore_mode_hint().await, None);
        assert_eq!(ctx.active_mode(), None);
    }

    #[tokio::test]
    async fn test_connect_requires_an_endpoint() {
        let err = ClientContext::connect(ClientConfig::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
