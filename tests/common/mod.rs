//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use site_sync::backend::ChangeFeed;
use site_sync::{
    BackendError, BackendMode, BackendSet, ClientConfig, ClientContext, EntityBackend, EntityKind, ListFilter,
    LocalStore, MemoryBackend, RecordId,
};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wraps a backend and injects errors at chosen call numbers.
pub struct FailingBackend<B: EntityBackend> {
    inner: B,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every call from `fail_on_calls[0]` onwards
    fail_permanently: AtomicBool,
    error: Mutex<BackendError>,
    /// Only count and fail writes
    writes_only: bool,
    healed: AtomicBool,
}

impl<B: EntityBackend> FailingBackend<B> {
    pub fn new(inner: B, fail_on_calls: Vec<u64>, error: BackendError) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            fail_permanently: AtomicBool::new(false),
            error: Mutex::new(error),
            writes_only: false,
            healed: AtomicBool::new(false),
        }
    }

    /// Fail every call after the first `n`.
    pub fn fail_after(inner: B, n: u64, error: BackendError) -> Self {
        let backend = Self::new(inner, vec![n + 1], error);
        backend.fail_permanently.store(true, Ordering::SeqCst);
        backend
    }

    /// Reject every write with a non-transient status.
    pub fn rejecting_writes(inner: B, status: u16) -> Self {
        let mut backend = Self::fail_after(
            inner,
            0,
            BackendError::Status { status, message: "rejected by test".into() },
        );
        backend.writes_only = true;
        backend
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    fn maybe_fail(&self, is_write: bool) -> Result<(), BackendError> {
        if self.writes_only && !is_write {
            return Ok(());
        }
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.healed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let fail = if self.fail_permanently.load(Ordering::SeqCst) {
            self.fail_on_calls.first().is_some_and(|first| count >= *first)
        } else {
            self.fail_on_calls.contains(&count)
        };
        if fail {
            Err(self.error.lock().clone())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<B: EntityBackend> EntityBackend for FailingBackend<B> {
    fn mode(&self) -> BackendMode {
        self.inner.mode()
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.maybe_fail(false)?;
        self.inner.health_check().await
    }

    async fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError> {
        self.maybe_fail(false)?;
        self.inner.list(kind, filter).await
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Value, BackendError> {
        self.maybe_fail(false)?;
        self.inner.get(kind, id).await
    }

    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Value, BackendError> {
        self.maybe_fail(true)?;
        self.inner.create(kind, payload).await
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, payload: &Value) -> Result<Value, BackendError> {
        self.maybe_fail(true)?;
        self.inner.update(kind, id, payload).await
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), BackendError> {
        self.maybe_fail(true)?;
        self.inner.delete(kind, id).await
    }

    async fn open_feed(&self, kind: EntityKind) -> Result<Option<ChangeFeed>, BackendError> {
        self.inner.open_feed(kind).await
    }
}

/// Three memory backends over one dataset.
pub struct ThreeModes {
    pub primary: MemoryBackend,
    pub local: MemoryBackend,
    pub service: MemoryBackend,
}

impl ThreeModes {
    pub fn new() -> Self {
        let primary = MemoryBackend::new(BackendMode::PrimaryRemote);
        let local = MemoryBackend::sharing(BackendMode::LocalOrigin, &primary);
        let service = MemoryBackend::sharing(BackendMode::DirectService, &primary);
        Self { primary, local, service }
    }

    pub fn set_all_available(&self, available: bool) {
        for backend in [&self.primary, &self.local, &self.service] {
            backend.set_available(available);
        }
    }

    pub fn backend_set(&self) -> BackendSet {
        BackendSet::new()
            .with(self.primary.clone())
            .with(self.local.clone())
            .with(self.service.clone())
    }
}

/// Config with millisecond backoff for real-time tests (SQLite runs on its
/// own thread, so paused time would fire pool timeouts).
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        retries: 2,
        backoff_base_ms: 5,
        backoff_max_ms: 20,
        probe_timeout_ms: 500,
        timeout_ms: 1_000,
        max_queue_attempts: 3,
        ..ClientConfig::default()
    }
}

pub async fn context_with_store(backends: BackendSet, config: ClientConfig) -> ClientContext {
    let store = LocalStore::open(None).await.expect("in-memory store");
    ClientContext::with_store(config, backends, store)
}

pub fn shared(backend: impl EntityBackend + 'static) -> Arc<dyn EntityBackend> {
    Arc::new(backend)
}
