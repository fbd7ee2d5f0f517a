// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient request executor.
//!
//! Runs one logical operation against the active backend:
//!
//! ```text
//! execute(key, opts, request_fn)
//!       │
//!       ├─→ use_cache && fresh entry ─────────────────────────→ return cached
//!       │
//!       ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │ for mode in [active, next by priority..., wrap]           │
//! │   switch process-wide mode (failover only)                │
//! │   for attempt in 1..=retries                              │
//! │     sleep(base * 2^(attempt-2))     (from 2nd attempt on) │
//! │     timeout(request_fn(backend))                          │
//! │       ok        → cache (if use_cache), return            │
//! │       permanent → return NotFound / Rejected / Decode     │
//! │       transient → next attempt                            │
//! └───────────────────────────────────────────────────────────┘
//!       │
//!       ▼
//! BackendUnavailable
//! ```
//!
//! A timeout counts as one failed attempt. Nothing here panics or hangs:
//! every path ends in a value or a typed error.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::backend::{BackendMode, EntityBackend};
use crate::config::ClientConfig;
use crate::context::ClientContext;
use crate::entity::EntityKind;
use crate::error::{BackendError, ClientError};
use crate::metrics;
use crate::probe::BackendProbe;

/// Per-call execution options. Defaults come from [`ClientConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    pub use_cache: bool,
    /// Attempts per backend mode (at least one is always made)
    pub retries: usize,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// TTL for the cached result
    pub ttl: Duration,
    /// Try the remaining modes after the active one is exhausted
    pub failover: bool,
}

impl ExecuteOptions {
    /// Read options for an entity, using its TTL.
    #[must_use]
    pub fn read(config: &ClientConfig, kind: EntityKind) -> Self {
        Self {
            use_cache: config.use_cache,
            retries: config.retries,
            timeout: config.timeout(),
            ttl: config.ttl_for(kind),
            failover: true,
        }
    }

    /// Mutations never read from or write to the cache.
    #[must_use]
    pub fn write(config: &ClientConfig) -> Self {
        Self {
            use_cache: false,
            retries: config.retries,
            timeout: config.timeout(),
            ttl: Duration::ZERO,
            failover: true,
        }
    }

    #[must_use]
    pub fn without_failover(mut self) -> Self {
        self.failover = false;
        self
    }
}

/// Backend call bound at execution time to whichever mode is being tried.
pub type RequestFuture = BoxFuture<'static, Result<Value, BackendError>>;

/// Order in which modes are tried: the active one, then the rest by
/// priority, wrapping past the end.
fn failover_order(active: BackendMode, configured: &[BackendMode], failover: bool) -> Vec<BackendMode> {
    let start = configured.iter().position(|m| *m == active).unwrap_or(0);
    let rotated = configured[start..].iter().chain(configured[..start].iter()).copied();
    if failover {
        rotated.collect()
    } else {
        rotated.take(1).collect()
    }
}

/// Metric label from an operation key like `products:id:7`.
fn operation_label(op_key: &str) -> &str {
    op_key.split(':').nth(1).unwrap_or(op_key)
}

#[derive(Clone)]
pub struct Executor {
    ctx: ClientContext,
    probe: BackendProbe,
}

impl Executor {
    pub fn new(ctx: ClientContext) -> Self {
        Self {
            probe: BackendProbe::new(ctx.clone()),
            ctx,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    #[must_use]
    pub fn probe(&self) -> &BackendProbe {
        &self.probe
    }

    #[tracing::instrument(skip(self, options, request_fn), fields(mode = tracing::field::Empty))]
    pub async fn execute<F>(&self, op_key: &str, options: &ExecuteOptions, request_fn: F) -> Result<Value, ClientError>
    where
        F: Fn(Arc<dyn EntityBackend>) -> RequestFuture + Send + Sync,
    {
        if options.use_cache {
            if let Some(cached) = self.ctx.cache().get(op_key) {
                debug!("Served from cache");
                return Ok(cached);
            }
        }

        let configured = self.ctx.backends().configured_modes();
        if configured.is_empty() {
            return Err(ClientError::BackendUnavailable {
                operation: op_key.to_string(),
                last_error: "no backend configured".into(),
            });
        }

        let retry = self.ctx.config().retry_config();
        let max_attempts = options.retries.max(1);
        let label = operation_label(op_key);
        let active = self.probe.ensure_mode().await;
        tracing::Span::current().record("mode", active.as_str());

        let mut last_error = BackendError::Unavailable("no attempt made".into());
        let mut previous: Option<BackendMode> = None;

        for mode in failover_order(active, &configured, options.failover) {
            let Some(backend) = self.ctx.backend(mode) else { continue };

            if let Some(from) = previous {
                warn!(from = %from, to = %mode, operation = op_key, "Failing over");
                metrics::record_failover(from.as_str(), mode.as_str());
                self.ctx.set_active_mode(mode);
            }
            previous = Some(mode);

            for attempt in 1..=max_attempts {
                if attempt > 1 {
                    sleep(retry.delay_for(attempt as u32 - 2)).await;
                }

                let result = {
                    let _timer = metrics::LatencyTimer::new(mode.as_str(), label);
                    match timeout(options.timeout, request_fn(backend.clone())).await {
                        Ok(result) => result,
                        Err(_) => Err(BackendError::Timeout),
                    }
                };

                match result {
                    Ok(value) => {
                        self.ctx.record_success(mode);
                        metrics::record_request(mode.as_str(), label, "success");
                        if options.use_cache {
                            self.ctx.cache().insert(op_key, value.clone(), options.ttl);
                        }
                        return Ok(value);
                    }
                    Err(e) if !e.is_transient() => {
                        // The backend answered; it just refused.
                        self.ctx.record_success(mode);
                        metrics::record_request(mode.as_str(), label, "rejected");
                        return Err(ClientError::from_backend(op_key, e));
                    }
                    Err(e) => {
                        self.ctx.record_failure(mode);
                        let status = if e == BackendError::Timeout { "timeout" } else { "error" };
                        metrics::record_request(mode.as_str(), label, status);
                        warn!(
                            "Operation '{}' failed on {} (attempt {}/{}): {}",
                            op_key, mode, attempt, max_attempts, e
                        );
                        last_error = e;
                    }
                }
            }
        }

        if options.failover {
            self.ctx.set_degraded(true);
            Err(ClientError::BackendUnavailable {
                operation: op_key.to_string(),
                last_error: last_error.to_string(),
            })
        } else {
            Err(ClientError::TransientNetwork(last_error.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSet, MemoryBackend};
    use crate::entity::ListFilter;
    use futures::FutureExt;
    use serde_json::json;

    const P: BackendMode = BackendMode::PrimaryRemote;
    const L: BackendMode = BackendMode::LocalOrigin;
    const D: BackendMode = BackendMode::DirectService;

    #[test]
    fn test_failover_order_wraps() {
        assert_eq!(failover_order(P, &[P, L, D], true), vec![P, L, D]);
        assert_eq!(failover_order(L, &[P, L, D], true), vec![L, D, P]);
        assert_eq!(failover_order(D, &[P, D], true), vec![D, P]);
        assert_eq!(failover_order(L, &[P, L, D], false), vec![L]);
        // Active mode not configured: start from the top
        assert_eq!(failover_order(D, &[P, L], true), vec![P, L]);
    }

    #[test]
    fn test_operation_label() {
        assert_eq!(operation_label("products:all:*"), "all");
        assert_eq!(operation_label("health"), "health");
    }

    fn list_products(backend: Arc<dyn EntityBackend>) -> RequestFuture {
        async move {
            backend
                .list(EntityKind::Products, &ListFilter::default())
                .await
                .map(Value::from)
        }
        .boxed()
    }

    fn setup() -> (MemoryBackend, MemoryBackend, MemoryBackend, Executor) {
        let primary = MemoryBackend::new(P);
        let local = MemoryBackend::sharing(L, &primary);
        let service = MemoryBackend::sharing(D, &primary);
        let ctx = ClientContext::new(
            ClientConfig::default(),
            BackendSet::new().with(primary.clone()).with(local.clone()).with(service.clone()),
        );
        (primary, local, service, Executor::new(ctx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_mode_succeeds_and_becomes_active() {
        let (primary, local, service, executor) = setup();
        executor.context().set_active_mode(P);
        primary.set_available(false);
        local.set_available(false);

        let options = ExecuteOptions::read(&executor.context().config(), EntityKind::Products);
        let result = executor.execute("products:all:*", &options, list_products).await;

        assert_eq!(result.unwrap(), json!([]));
        assert_eq!(executor.context().active_mode(), Some(D));
        assert_eq!(primary.call_count(), 3);
        assert_eq!(local.call_count(), 3);
        assert_eq!(service.call_count(), 1);
    }

    #[test]
    fn test_each_attempt_records_latency() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        ::metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let (_primary, _local, _service, executor) = setup();
                executor.context().set_active_mode(P);
                let options = ExecuteOptions::read(&executor.context().config(), EntityKind::Products);
                executor.execute("products:all:*", &options, list_products).await.unwrap();
                // Served from cache: no second sample
                executor.execute("products:all:*", &options, list_products).await.unwrap();
            });
        });

        let latencies: Vec<_> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, ..)| key.key().name() == "site_sync_request_seconds")
            .collect();
        assert_eq!(latencies.len(), 1);
        let (key, _, _, value) = &latencies[0];
        assert!(key.key().labels().any(|l| l.key() == "operation" && l.value() == "all"));
        assert!(key.key().labels().any(|l| l.key() == "mode" && l.value() == "primary-remote"));
        assert!(matches!(value, DebugValue::Histogram(samples) if samples.len() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_backend_unavailable() {
        let backend = MemoryBackend::new(D);
        backend.set_available(false);
        let ctx = ClientContext::new(ClientConfig::default(), BackendSet::new().with(backend.clone()));
        ctx.set_active_mode(D);
        let executor = Executor::new(ctx);

        let start = tokio::time::Instant::now();
        let options = ExecuteOptions::read(&executor.context().config(), EntityKind::Products);
        let err = executor.execute("products:all:*", &options, list_products).await.unwrap_err();

        assert!(matches!(err, ClientError::BackendUnavailable { .. }));
        assert_eq!(backend.call_count(), 3);
        // 1s + 2s of backoff between the three attempts
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(executor.context().is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_attempt() {
        let (primary, _local, _service, executor) = setup();
        executor.context().set_active_mode(P);
        primary.set_latency(Duration::from_secs(60));

        let options = ExecuteOptions {
            retries: 2,
            ..ExecuteOptions::read(&executor.context().config(), EntityKind::Products)
        };
        let result = executor.execute("products:all:*", &options, list_products).await;
        assert!(result.is_ok());
        assert_eq!(primary.call_count(), 2);
        assert_eq!(executor.context().active_mode(), Some(L));
    }

    #[tokio::test]
    async fn test_cache_short_circuits_second_read() {
        let (primary, _local, _service, executor) = setup();
        let options = ExecuteOptions::read(&executor.context().config(), EntityKind::Products);

        executor.execute("products:all:*", &options, list_products).await.unwrap();
        let calls = primary.call_count();
        executor.execute("products:all:*", &options, list_products).await.unwrap();
        assert_eq!(primary.call_count(), calls);
    }

    #[tokio::test]
    async fn test_permanent_error_does_not_retry_or_fail_over() {
        let (primary, local, _service, executor) = setup();
        executor.context().set_active_mode(P);
        let options = ExecuteOptions::write(&executor.context().config());

        let err = executor
            .execute("products:id:42", &options, |backend| {
                async move {
                    backend
                        .get(EntityKind::Products, &crate::entity::RecordId::from(42))
                        .await
                }
                .boxed()
            })
            .await
            .unwrap_err();

        assert_eq!(err, ClientError::NotFound("products:id:42".into()));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(local.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_failover_stays_on_active_mode() {
        let (primary, local, _service, executor) = setup();
        executor.context().set_active_mode(P);
        primary.set_available(false);

        let options = ExecuteOptions::write(&executor.context().config()).without_failover();
        let err = executor.execute("products:all:*", &options, list_products).await.unwrap_err();
        assert!(matches!(err, ClientError::TransientNetwork(_)));
        assert_eq!(local.call_count(), 0);
        assert_eq!(executor.context().active_mode(), Some(P));
    }

    #[tokio::test]
    async fn test_lazy_probe_on_first_request() {
        let (primary, _local, _service, executor) = setup();
        assert_eq!(executor.context().active_mode(), None);
        let options = ExecuteOptions::read(&executor.context().config(), EntityKind::Products);
        executor.execute("products:all:*", &options, list_products).await.unwrap();
        assert_eq!(executor.context().active_mode(), Some(P));
        // one probe + one request
        assert_eq!(primary.call_count(), 2);
    }
}
