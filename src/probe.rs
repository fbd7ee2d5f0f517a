// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend discovery.
//!
//! Probes configured modes in priority order, each under its own timeout,
//! and adopts the first one that answers:
//!
//! ```text
//! primary-remote ──timeout──▶ local-origin ──ok (200ms)──▶ selected
//!                                                │
//!                                                ▼
//!                                   persist hint, broadcast mode
//! ```
//!
//! The probe never fails. When nothing answers it still selects
//! `direct-service` (or the last configured mode) so requests can keep
//! trying, but the report says [`ProbeOutcome::AllFailed`] and the context
//! is flagged degraded.

use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::backend::BackendMode;
use crate::context::ClientContext;
use crate::error::BackendError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A mode answered its health check.
    Selected,
    /// Nothing answered; the fallback mode was adopted.
    AllFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeAttempt {
    pub mode: BackendMode,
    pub reachable: bool,
    pub latency: Duration,
    pub error: Option<BackendError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub mode: BackendMode,
    pub outcome: ProbeOutcome,
    pub attempts: Vec<ProbeAttempt>,
}

impl ProbeReport {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.outcome == ProbeOutcome::AllFailed
    }
}

#[derive(Clone)]
pub struct BackendProbe {
    ctx: ClientContext,
}

impl BackendProbe {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Mode used when every probe fails.
    fn fallback_mode(&self) -> BackendMode {
        let configured = self.ctx.backends().configured_modes();
        if configured.contains(&BackendMode::DirectService) || configured.is_empty() {
            BackendMode::DirectService
        } else {
            configured[configured.len() - 1]
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn detect_best_backend(&self) -> ProbeReport {
        let probe_timeout = self.ctx.config().probe_timeout();
        let mut attempts = Vec::new();

        for mode in self.ctx.backends().configured_modes() {
            let Some(backend) = self.ctx.backend(mode) else { continue };
            let start = Instant::now();
            let result = match timeout(probe_timeout, backend.health_check()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout),
            };
            let latency = start.elapsed();
            metrics::record_probe(mode.as_str(), result.is_ok(), latency);

            match result {
                Ok(()) => {
                    debug!(mode = %mode, ?latency, "Probe succeeded");
                    attempts.push(ProbeAttempt { mode, reachable: true, latency, error: None });
                    self.ctx.record_success(mode);
                    self.ctx.set_degraded(false);
                    self.ctx.set_active_mode(mode);
                    self.ctx.persist_mode_hint(mode).await;
                    info!(mode = %mode, probed = attempts.len(), "Backend selected");
                    return ProbeReport { mode, outcome: ProbeOutcome::Selected, attempts };
                }
                Err(e) => {
                    debug!(mode = %mode, error = %e, ?latency, "Probe failed");
                    self.ctx.record_failure(mode);
                    attempts.push(ProbeAttempt { mode, reachable: false, latency, error: Some(e) });
                }
            }
        }

        let mode = self.fallback_mode();
        warn!(mode = %mode, probed = attempts.len(), "All backend probes failed, falling back");
        self.ctx.set_degraded(true);
        self.ctx.set_active_mode(mode);
        ProbeReport { mode, outcome: ProbeOutcome::AllFailed, attempts }
    }

    /// The active mode, probing first if none is known yet.
    pub async fn ensure_mode(&self) -> BackendMode {
        match self.ctx.active_mode() {
            Some(mode) => mode,
            None => self.detect_best_backend().await.mode,
        }
    }
}
