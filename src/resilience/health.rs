// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-mode backend health tracking.
//!
//! Counts consecutive failures observed by the probe and the executor. A mode
//! is reported unhealthy after three in a row; one success resets it. This is
//! reporting only: mode selection is the probe's and executor's job.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::backend::BackendMode;

/// Point-in-time health of one backend mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeHealth {
    pub mode: BackendMode,
    pub healthy: bool,
    pub consecutive_failures: u64,
    /// Failures since the tracker was created
    pub total_failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Transition caused by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameUnhealthy,
    Recovered,
}

pub struct ModeTracker {
    mode: BackendMode,
    state: Mutex<ModeHealth>,
}

impl ModeTracker {
    pub const UNHEALTHY_AFTER: u64 = 3;

    pub fn new(mode: BackendMode) -> Self {
        Self {
            mode,
            state: Mutex::new(ModeHealth {
                mode,
                healthy: true,
                consecutive_failures: 0,
                total_failures: 0,
                last_success: None,
                last_failure: None,
            }),
        }
    }

    #[must_use]
    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    pub fn record_success(&self) -> HealthTransition {
        let mut state = self.state.lock();
        let was_healthy = state.healthy;
        state.consecutive_failures = 0;
        state.healthy = true;
        state.last_success = Some(Utc::now());
        if was_healthy {
            HealthTransition::Unchanged
        } else {
            HealthTransition::Recovered
        }
    }

    pub fn record_failure(&self) -> HealthTransition {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.total_failures += 1;
        state.last_failure = Some(Utc::now());
        if state.healthy && state.consecutive_failures >= Self::UNHEALTHY_AFTER {
            state.healthy = false;
            HealthTransition::BecameUnhealthy
        } else {
            HealthTransition::Unchanged
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ModeHealth {
        *self.state.lock()
    }
}
