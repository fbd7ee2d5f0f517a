// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy.
//!
//! Two layers:
//! - [`BackendError`] is what a single backend call can fail with. It never
//!   leaves the crate's executor unchanged.
//! - [`ClientError`] is the normalized, mode-independent error callers see.
//!
//! A mutation that could not be delivered but was queued is *not* an error:
//! it is reported as [`crate::MutationOutcome::Queued`].

use thiserror::Error;

use crate::entity::EntityKind;

/// A payload failed required-field or type checks before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {entity} payload: field '{field}' {reason}")]
pub struct ValidationError {
    pub entity: EntityKind,
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(entity: EntityKind, field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            entity,
            field,
            reason: reason.into(),
        }
    }
}

/// Failure of a single call against one backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("record not found")]
    NotFound,
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Transient errors are retried and subject to failover.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) | Self::Unavailable(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::NotFound | Self::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Normalized error returned by every public client operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Only surfaces when failover was disabled for the call.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Every configured backend mode was tried and failed.
    #[error("all backends unavailable for '{operation}': {last_error}")]
    BackendUnavailable { operation: String, last_error: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("record not found: {0}")]
    NotFound(String),

    /// The backend refused the request; retrying cannot help.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed record: {0}")]
    Decode(String),

    /// A queued mutation exhausted its retry budget and needs resubmission.
    #[error("queued mutation {mutation_id} failed permanently after {attempts} attempts: {last_error}")]
    PermanentFailure {
        mutation_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("local storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether a later attempt of the same operation could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::BackendUnavailable { .. } | Self::Storage(_)
        )
    }

    /// Map a non-transient backend error for the given operation key.
    pub(crate) fn from_backend(operation: &str, err: BackendError) -> Self {
        match err {
            BackendError::NotFound => Self::NotFound(operation.to_string()),
            BackendError::Status { status, message } => Self::Rejected { status, message },
            BackendError::Decode(msg) => Self::Decode(msg),
            transient => Self::TransientNetwork(transient.to_string()),
        }
    }
}
