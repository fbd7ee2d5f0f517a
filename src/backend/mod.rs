// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend modes and the common backend interface.
//!
//! Three interchangeable targets serve the same entities:
//!
//! ```text
//!   priority 1        priority 2         priority 3
//! ┌──────────────┐ ┌──────────────┐ ┌────────────────┐
//! │primary-remote│ │ local-origin │ │ direct-service │
//! │ serverless   │ │ same-origin  │ │ PostgREST +    │
//! │ REST API     │ │ REST API     │ │ realtime feed  │
//! └──────┬───────┘ └──────┬───────┘ └───────┬────────┘
//!        └─── ApiBackend ─┘          ServiceBackend
//! ```
//!
//! The executor only ever talks to [`EntityBackend`]; which concrete type
//! sits behind a mode is decided once, when the [`BackendSet`] is built.

pub mod api;
pub mod memory;
pub mod service;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::entity::{ChangeEvent, EntityKind, ListFilter, RecordId};
use crate::error::BackendError;

pub use api::ApiBackend;
pub use memory::{MemoryBackend, MemoryDataset};
pub use service::ServiceBackend;

/// Which backend target a request is routed to.
///
/// Ordering follows probe/failover priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    PrimaryRemote,
    LocalOrigin,
    DirectService,
}

impl BackendMode {
    pub const PRIORITY: [BackendMode; 3] = [
        Self::PrimaryRemote,
        Self::LocalOrigin,
        Self::DirectService,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryRemote => "primary-remote",
            Self::LocalOrigin => "local-origin",
            Self::DirectService => "direct-service",
        }
    }

    /// Whether the mode can deliver change notifications by push.
    /// The API modes degrade to polling.
    #[must_use]
    pub fn supports_push(&self) -> bool {
        matches!(self, Self::DirectService)
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PRIORITY
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| format!("unknown backend mode '{}'", s))
    }
}

/// Remote change notifications for one entity. Ends when the transport drops.
pub type ChangeFeed = BoxStream<'static, Result<ChangeEvent, BackendError>>;

/// One backend target. Every method returns the normalized record shape
/// (`serde_json::Value` objects) regardless of the wire format behind it.
#[async_trait]
pub trait EntityBackend: Send + Sync {
    fn mode(&self) -> BackendMode;

    /// Lightweight reachability check.
    async fn health_check(&self) -> Result<(), BackendError>;

    async fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError>;

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Value, BackendError>;

    /// Returns the stored record including server-assigned fields.
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Value, BackendError>;

    async fn update(&self, kind: EntityKind, id: &RecordId, payload: &Value) -> Result<Value, BackendError>;

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), BackendError>;

    /// Open a push feed of changes. `Ok(None)` means the backend can't push
    /// and the subscriber should poll instead.
    async fn open_feed(&self, _kind: EntityKind) -> Result<Option<ChangeFeed>, BackendError> {
        Ok(None)
    }
}

/// The configured backends, keyed by mode.
///
/// Modes absent from the set are never probed or failed over to.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: BTreeMap<BackendMode, Arc<dyn EntityBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own mode, replacing any previous one.
    #[must_use]
    pub fn with<B: EntityBackend + 'static>(mut self, backend: B) -> Self {
        self.insert(Arc::new(backend));
        self
    }

    pub fn insert(&mut self, backend: Arc<dyn EntityBackend>) {
        self.backends.insert(backend.mode(), backend);
    }

    #[must_use]
    pub fn get(&self, mode: BackendMode) -> Option<Arc<dyn EntityBackend>> {
        self.backends.get(&mode).cloned()
    }

    /// Configured modes in priority order.
    #[must_use]
    pub fn configured_modes(&self) -> Vec<BackendMode> {
        self.backends.keys().copied().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Build HTTP backends for every endpoint present in the config.
    pub fn from_config(config: &ClientConfig) -> Result<Self, BackendError> {
        let mut set = Self::new();
        if let Some(url) = &config.primary_url {
            set.insert(Arc::new(ApiBackend::new(BackendMode::PrimaryRemote, url, config.timeout())?));
        }
        if let Some(url) = &config.local_url {
            set.insert(Arc::new(ApiBackend::new(BackendMode::LocalOrigin, url, config.timeout())?));
        }
        if let Some(url) = &config.service_url {
            let key = config.service_key.clone().unwrap_or_default();
            set.insert(Arc::new(ServiceBackend::new(url, key, config.timeout())?));
        }
        Ok(set)
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSet")
            .field("modes", &self.configured_modes())
            .finish()
    }
}
