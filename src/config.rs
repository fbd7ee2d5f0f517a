// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the data-access client.
//!
//! Every timing and retry parameter lives here; nothing else in the crate
//! carries its own constants.
//!
//! # Example
//!
//! ```
//! use site_sync::ClientConfig;
//! use site_sync::entity::EntityKind;
//! use std::time::Duration;
//!
//! // Defaults
//! let config = ClientConfig::default();
//! assert_eq!(config.retries, 3);
//! assert_eq!(config.ttl_for(EntityKind::Products), Duration::from_secs(300));
//!
//! // From JSON (all fields optional)
//! let config: ClientConfig = serde_json::from_str(r#"{
//!     "primary_url": "https://example.com/api",
//!     "entity_ttl_ms": { "site_settings": 60000 }
//! }"#).unwrap();
//! assert_eq!(config.ttl_for(EntityKind::SiteSettings), Duration::from_secs(60));
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::entity::EntityKind;
use crate::resilience::retry::RetryConfig;

/// Client configuration.
///
/// All fields have defaults. Endpoints are optional: a backend mode with no
/// endpoint is simply never probed or failed over to.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Serverless API base URL (`primary-remote` mode)
    #[serde(default)]
    pub primary_url: Option<String>,

    /// Same-origin API base URL (`local-origin` mode)
    #[serde(default)]
    pub local_url: Option<String>,

    /// Backend-as-a-service project URL (`direct-service` mode)
    #[serde(default)]
    pub service_url: Option<String>,

    /// Backend-as-a-service API key
    #[serde(default)]
    pub service_key: Option<String>,

    /// Serve reads from the request cache when fresh
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,

    /// Attempts per backend mode before failing over
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Default cache TTL
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Per-entity TTL overrides
    #[serde(default)]
    pub entity_ttl_ms: HashMap<EntityKind, u64>,

    /// Cache bound (oldest entries evicted first)
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Polling interval for modes without push delivery
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Health probe timeout per mode
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Backoff base: the delay before attempt n+1 is `base * 2^n`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Mutation queue drain interval
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Delivery attempts before a queued mutation is permanently failed
    #[serde(default = "default_max_queue_attempts")]
    pub max_queue_attempts: u32,

    /// SQLite file for durable local state (in-memory when unset)
    #[serde(default)]
    pub state_path: Option<String>,

    /// Buffered change events per subscription
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_use_cache() -> bool { true }
fn default_retries() -> usize { 3 }
fn default_timeout_ms() -> u64 { 10_000 }
fn default_cache_ttl_ms() -> u64 { 5 * 60 * 1000 } // 5 minutes
fn default_cache_max_entries() -> usize { 500 }
fn default_poll_interval_ms() -> u64 { 30_000 }
fn default_probe_timeout_ms() -> u64 { 5_000 }
fn default_backoff_base_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 30_000 }
fn default_drain_interval_ms() -> u64 { 30_000 }
fn default_max_queue_attempts() -> u32 { 10 }
fn default_channel_capacity() -> usize { 256 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            primary_url: None,
            local_url: None,
            service_url: None,
            service_key: None,
            use_cache: default_use_cache(),
            retries: default_retries(),
            timeout_ms: default_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            entity_ttl_ms: HashMap::new(),
            cache_max_entries: default_cache_max_entries(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            max_queue_attempts: default_max_queue_attempts(),
            state_path: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ClientConfig {
    /// Retry/backoff policy for request execution.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            factor: 2.0,
            max_retries: Some(self.retries.max(1)),
        }
    }

    /// Reconnect policy for change feeds (never gives up).
    #[must_use]
    pub fn reconnect_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: None,
            ..self.retry_config()
        }
    }

    #[must_use]
    pub fn ttl_for(&self, kind: EntityKind) -> Duration {
        let ms = self.entity_ttl_ms.get(&kind).copied().unwrap_or(self.cache_ttl_ms);
        Duration::from_millis(ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.use_cache);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.max_queue_attempts, 10);
        assert!(config.state_path.is_none());
    }

    #[test]
    fn test_empty_json_matches_default() {
        let parsed: ClientConfig = serde_json::from_str("{}").unwrap();
        let default = ClientConfig::default();
        assert_eq!(parsed.retries, default.retries);
        assert_eq!(parsed.cache_ttl_ms, default.cache_ttl_ms);
        assert_eq!(parsed.backoff_max_ms, default.backoff_max_ms);
    }

    #[test]
    fn test_retry_config_derivation() {
        let config = ClientConfig {
            retries: 4,
            backoff_base_ms: 250,
            backoff_max_ms: 2_000,
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_retries, Some(4));
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(2));
        assert_eq!(config.reconnect_config().max_retries, None);
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let config = ClientConfig { retries: 0, ..Default::default() };
        assert_eq!(config.retry_config().max_retries, Some(1));
    }
}
