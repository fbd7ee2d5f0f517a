// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Site Sync
//!
//! Resilient data access and live content synchronization for the marketing
//! site and its admin console.
//!
//! ## Architecture
//!
//! The same logical entities (products, news, inquiries, page content, site
//! settings) are reachable through three interchangeable backends. The client
//! picks the best one, caches reads, retries and fails over, and keeps the
//! rendered page in step with remote changes:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Entity Client                         │
//! │  • Typed get_all / get_by_id / create / update / delete    │
//! │  • Cache invalidation on write                             │
//! │  • Queued outcome when every backend is down               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Resilient Request Executor                  │
//! │  • TTL request cache                                       │
//! │  • Per-attempt timeout, exponential backoff                │
//! │  • Failover across modes in priority order                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//!  primary-remote         local-origin         direct-service
//!  (serverless API)     (same-origin API)    (REST + push feed)
//!
//!  Change Subscriber ──▶ Content Reconciler ──▶ Document regions
//!  Mutation Queue (SQLite) ──drain──▶ Entity Client
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use site_sync::{ClientConfig, RegionMap, SiteSync, VirtualDocument};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), site_sync::ClientError> {
//!     let config = ClientConfig {
//!         primary_url: Some("https://example.com/api".into()),
//!         service_url: Some("https://project.example.co".into()),
//!         service_key: Some("anon-key".into()),
//!         state_path: Some("./site_sync.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config);
//!     let document = VirtualDocument::new().with_region("#hero h1", "Welcome");
//!     let mut sync = SiteSync::connect(document, RegionMap::builtin(), rx).await?;
//!
//!     sync.start().await?;
//!     let products = sync.client().products().get_all(None).await?;
//!     println!("{} products", products.len());
//!
//!     sync.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`backend`]: backend modes and the HTTP and in-memory backends
//! - [`context`]: shared client state (mode, cache, health, local store)
//! - [`probe`]: backend discovery
//! - [`executor`]: cached, retried, failing-over request execution
//! - [`client`]: the typed entity client
//! - [`subscriber`]: push or polled change streams
//! - [`reconciler`]: applying live values to page regions
//! - [`queue`]: the durable mutation queue
//! - [`sync`]: the [`SiteSync`] orchestrator

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod probe;
pub mod queue;
pub mod reconciler;
pub mod resilience;
pub mod state;
pub mod subscriber;
pub mod sync;

pub use backend::{ApiBackend, BackendMode, BackendSet, EntityBackend, MemoryBackend, MemoryDataset, ServiceBackend};
pub use cache::{CacheStats, RequestCache};
pub use client::{Collection, EntityClient, MutationOutcome, RawCollection};
pub use config::ClientConfig;
pub use context::ClientContext;
pub use entity::{
    ChangeEvent, ChangeOp, ContentType, Entity, EntityKind, Inquiry, ListFilter, NewsArticle, PageContent, Product,
    RecordId, SiteSetting,
};
pub use error::{BackendError, ClientError, ValidationError};
pub use executor::{ExecuteOptions, Executor};
pub use metrics::LatencyTimer;
pub use probe::{BackendProbe, ProbeOutcome, ProbeReport};
pub use queue::{DrainReport, MutationQueue, MutationRequest, MutationState, QueueEvent, QueueStats, QueuedMutation};
pub use reconciler::{ContentReconciler, Document, ReconcileReport, RegionDescriptor, RegionMap, VirtualDocument};
pub use resilience::health::ModeHealth;
pub use resilience::retry::RetryConfig;
pub use state::LocalStore;
pub use subscriber::{ChangeSubscriber, Subscription};
pub use sync::{ShutdownHandle, SiteSync, StartupReport, SyncState};
