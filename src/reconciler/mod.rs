// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content reconciler.
//!
//! Applies live entity values to the page regions that display them. A
//! static [`RegionMap`] maps content keys to selectors:
//!
//! ```text
//! page_content{home, hero_title} ──▶ "hero_title"      ──▶ #hero h1, title
//!                                └─▶ "home.hero_title" ──▶ (unmapped)
//! site_settings{contact_phone}   ──▶ "contact_phone"   ──▶ #contact .phone, footer .phone
//! products{id: 7}.name           ──▶ "products.7.name" ──▶ (whatever the map says)
//! ```
//!
//! # Guarantees
//!
//! - Last write wins per key, ordered by event timestamp; older events are
//!   dropped
//! - Re-applying the value a key already shows writes nothing
//! - Regions without a live value keep their static content; a delete puts
//!   it back and leaves a tombstone, so older values delivered again after
//!   it stay dropped
//! - Events are applied in arrival order

pub mod document;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::client::EntityClient;
use crate::entity::{scalar_to_string, ChangeEvent, ChangeOp, ContentType, EntityKind};
use crate::error::ClientError;
use crate::metrics;

pub use document::{Document, RegionState, VirtualDocument};

const BUILTIN_REGIONS: &str = include_str!("../../assets/regions.json");

/// Where an image value goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageTarget {
    #[default]
    Src,
    Background,
}

/// One page region a content key renders into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub selector: String,
    /// Overrides the record's content type for this region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub image_target: ImageTarget,
}

impl RegionDescriptor {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            content_type: None,
            image_target: ImageTarget::Src,
        }
    }
}

/// Content key → regions. Loaded once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionMap {
    regions: HashMap<String, Vec<RegionDescriptor>>,
}

impl RegionMap {
    pub fn from_json(json: &str) -> Result<Self, ClientError> {
        serde_json::from_str(json).map_err(|e| ClientError::Config(format!("region map: {}", e)))
    }

    /// The map shipped in `assets/regions.json`.
    pub fn builtin() -> Self {
        Self::from_json(BUILTIN_REGIONS).unwrap_or_else(|e| {
            warn!(error = %e, "Built-in region map is invalid, rendering nothing");
            Self::default()
        })
    }

    pub fn insert(&mut self, key: impl Into<String>, descriptor: RegionDescriptor) {
        self.regions.entry(key.into()).or_default().push(descriptor);
    }

    #[must_use]
    pub fn descriptors(&self, key: &str) -> &[RegionDescriptor] {
        self.regions.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// What a key last showed. `None` is a tombstone: the key was deleted at
/// `timestamp` and shows its static content.
#[derive(Debug, Clone, PartialEq)]
struct Applied {
    value: Option<(String, ContentType)>,
    timestamp: Option<DateTime<Utc>>,
}

impl Applied {
    fn supersedes(&self, timestamp: DateTime<Utc>) -> bool {
        match (self.timestamp, &self.value) {
            (Some(shown), Some(_)) => shown > timestamp,
            (Some(deleted), None) => deleted >= timestamp,
            (None, _) => false,
        }
    }
}

/// Outcome of the initial bulk pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub records: usize,
    pub region_writes: usize,
    /// Entities that could not be read; their regions keep static content.
    pub failed: Vec<EntityKind>,
}

/// Entities read by the initial pass, in order.
const INITIAL_ENTITIES: [EntityKind; 4] = [
    EntityKind::PageContent,
    EntityKind::SiteSettings,
    EntityKind::Products,
    EntityKind::News,
];

pub struct ContentReconciler<D> {
    regions: RegionMap,
    document: D,
    applied: HashMap<String, Applied>,
    /// Keys each record rendered, so a delete can restore them.
    record_keys: HashMap<(EntityKind, String), Vec<String>>,
    /// Latest delete seen per record.
    deleted: HashMap<(EntityKind, String), DateTime<Utc>>,
}

impl<D: Document> ContentReconciler<D> {
    pub fn new(regions: RegionMap, document: D) -> Self {
        Self {
            regions,
            document,
            applied: HashMap::new(),
            record_keys: HashMap::new(),
            deleted: HashMap::new(),
        }
    }

    #[must_use]
    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    #[must_use]
    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }

    pub fn into_document(self) -> D {
        self.document
    }

    /// Apply `value` to every region mapped to `key`. Returns the number of
    /// region writes.
    pub fn render_region(&mut self, key: &str, value: &str, content_type: ContentType) -> usize {
        self.apply_value(key, value, content_type, None)
    }

    /// Apply a record as if it had just been updated remotely.
    pub fn apply_entity_update(&mut self, kind: EntityKind, payload: &Value) -> usize {
        self.apply_event(&ChangeEvent::new(kind, ChangeOp::Update, payload.clone()))
    }

    pub fn apply_event(&mut self, event: &ChangeEvent) -> usize {
        let writes = match event.operation {
            ChangeOp::Insert | ChangeOp::Update => self.apply_record(event),
            ChangeOp::Delete => self.remove_record(event),
        };
        if writes > 0 {
            metrics::record_region_writes(writes);
        }
        trace!(entity = %event.entity, op = %event.operation, writes, "Change event applied");
        writes
    }

    fn apply_record(&mut self, event: &ChangeEvent) -> usize {
        let record = event.record_id().map(|id| (event.entity, id.to_string()));
        if let Some(deleted_at) = record.as_ref().and_then(|r| self.deleted.get(r)) {
            if *deleted_at >= event.timestamp {
                trace!(entity = %event.entity, "Ignoring value older than its delete");
                metrics::record_stale_event(event.entity.table());
                return 0;
            }
        }

        let values = region_values(event.entity, &event.record);
        let mut writes = 0;
        let mut keys = Vec::with_capacity(values.len());
        for (key, value, content_type) in values {
            if self.regions.descriptors(&key).is_empty() {
                continue;
            }
            if self.is_stale(&key, event.timestamp) {
                trace!(key = %key, "Ignoring stale value");
                metrics::record_stale_event(event.entity.table());
                continue;
            }
            writes += self.apply_value(&key, &value, content_type, Some(event.timestamp));
            keys.push(key);
        }
        if let Some(record) = record {
            if !keys.is_empty() {
                let owned = self.record_keys.entry(record).or_default();
                for key in keys {
                    if !owned.contains(&key) {
                        owned.push(key);
                    }
                }
            }
        }
        writes
    }

    fn remove_record(&mut self, event: &ChangeEvent) -> usize {
        let Some(id) = event.record_id() else {
            debug!(entity = %event.entity, "Delete without identity ignored");
            return 0;
        };
        let record = (event.entity, id.to_string());
        let deleted_at = self.deleted.entry(record.clone()).or_insert(event.timestamp);
        *deleted_at = (*deleted_at).max(event.timestamp);

        let Some(keys) = self.record_keys.remove(&record) else {
            return 0;
        };

        let mut writes = 0;
        let mut kept = Vec::new();
        for key in keys {
            if self.is_stale(&key, event.timestamp) {
                metrics::record_stale_event(event.entity.table());
                kept.push(key);
                continue;
            }
            self.applied.insert(
                key.clone(),
                Applied {
                    value: None,
                    timestamp: Some(event.timestamp),
                },
            );
            for descriptor in self.regions.descriptors(&key) {
                writes += self.document.restore_default(&descriptor.selector);
            }
        }
        if !kept.is_empty() {
            self.record_keys.insert(record, kept);
        }
        writes
    }

    /// Whether `key` already shows a value, or a delete, newer than `timestamp`.
    fn is_stale(&self, key: &str, timestamp: DateTime<Utc>) -> bool {
        self.applied.get(key).is_some_and(|applied| applied.supersedes(timestamp))
    }

    fn apply_value(&mut self, key: &str, value: &str, content_type: ContentType, timestamp: Option<DateTime<Utc>>) -> usize {
        if let Some(previous) = self.applied.get_mut(key) {
            if previous
                .value
                .as_ref()
                .is_some_and(|(shown, ct)| shown == value && *ct == content_type)
            {
                previous.timestamp = previous.timestamp.max(timestamp);
                return 0;
            }
        }

        let mut writes = 0;
        for descriptor in self.regions.descriptors(key) {
            let effective = descriptor.content_type.unwrap_or(content_type);
            let selector = descriptor.selector.as_str();
            writes += match effective {
                ContentType::Text => self.document.set_text(selector, value),
                ContentType::Html => self.document.set_html(selector, value),
                ContentType::Image => match descriptor.image_target {
                    ImageTarget::Src => self.document.set_image_src(selector, value),
                    ImageTarget::Background => self.document.set_background(selector, value),
                },
                ContentType::Url => self.document.set_href(selector, value),
            };
        }
        self.applied.insert(
            key.to_string(),
            Applied {
                value: Some((value.to_string(), content_type)),
                timestamp,
            },
        );
        writes
    }

    /// Bulk pass on page load. Unreadable entities leave their regions at
    /// their static content.
    #[tracing::instrument(skip(self, client))]
    pub async fn reconcile_initial(&mut self, client: &EntityClient) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for kind in INITIAL_ENTITIES {
            match client.raw(kind).get_all(None).await {
                Ok(records) => {
                    for record in records {
                        report.region_writes += self.apply_event(&ChangeEvent::new(kind, ChangeOp::Insert, record));
                        report.records += 1;
                    }
                }
                Err(e) => {
                    warn!(entity = %kind, error = %e, "Initial content read failed, keeping defaults");
                    report.failed.push(kind);
                }
            }
        }
        debug!(records = report.records, writes = report.region_writes, "Initial reconcile complete");
        report
    }

    /// Apply events in arrival order until the stream ends. Returns how
    /// many events were processed.
    pub async fn run<S>(&mut self, mut events: S) -> usize
    where
        S: Stream<Item = ChangeEvent> + Unpin,
    {
        let mut processed = 0;
        while let Some(event) = events.next().await {
            self.apply_event(&event);
            processed += 1;
        }
        processed
    }
}

/// `(key, value, content type)` triples a record renders.
fn region_values(kind: EntityKind, record: &Value) -> Vec<(String, String, ContentType)> {
    let content_type = |field: &str| {
        record
            .get(field)
            .cloned()
            .and_then(|v| serde_json::from_value::<ContentType>(v).ok())
            .unwrap_or_default()
    };
    let text = |field: &str| record.get(field).and_then(scalar_to_string);

    match kind {
        EntityKind::PageContent => {
            let (Some(page), Some(key), Some(value)) = (text("page_name"), text("content_key"), text("content_value")) else {
                return Vec::new();
            };
            let ct = content_type("content_type");
            vec![(format!("{}.{}", page, key), value.clone(), ct), (key, value, ct)]
        }
        EntityKind::SiteSettings => match (text("setting_key"), text("setting_value")) {
            (Some(key), Some(value)) => vec![(key, value, content_type("content_type"))],
            _ => Vec::new(),
        },
        _ => {
            let (Some(id), Value::Object(fields)) = (text("id"), record) else {
                return Vec::new();
            };
            fields
                .iter()
                .filter(|(field, _)| field.as_str() != "id")
                .filter_map(|(field, value)| {
                    let value = scalar_to_string(value)?;
                    Some((format!("{}.{}.{}", kind.table(), id, field), value, field_content_type(field)))
                })
                .collect()
        }
    }
}

fn field_content_type(field: &str) -> ContentType {
    if field.ends_with("image_url") || field.ends_with("image") {
        ContentType::Image
    } else if field.ends_with("_url") {
        ContentType::Url
    } else {
        ContentType::Text
    }
}
