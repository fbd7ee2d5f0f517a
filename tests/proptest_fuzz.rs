//! Property-based tests for the data layer.
//!
//! Uses proptest to check the invariants that must hold for any input:
//! cache TTL boundaries, FIFO queue order, reconciler idempotence,
//! last-write-wins and convergence under redelivery, and filter behaviour on arbitrary records.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio::time::Instant;

use site_sync::subscriber::diff_snapshot;
use site_sync::{
    ChangeEvent, ChangeOp, ContentReconciler, ContentType, EntityKind, ListFilter, LocalStore, MutationQueue,
    MutationRequest, QueuedMutation, RecordId, RegionDescriptor, RegionMap, RequestCache, VirtualDocument,
};

// =============================================================================
// Strategies
// =============================================================================

fn content_type_strategy() -> impl Strategy<Value = ContentType> {
    prop_oneof![
        Just(ContentType::Text),
        Just(ContentType::Html),
        Just(ContentType::Image),
        Just(ContentType::Url),
    ]
}

/// Product-like records with unique ids.
fn records_strategy() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::btree_map(1i64..200, ("[a-z]{1,8}", 0u8..3, 0u32..5), 0..20).prop_map(|rows| {
        rows.into_iter()
            .map(|(id, (name, category, version))| {
                json!({
                    "id": id,
                    "name": name,
                    "category": format!("cat{}", category),
                    "updated_at": format!("2026-01-01T00:00:0{}Z", version),
                })
            })
            .collect()
    })
}

fn reconciler(keys: &[&str]) -> ContentReconciler<VirtualDocument> {
    let mut doc = VirtualDocument::new();
    let mut regions = RegionMap::default();
    for key in keys {
        let selector = format!("#{}", key);
        doc.add_region(selector.clone(), "default");
        regions.insert(*key, RegionDescriptor::new(selector));
    }
    ContentReconciler::new(regions, doc)
}

// =============================================================================
// Cache
// =============================================================================

proptest! {
    /// An entry is served strictly before its TTL elapses and never after.
    #[test]
    fn cache_ttl_boundary(ttl_ms in 1u64..100_000, age_ms in 0u64..200_000) {
        let cache = RequestCache::new(16);
        let now = Instant::now();
        let ttl = Duration::from_millis(ttl_ms);
        cache.insert_at("products:all:*", json!([1]), ttl, now);

        let hit = cache.get_at("products:all:*", now + Duration::from_millis(age_ms));
        prop_assert_eq!(hit.is_some(), age_ms < ttl_ms);
    }

    /// The cache never holds more than its bound, whatever is inserted.
    #[test]
    fn cache_respects_bound(max in 1usize..20, keys in prop::collection::vec("[a-z]{1,4}", 0..100)) {
        let cache = RequestCache::new(max);
        let now = Instant::now();
        for key in &keys {
            cache.insert_at(key.clone(), json!(key), Duration::from_secs(60), now);
            prop_assert!(cache.len() <= max);
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

proptest! {
    /// Applying the same value twice writes nothing the second time.
    #[test]
    fn reconciler_render_is_idempotent(value in ".{0,40}", ct in content_type_strategy()) {
        let mut r = reconciler(&["hero_title"]);
        r.render_region("hero_title", &value, ct);
        let writes = r.document().writes();
        prop_assert_eq!(r.render_region("hero_title", &value, ct), 0);
        prop_assert_eq!(r.document().writes(), writes);
    }

    /// Whatever order timestamped updates arrive in, the newest wins.
    #[test]
    fn reconciler_last_write_wins(order in Just((0u32..8).collect::<Vec<_>>()).prop_shuffle()) {
        let mut r = reconciler(&["contact_phone"]);
        for version in &order {
            let record = json!({
                "id": 1,
                "setting_key": "contact_phone",
                "setting_value": format!("v{}", version),
                "updated_at": format!("2026-02-01T00:00:0{}Z", version),
            });
            r.apply_event(&ChangeEvent::new(EntityKind::SiteSettings, ChangeOp::Update, record));
        }
        prop_assert_eq!(r.document().text("#contact_phone"), Some("v7"));
    }

    /// Redelivering and reordering inserts, updates and deletes of one record
    /// ends in the same page as delivering each once in timestamp order.
    #[test]
    fn reconciler_duplicates_and_deletes_converge((deletes, delivery) in delivery_strategy()) {
        let mut once = reconciler(&["contact_phone"]);
        for (version, delete) in deletes.iter().enumerate() {
            once.apply_event(&setting_event(version, *delete));
        }

        let mut shuffled = reconciler(&["contact_phone"]);
        for version in &delivery {
            shuffled.apply_event(&setting_event(*version, deletes[*version]));
        }

        prop_assert_eq!(shuffled.document().text("#contact_phone"), once.document().text("#contact_phone"));
    }
}

/// Per-version delete flags, and a delivery order that covers every version
/// at least once with some redelivered.
fn delivery_strategy() -> impl Strategy<Value = (Vec<bool>, Vec<usize>)> {
    prop::collection::vec(any::<bool>(), 1..8).prop_flat_map(|deletes| {
        let n = deletes.len();
        (Just(deletes), prop::collection::vec(0..n, 0..n * 2)).prop_flat_map(move |(deletes, extra)| {
            let mut delivery: Vec<usize> = (0..n).collect();
            delivery.extend(extra);
            (Just(deletes), Just(delivery).prop_shuffle())
        })
    })
}

fn setting_event(version: usize, delete: bool) -> ChangeEvent {
    let updated_at = format!("2026-02-01T00:00:{:02}Z", version);
    if delete {
        let mut event = ChangeEvent::new(EntityKind::SiteSettings, ChangeOp::Delete, json!({"id": 3}));
        event.timestamp = DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc);
        event
    } else {
        let record = json!({
            "id": 3,
            "setting_key": "contact_phone",
            "setting_value": format!("v{}", version),
            "updated_at": updated_at,
        });
        ChangeEvent::new(EntityKind::SiteSettings, ChangeOp::Update, record)
    }
}

// =============================================================================
// Snapshot diffing and filters
// =============================================================================

proptest! {
    /// Replaying the diff of two snapshots onto the first yields the second.
    #[test]
    fn diff_replay_reaches_current(previous in records_strategy(), current in records_strategy()) {
        let events = diff_snapshot(EntityKind::Products, &previous, &current);
        let mut state: std::collections::BTreeMap<String, Value> = previous
            .iter()
            .map(|r| (r["id"].to_string(), r.clone()))
            .collect();
        for event in events {
            let id = event.record["id"].to_string();
            match event.operation {
                ChangeOp::Insert | ChangeOp::Update => { state.insert(id, event.record); }
                ChangeOp::Delete => { state.remove(&id); }
            }
        }
        let expected: std::collections::BTreeMap<String, Value> = current
            .iter()
            .map(|r| (r["id"].to_string(), r.clone()))
            .collect();
        // Same identity set; changed records carry the new version
        prop_assert_eq!(state.keys().collect::<Vec<_>>(), expected.keys().collect::<Vec<_>>());
        for (id, record) in &expected {
            prop_assert_eq!(&state[id]["updated_at"], &record["updated_at"]);
        }
    }

    /// No events between identical snapshots.
    #[test]
    fn diff_of_identical_snapshots_is_empty(records in records_strategy()) {
        prop_assert!(diff_snapshot(EntityKind::Products, &records, &records).is_empty());
    }

    /// Filtered results satisfy the filter and respect the limit.
    #[test]
    fn filter_apply_is_sound(records in records_strategy(), category in 0u8..3, limit in 0usize..10) {
        let filter = ListFilter::default()
            .eq("category", format!("cat{}", category))
            .order_by_desc("id")
            .limit(limit);
        let rows = filter.apply(records);
        prop_assert!(rows.len() <= limit);
        for row in &rows {
            prop_assert!(filter.matches(row));
        }
        for pair in rows.windows(2) {
            prop_assert!(pair[0]["id"].as_i64() >= pair[1]["id"].as_i64());
        }
    }

    /// Plain ids match records by their `id` field, whatever its JSON type.
    #[test]
    fn record_id_matches_numeric_and_string(id in 1i64..1_000_000) {
        let record_id = RecordId::from(id);
        let numeric = json!({"id": id});
        let string = json!({"id": id.to_string()});
        let other = json!({"id": id + 1});
        prop_assert!(record_id.matches(&numeric));
        prop_assert!(record_id.matches(&string));
        prop_assert!(!record_id.matches(&other));
    }
}

// =============================================================================
// Queue order
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Pending mutations come back in enqueue order.
    #[test]
    fn queue_is_fifo(names in prop::collection::vec("[a-z]{1,6}", 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let pending = runtime.block_on(async {
            let queue = MutationQueue::new(LocalStore::open(None).await.unwrap());
            for name in &names {
                let mutation = QueuedMutation::new(
                    EntityKind::Products,
                    MutationRequest::Create { payload: json!({"name": name, "category": "x"}) },
                );
                queue.enqueue(&mutation).await.unwrap();
            }
            queue.pending().await.unwrap()
        });

        let queued: Vec<String> = pending
            .iter()
            .filter_map(|m| m.request.payload().and_then(|p| p["name"].as_str()).map(str::to_string))
            .collect();
        prop_assert_eq!(queued, names);
    }
}
