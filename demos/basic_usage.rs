// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic site-sync usage example.
//!
//! Demonstrates, without any network services:
//! 1. Seeding three in-memory backends that share one dataset
//! 2. Starting the orchestrator (probe, drain, initial render)
//! 3. Typed reads, with the second one served from the cache
//! 4. Going offline: a write is queued in SQLite instead of failing
//! 5. Coming back: the queue drains and the page picks up the change
//! 6. Displaying the recorded metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::time::{Duration, Instant};

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use site_sync::{
    BackendMode, BackendSet, ClientConfig, ClientContext, EntityKind, LocalStore, MemoryBackend, MutationOutcome,
    RegionMap, SiteSetting, SiteSync, VirtualDocument,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             site-sync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Backends and seed data
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Seeding in-memory backends...");
    let primary = MemoryBackend::new(BackendMode::PrimaryRemote);
    let local = MemoryBackend::sharing(BackendMode::LocalOrigin, &primary);
    let service = MemoryBackend::sharing(BackendMode::DirectService, &primary);

    let data = primary.dataset();
    data.insert(
        EntityKind::PageContent,
        &json!({"page_name": "home", "content_key": "hero_title", "content_value": "LED walls that sell",
                "content_type": "text", "updated_at": "2026-01-10T09:00:00Z"}),
    )?;
    let setting = data.insert(
        EntityKind::SiteSettings,
        &json!({"setting_key": "contact_phone", "setting_value": "+1 555 0100",
                "updated_at": "2026-01-10T09:00:00Z"}),
    )?;
    for (name, category) in [("Indoor P2.5", "indoor"), ("Outdoor P6", "outdoor"), ("Rental P3.9", "rental")] {
        data.insert(EntityKind::Products, &json!({"name": name, "category": category, "is_active": true}))?;
    }

    let backends = BackendSet::new()
        .with(primary.clone())
        .with(local.clone())
        .with(service.clone());
    let config = ClientConfig {
        retries: 2,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        poll_interval_ms: 500,
        ..Default::default()
    };
    let store = LocalStore::open(None).await?;
    let ctx = ClientContext::with_store(config.clone(), backends, store);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Start the orchestrator
    // ─────────────────────────────────────────────────────────────────────────
    let document = VirtualDocument::new()
        .with_region("#hero h1", "Welcome")
        .with_region("#contact .phone", "(call us)")
        .with_region("footer .phone", "(call us)");
    let (_config_tx, config_rx) = watch::channel(config);
    let mut sync = SiteSync::new(ctx.clone(), document, RegionMap::builtin(), config_rx);
    println!("   State: {}", sync.state());

    println!("\n🚀 Starting...");
    let report = sync.start().await?;
    println!("   ✅ Ready on {} ({:?})", report.probe.mode, report.probe.outcome);
    println!("   └─ Rendered {} records into {} region writes", report.reconcile.records, report.reconcile.region_writes);
    println!("   └─ #hero h1       = {:?}", sync.document().text("#hero h1"));
    println!("   └─ #contact .phone = {:?}", sync.document().text("#contact .phone"));

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Typed reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading products (twice, to show the cache)...");
    for pass in 1..=2 {
        let start = Instant::now();
        let products = sync.client().products().get_all(None).await?;
        println!("   └─ pass {}: {} products in {:?}", pass, products.len(), start.elapsed());
    }
    let stats = ctx.cache().stats();
    println!("   ⚡ Cache: {} hits, {} misses, {} entries", stats.hits, stats.misses, stats.entries);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Offline write
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔌 Taking every backend offline...");
    for backend in [&primary, &local, &service] {
        backend.set_available(false);
    }
    let setting_id = setting["id"].as_i64().unwrap_or_default();
    let phone = SiteSetting {
        id: Some(setting_id),
        setting_key: "contact_phone".into(),
        setting_value: "+1 555 0199".into(),
        content_type: Default::default(),
        description: None,
        created_at: None,
        updated_at: None,
    };
    match sync.client().site_settings().update(setting_id, &phone).await? {
        MutationOutcome::Queued { mutation_id } => println!("   └─ Update queued as {}", mutation_id),
        MutationOutcome::Succeeded(_) => println!("   └─ Unexpectedly delivered"),
    }
    if let Some(queue) = sync.client().queue() {
        println!("   └─ Queue length: {}", queue.len().await?);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Recovery
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔋 Bringing backends back and draining...");
    for backend in [&primary, &local, &service] {
        backend.set_available(true);
    }
    let client = sync.client().clone();
    if let Some(queue) = client.queue() {
        let drained = queue.drain(&client).await?;
        println!("   └─ Delivered {}, remaining {}", drained.delivered, drained.remaining);
    }

    // Run the loop long enough for a poll to pick up the delivered change
    let handle = sync.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.shutdown();
    });
    sync.run().await;
    println!("   └─ #contact .phone = {:?}", sync.document().text("#contact .phone"));
    println!("   └─ footer .phone   = {:?}", sync.document().text("footer .phone"));

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    sync.shutdown().await;
    println!("   ✅ State: {}", sync.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");
    Ok(())
}

/// Print every captured metric grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<(String, String)> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let name = if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), labels.join(","))
        };
        let rendered = match value {
            DebugValue::Counter(v) => format!("counter   {}", v),
            DebugValue::Gauge(v) => format!("gauge     {:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                format!("histogram count={} avg={:.4}", count, avg)
            }
        };
        lines.push((name, rendered));
    }

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
        return;
    }
    lines.sort();
    for (name, rendered) in lines {
        println!("   └─ {:<50} {}", name, rendered);
    }
}
