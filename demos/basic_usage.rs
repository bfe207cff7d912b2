// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic query-cache usage example.
//!
//! Demonstrates:
//! 1. Scoping a persistent cache to a signed-in user
//! 2. Writing two query results that share one entity
//! 3. Reading the first query back after the second one changed the entity
//! 4. Re-publish callbacks for impacted queries
//! 5. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use query_cache::{CacheConfig, CacheFacade, QueryId, RepublishError, Republisher, ServerResult, StorageKind};
use serde_json::json;

/// Prints every impacted query instead of pushing to subscribers.
struct PrintRepublisher;

#[async_trait]
impl Republisher for PrintRepublisher {
    async fn republish(&self, query_id: &QueryId) -> Result<(), RepublishError> {
        println!("   🔔 re-publish {}", query_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           query-cache: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and scope the cache
    // ─────────────────────────────────────────────────────────────────────────
    let dir = std::env::temp_dir().join("query-cache-demo");
    let config = CacheConfig {
        storage: StorageKind::Persistent,
        cache_dir: Some(dir.clone()),
        project_id: "demo".into(),
        host: "api.example.com".into(),
        ..Default::default()
    };
    let facade = CacheFacade::new(config, Some(Arc::new(PrintRepublisher)));
    let status = facade.on_auth_changed(Some("user-1")).await;
    println!("📦 Cache scoped: {} (dir {})", status, dir.display());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Two queries, one entity
    // ─────────────────────────────────────────────────────────────────────────
    let item = QueryId::new("GetItem", &json!({"id": "G1"}));
    let list = QueryId::new("ListItems", &json!({"limit": 10}));

    let item_result = ServerResult::from_response(
        r#"{"item": {"id": "G1", "name": "Lamp", "price": 10}}"#,
        Some(60),
        &json!([{"path": ["item"], "entityId": "G1"}]),
    )?;
    let list_result = ServerResult::from_response(
        r#"{"items": [{"id": "G1", "name": "Lamp", "price": 20}, {"id": "G2", "name": "Desk", "price": 90}]}"#,
        Some(60),
        &json!([{"path": ["items"], "entityIds": ["G1", "G2"]}]),
    )?;

    println!("\n📝 Writing {} ...", item);
    let start = Instant::now();
    facade.write(&item, &item_result, Some(&item)).await;
    println!("   └─ done ({:?})", start.elapsed());

    println!("\n📝 Writing {} (changes G1's price) ...", list);
    let outcome = facade.write(&list, &list_result, Some(&list)).await;
    println!("   └─ impacted: {:?}", outcome.impacted);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read the first query back
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading {} ...", item);
    let start = Instant::now();
    match facade.read(&item).await {
        Some(cached) => println!("   └─ {} (stale: {}, {:?})", cached.data, cached.stale, start.elapsed()),
        None => println!("   └─ miss"),
    }

    // let the re-publish task print
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    if let Some(stats) = facade.stats().await {
        println!("\n📊 {} result trees, {} entities", stats.result_trees, stats.entities);
    }

    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut lines: Vec<String> = vec![];
    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{}", v),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} sum={:.4}", count, sum)
            }
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
