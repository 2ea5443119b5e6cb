// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic failover-store usage example.
//!
//! Demonstrates, entirely in memory:
//! 1. Starting an engine over a master and two backups
//! 2. Writing users, a group and an interest through the data access layer
//! 3. Replicating the master into the backups
//! 4. Losing the master and failing over mid-request
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use failover_store::{
    BackendConfig, BackendKind, BackendTable, EngineConfig, EntityFamily, EntityFilter, InMemoryStore, Interest,
    InterestGroup, MemoryConnector, MemoryPointerStore, Role, StoreEngine, User,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

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
    println!("║           failover-store: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring backends...");

    let databases = BackendTable::new()
        .with("primary", BackendConfig::new(BackendKind::Mysql, Role::Master).with_url("mysql://demo@localhost/app"))
        .with("local", BackendConfig::new(BackendKind::Sqlite, Role::Backup).with_database("demo.db"))
        .with("cache", BackendConfig::new(BackendKind::Redis, Role::Backup).with_url("redis://localhost:6379"));
    let config = EngineConfig {
        databases,
        liveness_interval_ms: 200,
        connect_timeout_ms: 1_000,
        ..Default::default()
    };

    // Memory stores stand in for the real drivers
    let connector = Arc::new(MemoryConnector::new());
    let primary = connector.register("primary", Arc::new(InMemoryStore::new()));
    let local = connector.register("local", Arc::new(InMemoryStore::new()));
    let cache = connector.register("cache", Arc::new(InMemoryStore::new()));
    let pointer = Arc::new(MemoryPointerStore::new());

    let engine = Arc::new(StoreEngine::new(config, connector, pointer.clone()));
    println!("   State: {}", engine.state());

    println!("\n🚀 Starting engine...");
    let master = engine.start().await?;
    println!("   ✅ Master: {} (state: {})", master, engine.state());
    let monitor = engine.spawn_health_monitor();

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write through the data access layer
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing sample entities...");
    let access = engine.access();

    access.add_entity(User::new("u-alice", "alice", "alice@example.com", "hash").into()).await?;
    access.add_entity(User::new("u-bob", "bob", "bob@example.com", "hash").into()).await?;
    access.add_entity(InterestGroup::new("g-music", "Music").into()).await?;
    access.add_entity(Interest::new("i-jazz", "Jazz", "g-music").into()).await?;
    access.follow_interest("i-jazz", "u-alice").await?;
    access.follow_user("u-alice", "u-bob").await?;
    println!("   └─ 2 users, 1 group, 1 interest, 2 follows");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Replicate after the mutating request
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Replicating into backups...");
    if let Some(pass) = access.on_request_completed("POST") {
        let report = pass.await?;
        for outcome in &report.backups {
            println!("   └─ {} → {:?}", outcome.backend, outcome.counts);
        }
    }
    println!("   └─ local users: {}, cache users: {}", local.snapshot(EntityFamily::User).len(), cache.snapshot(EntityFamily::User).len());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Lose the master
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Taking the master offline...");
    primary.set_reachable(false);

    let alice = access.fetch_entity(EntityFamily::User, &EntityFilter::uuid("u-alice")).await?;
    println!("   └─ fetched after failover: {:?}", alice.map(|e| e.uuid().to_string()));
    println!("   └─ master now: {:?}", engine.manager().master_name());
    println!("   └─ pointer history: {:?}", pointer.history());
    println!("   └─ pending catch-ups: {:?}", engine.failover().pending_catch_ups());

    let followers = access.interest_followers("i-jazz").await?;
    println!("   └─ jazz followers: {:?}", followers.iter().map(|u| u.username.as_str()).collect::<Vec<_>>());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown();
    monitor.await??;
    println!("   ✅ Shutdown complete!");

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}
