// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic tree-sync usage example.
//!
//! Demonstrates:
//! 1. Signing in and opening a listener on a per-user sync path
//! 2. Saving a few values inside one debounce window (one batch)
//! 3. Another client's change streaming into the local tree
//! 4. Displaying metrics
//!
//! Runs entirely in-process against `MemoryStore`.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde_json::json;
use tree_sync::{
    ChangeCallback, ChangeEvent, MemoryStore, MemoryTree, RemoteStore, SyncEngine, SyncEngineConfig, SyncOptions,
};

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
    println!("║             tree-sync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure the engine and listen
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring tree-sync...");

    let store = Arc::new(MemoryStore::new());
    let config = SyncEngineConfig {
        // Short window so the demo does not wait three seconds
        save_debounce_ms: 200,
        ..Default::default()
    };
    let engine = SyncEngine::new(store.clone(), config);

    let options: SyncOptions = serde_json::from_value(json!({
        "sync_path": "/users/{uid}/",
        "require_auth": true,
        "query_by_modified": {"todos": "*"},
        "field_transforms": {"fields": {"todos": {"nested": {"name": "t", "shape": {"dictionary_of": {"fields": {
            "title": {"rename": "ti"}
        }}}}}}},
    }))?;

    let tree = Arc::new(MemoryTree::new());
    let on_change: ChangeCallback = Arc::new(|event: &ChangeEvent| {
        println!(
            "   └─ {} {:?} → {}",
            if event.initial { "loaded " } else { "changed" },
            event.path,
            event.value.as_ref().map_or("(removed)".to_string(), ToString::to_string)
        );
    });
    let handle = engine.listen(tree.clone(), options.clone(), Some(on_change))?;
    println!("   State before sign-in: {}", handle.state());

    println!("\n🔐 Signing in as 'alice'...");
    store.sign_in("alice");
    handle.wait_loaded().await?;
    println!("   ✅ Loaded! State: {}", handle.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Save a few values in one window
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Saving 3 todos (one debounce window)...");
    let start = Instant::now();
    let (a, b, c) = tokio::join!(
        engine.save(&options, "/todos/t1", json!({"title": "milk", "done": false})),
        engine.save(&options, "/todos/t2", json!({"title": "bread", "done": false})),
        engine.save(&options, "/todos/t1/done", json!(true)),
    );
    for saved in [a?, b?, c?] {
        println!("   └─ Saved {} (modified {:?})", saved.value, saved.date_modified);
    }
    println!("   ⚡ Batch round trip: {:?}", start.elapsed());
    println!("   Batches written: {}", store.batches().len());
    println!("   Remote document: {}", store.value_at("/users/alice"));

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Another client writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Another client adds a todo...");
    store.write_external(
        "/users/alice/t/t3",
        json!({"@": store.server_timestamp(), "ti": {"@": store.server_timestamp(), "_": "eggs"}}),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    println!("   Local tree: {}", tree.snapshot());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        let name = key.key().name().to_string();
        match value {
            DebugValue::Counter(n) => println!("   ├─ {name}: {n}"),
            DebugValue::Gauge(g) => println!("   ├─ {name}: {g}"),
            DebugValue::Histogram(samples) => println!("   ├─ {name}: {} samples", samples.len()),
        }
    }

    println!("\n🛑 Shutting down...");
    engine.flush_now().await?;
    handle.unsubscribe();
    println!("   ✅ Done\n");

    Ok(())
}
