// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Tree Sync
//!
//! Mirrors a local JSON value tree to a realtime hierarchical document store
//! and back, with debounced batched writes and incremental reads.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Save path                            │
//! │  • save(path, value) renamed to remote names                │
//! │  • merged into a per-root pending tree (last write wins)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (debounce window per sync root)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Atomic batch update                      │
//! │  • pending tree flattened to disjoint path → value entries  │
//! │  • server timestamps injected per timestamp policy          │
//! │  • every save of the cycle resolves with the outcome        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Listen path                           │
//! │  • initial snapshot, range-filtered by newest local stamp   │
//! │  • child events decoded and renamed to local names          │
//! │  • echoes of own pending writes routed to their save        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tree_sync::{MemoryStore, MemoryTree, SyncEngine, SyncEngineConfig, SyncOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     store.sign_in("u1");
//!     let engine = SyncEngine::new(store.clone(), SyncEngineConfig::default());
//!
//!     let options: SyncOptions = serde_json::from_value(json!({
//!         "sync_path": "/users/{uid}/",
//!         "require_auth": true,
//!         "query_by_modified": {"todos": "*"},
//!     })).unwrap();
//!
//!     let tree = Arc::new(MemoryTree::new());
//!     let handle = engine.listen(tree.clone(), options.clone(), None).unwrap();
//!     handle.wait_loaded().await.unwrap();
//!
//!     engine.save(&options, "/todos/t1", json!({"title": "milk"})).await.unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncEngine`] with `save`, `listen` and `flush_now`
//! - [`batching`]: pending-save tree and per-root flush state
//! - [`transform`]: local/remote field renaming
//! - [`modified`]: server-timestamp stamping and decoding
//! - [`storage`]: the [`RemoteStore`] contract and [`MemoryStore`]
//! - [`local_tree`]: the [`LocalTree`] contract and [`MemoryTree`]

pub mod batching;
pub mod config;
pub mod coordinator;
pub mod local_tree;
pub mod metrics;
pub mod modified;
pub mod storage;
pub mod transform;
pub mod value;

pub use batching::pending_tree::PendingNode;
pub use batching::save_batcher::{ConfirmedValue, FlushReason};
pub use config::{SyncEngineConfig, SyncOptions, SyncPath};
pub use coordinator::{ChangeCallback, ChangeEvent, ListenHandle, ListenState, SavedValue, SyncEngine, SyncError};
pub use local_tree::{LocalTree, MemoryTree};
pub use metrics::LatencyTimer;
pub use modified::ModifiedSpec;
pub use storage::memory::MemoryStore;
pub use storage::traits::{ChildEvent, ChildEventKind, Query, RemoteStore, StoreError, Subscription};
pub use transform::{FieldTransform, FieldTransformMap, TransformValidationError};
