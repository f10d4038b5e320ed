// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties the pieces together:
//! - saves are transformed to remote names, accumulated per sync root and
//!   flushed as one debounced atomic multi-path update
//! - listeners load a subtree once, then stream child changes into the
//!   local tree
//! - remote changes that overlap an own pending write are parked as
//!   confirmed values and merged into that save's result instead of being
//!   applied locally
//!
//! ```text
//!            save()                                  listen()
//!              │                                        │
//!              ▼                                        ▼
//!   ┌─────────────────────┐   echo overlaps    ┌──────────────────┐
//!   │ SyncRoot (per path) │◄───pending write───│ child callbacks  │
//!   │ pending / in flight │                    └──────────────────┘
//!   └─────────────────────┘                             │ otherwise
//!              │ debounce                               ▼
//!              ▼                                   LocalTree::set
//!     RemoteStore::atomic_update
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tree_sync::{MemoryStore, SyncEngine, SyncEngineConfig, SyncOptions};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! let engine = SyncEngine::new(store, SyncEngineConfig::default());
//!
//! let options = SyncOptions::at("/base/users/u1/");
//! let saved = engine.save(&options, "/name", json!("Ann")).await.unwrap();
//! assert_eq!(saved.value, json!("Ann"));
//! # }
//! ```

mod auth;
mod flush;
mod listen;
mod save;
mod types;

pub use listen::ListenHandle;
pub use types::{ChangeCallback, ChangeEvent, ListenState, SavedValue, SyncError};

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tracing::{debug, warn};

use crate::batching::save_batcher::{ConfirmedValue, SyncRoot};
use crate::config::{SyncEngineConfig, SyncOptions};
use crate::metrics;
use crate::storage::traits::RemoteStore;

use auth::AuthGate;

/// Keeps a local tree and a remote store in sync.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
    pub(super) config: Arc<SyncEngineConfig>,
    pub(super) store: Arc<dyn RemoteStore>,

    /// Save state per resolved base path
    pub(super) roots: Arc<DashMap<String, Arc<SyncRoot>>>,

    /// Live loaded listeners per full remote path
    pub(super) loaded: Arc<DashMap<String, usize>>,

    auth: Arc<AuthGate>,

    /// Sync path templates whose transform maps were already checked
    validated: Arc<DashSet<String>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            store,
            roots: Arc::new(DashMap::new()),
            loaded: Arc::new(DashMap::new()),
            auth: Arc::new(AuthGate::new()),
            validated: Arc::new(DashSet::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Number of sync roots with outstanding work.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// True if any root has writes that are not yet confirmed by the store.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.roots.iter().any(|entry| {
            let state = entry.value().lock();
            !state.pending().is_empty() || state.in_flight_count() > 0
        })
    }

    /// Whether a live listener at this absolute remote path completed its
    /// first load.
    #[must_use]
    pub fn is_loaded(&self, remote_path: &str) -> bool {
        self.loaded.contains_key(remote_path)
    }

    pub(super) fn retain_loaded(&self, remote_path: &str) {
        *self.loaded.entry(remote_path.to_string()).or_insert(0) += 1;
    }

    pub(super) fn release_loaded(&self, remote_path: &str) {
        if let Some(mut count) = self.loaded.get_mut(remote_path) {
            *count = count.saturating_sub(1);
        }
        self.loaded.remove_if(remote_path, |_, count| *count == 0);
    }

    /// True once a signed-in principal has been observed.
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.auth.is_open()
    }

    pub(super) async fn wait_for_auth(&self) -> Result<(), SyncError> {
        let timeout = self.config.auth_timeout_ms.map(Duration::from_millis);
        self.auth.wait(self.store.as_ref(), timeout).await
    }

    pub(super) fn resolve_base(&self, options: &SyncOptions) -> Result<String, SyncError> {
        let principal = self.store.current_principal();
        options
            .sync_path
            .resolve(principal.as_deref())
            .ok_or_else(|| SyncError::NotSignedIn(options.sync_path.template().to_string()))
    }

    pub(super) fn root_for(&self, base: &str, options: &SyncOptions) -> Arc<SyncRoot> {
        let root = self
            .roots
            .entry(base.to_string())
            .or_insert_with(|| {
                debug!(base_path = base, "Sync root created");
                Arc::new(SyncRoot::new(base, options.clone()))
            })
            .clone();
        metrics::set_active_roots(self.roots.len());
        root
    }

    /// Drop `root` from the map if it has nothing left to do.
    pub(super) fn retire(&self, root: &Arc<SyncRoot>) {
        let removed = self
            .roots
            .remove_if(root.base_path(), |_, current| {
                Arc::ptr_eq(current, root) && current.lock().retire_if_idle()
            })
            .is_some();
        if removed {
            debug!(base_path = root.base_path(), "Sync root retired");
            metrics::set_active_roots(self.roots.len());
        }
    }

    /// Hand a remote change to the root whose own writes it overlaps.
    ///
    /// Returns the value back when no pending or in-flight write overlaps it.
    pub(super) fn route_confirmed(&self, base: &str, value: ConfirmedValue) -> Option<ConfirmedValue> {
        let root = self.roots.get(base).map(|entry| Arc::clone(entry.value()));
        match root {
            Some(root) => root.lock().route_confirmed(value),
            None => Some(value),
        }
    }

    /// Log problems in the transform map of `options`, once per sync path.
    pub(super) fn check_transforms(&self, options: &SyncOptions) {
        if !self.config.validate_transforms {
            return;
        }
        let Some(transforms) = &options.field_transforms else {
            return;
        };
        if !self.validated.insert(options.sync_path.template().to_string()) {
            return;
        }
        for problem in transforms.validate() {
            warn!(sync_path = %options.sync_path, error = %problem, "Invalid field transform");
        }
    }
}
