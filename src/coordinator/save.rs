// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Save path: transform, accumulate, debounce, resolve.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::batching::save_batcher::{ConfirmedValue, FlushReason, RootState, SyncRoot};
use crate::config::SyncOptions;
use crate::metrics;
use crate::value::{construct_object, get_at_path, merge_deep, split_path, strip_nulls};

use super::{SavedValue, SyncEngine, SyncError};

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Save
    // ═══════════════════════════════════════════════════════════════════════════

    /// Save `value` at `path` (local names, relative to the sync path).
    ///
    /// The write is merged into the root's pending tree and flushed with
    /// everything else saved during the debounce window. The returned future
    /// resolves when that flush completes. If the store echoed a newer value
    /// for this path while the write was pending, it is merged over `value`
    /// in the result.
    ///
    /// `null` members are dropped from objects; a top-level `null` deletes.
    ///
    /// # Errors
    ///
    /// - [`SyncError::RemoteWrite`] if the flush carrying this write failed;
    ///   the write stays pending and is retried by the next flush
    /// - [`SyncError::NotSignedIn`] if the sync path needs a principal and
    ///   there is none
    /// - [`SyncError::AuthTimeout`] if `require_auth` is set and no principal
    ///   appeared within the configured timeout
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use tree_sync::{SyncEngine, SyncOptions};
    /// # use serde_json::json;
    /// # async fn example(engine: &SyncEngine) {
    /// let options = SyncOptions::at("/users/{uid}/");
    /// let saved = engine.save(&options, "/profile/name", json!("Ann")).await.unwrap();
    /// println!("saved {} at {:?}", saved.value, saved.date_modified);
    /// # }
    /// ```
    pub async fn save(&self, options: &SyncOptions, path: &str, value: Value) -> Result<SavedValue, SyncError> {
        if options.readonly {
            debug!(sync_path = %options.sync_path, path, "Readonly sync path, save skipped");
            return Ok(SavedValue {
                value,
                date_modified: None,
            });
        }
        if options.require_auth {
            self.wait_for_auth().await?;
        }
        self.check_transforms(options);

        let local_path = split_path(path);
        let local_value = strip_nulls(value);
        let (remote_path, remote_value) = to_remote(options, &local_path, &local_value);
        let base = self.resolve_base(options)?;

        let receiver = loop {
            let root = self.root_for(&base, options);
            let mut state = root.lock();
            if state.is_retired() {
                continue;
            }
            let receiver = state.push_write(&remote_path, remote_value.clone());
            self.schedule_flush(&root, &mut state);
            break receiver;
        };
        metrics::record_save();
        debug!(base_path = %base, path, "Save queued");

        let confirmed = receiver.await.map_err(|_| SyncError::Abandoned)??;
        Ok(merge_confirmed(&local_path, local_value, &confirmed))
    }

    /// Start (or restart) the root's debounce window.
    fn schedule_flush(&self, root: &Arc<SyncRoot>, state: &mut RootState) {
        let window = root
            .options()
            .save_debounce_ms
            .unwrap_or(self.config.save_debounce_ms);
        let generation = state.next_generation();
        let engine = self.clone();
        let root_ref = Arc::clone(root);

        if window == 0 {
            tokio::spawn(async move {
                let _ = engine.flush_root(&root_ref, FlushReason::Immediate).await;
            });
            return;
        }

        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(window)).await;
            let claimed = root_ref.lock().claim_timer(generation);
            if claimed {
                let _ = engine.flush_root(&root_ref, FlushReason::Debounce).await;
            }
        });
        state.arm(timer);
    }
}

/// Remote path and value for a local write.
fn to_remote(options: &SyncOptions, path: &[String], value: &Value) -> (Vec<String>, Value) {
    let Some(transforms) = &options.field_transforms else {
        return (path.to_vec(), value.clone());
    };
    let remote_value = match transforms.at_path(path) {
        Some(shape) => shape.transform_object(value),
        None => value.clone(),
    };
    (transforms.transform_path(path), remote_value)
}

/// Project each confirmed value onto `path` and deep-merge it over `value`,
/// in arrival order.
fn merge_confirmed(path: &[String], mut value: Value, confirmed: &[ConfirmedValue]) -> SavedValue {
    let mut date_modified = None;
    for entry in confirmed {
        let projected = if let Some(below) = entry.local_path.strip_prefix(path) {
            entry.value.clone().map(|v| construct_object(below, v))
        } else if let Some(above) = path.strip_prefix(entry.local_path.as_slice()) {
            entry
                .value
                .as_ref()
                .and_then(|v| get_at_path(v, above))
                .cloned()
        } else {
            continue;
        };
        if let Some(projected) = projected {
            merge_deep(&mut value, &projected);
        }
        date_modified = date_modified.max(entry.timestamp);
    }
    SavedValue {
        value,
        date_modified,
    }
}
