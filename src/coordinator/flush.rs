// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch flushing.
//!
//! Internal operations for turning a root's pending tree into one atomic
//! multi-path update and resolving the saves waiting on it.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::batching::save_batcher::{FlushReason, SaveBatch, SyncRoot};
use crate::metrics::{self, LatencyTimer};

use super::{SyncEngine, SyncError};

impl SyncEngine {
    /// Flush every sync root now, bypassing debounce windows.
    ///
    /// Meant for shutdown and tests. Returns the number of batches written.
    ///
    /// # Errors
    ///
    /// The first [`SyncError::RemoteWrite`] encountered; every root is still
    /// attempted.
    pub async fn flush_now(&self) -> Result<usize, SyncError> {
        let roots: Vec<Arc<SyncRoot>> = self.roots.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut written = 0;
        let mut first_error = None;

        for root in roots {
            root.lock().disarm();
            match self.flush_root(&root, FlushReason::Manual).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Flush one root. Returns whether a batch was taken.
    #[instrument(skip(self, root, reason), fields(base_path = %root.base_path(), reason = %reason))]
    pub(super) async fn flush_root(&self, root: &Arc<SyncRoot>, reason: FlushReason) -> Result<bool, SyncError> {
        let batch = root.lock().take_batch(reason);
        let Some(batch) = batch else {
            self.retire(root);
            return Ok(false);
        };
        let SaveBatch {
            id,
            seq,
            tree,
            waiters,
            ..
        } = batch;

        let entries = root.build_entries(&tree, &self.store.server_timestamp());
        let entry_count = entries.len();
        debug!(batch_id = %id, entries = entry_count, waiters = waiters.len(), "Flushing batch");

        let result = if entries.is_empty() {
            Ok(())
        } else {
            let _timer = LatencyTimer::new("atomic_update");
            self.store.atomic_update(entries).await
        };

        let outcome = match result {
            Ok(()) => {
                let confirmed = Arc::new(root.lock().complete_ok(seq));
                info!(
                    batch_id = %id,
                    entries = entry_count,
                    confirmed = confirmed.len(),
                    waiters = waiters.len(),
                    "Batch flush complete"
                );
                metrics::record_flush(reason.as_str(), "success", entry_count);
                for waiter in waiters {
                    let _ = waiter.send(Ok(Arc::clone(&confirmed)));
                }
                Ok(true)
            }
            Err(e) => {
                root.lock().complete_err(seq);
                error!(
                    batch_id = %id,
                    entries = entry_count,
                    error = %e,
                    "Batch flush failed, writes kept pending for the next flush"
                );
                metrics::record_flush(reason.as_str(), "error", entry_count);
                let err = SyncError::RemoteWrite(e);
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                Err(err)
            }
        };

        self.retire(root);
        outcome
    }
}
