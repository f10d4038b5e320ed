// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-root save state: what is pending, what is in flight, who is waiting.
//!
//! Every resolved sync path gets one [`SyncRoot`]. Saves land in its pending
//! tree; a flush moves that tree into the in-flight list, writes it as one
//! atomic multi-path update, and resolves every waiter of that cycle.
//!
//! ```text
//!  save ──► pending ──flush──► in_flight ──atomic_update──► resolved
//!                                   ▲
//!          echo of an own write ────┘ (parked as confirmed, handed to
//!                                      the waiters of the batch it overlaps)
//! ```
//!
//! The debounce timer is a tokio task per root. Arming a new timer bumps the
//! generation and aborts the previous task; a task that wakes up holding a
//! stale generation does nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::pending_tree::PendingNode;
use crate::config::SyncOptions;
use crate::coordinator::SyncError;
use crate::modified::{ModifiedSpec, TIMESTAMP_KEY};
use crate::value::join_path;

/// Why a root was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Debounce window elapsed
    Debounce,
    /// Zero-length debounce window
    Immediate,
    /// `flush_now` requested
    Manual,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debounce => "debounce",
            Self::Immediate => "immediate",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote change that overlapped an own pending or in-flight write.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedValue {
    /// Path relative to the sync root, remote names
    pub remote_path: Vec<String>,
    /// Same node, local names
    pub local_path: Vec<String>,
    /// Decoded value in local names; `None` when the node was removed
    pub value: Option<Value>,
    pub timestamp: Option<i64>,
}

/// What a waiting save receives when its flush cycle ends.
pub type FlushOutcome = Result<Arc<Vec<ConfirmedValue>>, SyncError>;

/// One flush cycle's worth of work, taken out of a root.
pub struct SaveBatch {
    pub id: Uuid,
    pub seq: u64,
    pub reason: FlushReason,
    pub tree: PendingNode,
    pub waiters: Vec<oneshot::Sender<FlushOutcome>>,
}

impl SaveBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl fmt::Debug for SaveBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveBatch")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("reason", &self.reason)
            .field("leaves", &self.tree.leaf_count())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

struct InFlight {
    seq: u64,
    tree: PendingNode,
}

/// Mutable state of a [`SyncRoot`]; only reachable through [`SyncRoot::lock`].
#[derive(Default)]
pub struct RootState {
    pending: PendingNode,
    in_flight: Vec<InFlight>,
    confirmed: Vec<ConfirmedValue>,
    waiters: Vec<oneshot::Sender<FlushOutcome>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    next_seq: u64,
    retired: bool,
}

impl RootState {
    /// Record a write at `path` (remote names, relative to the root) and
    /// register a waiter for the flush cycle that will carry it.
    pub fn push_write(&mut self, path: &[String], value: Value) -> oneshot::Receiver<FlushOutcome> {
        self.pending.update(path, value);
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    #[must_use]
    pub fn pending(&self) -> &PendingNode {
        &self.pending
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Start a new debounce generation, cancelling any armed timer.
    pub fn next_generation(&mut self) -> u64 {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.generation
    }

    pub fn arm(&mut self, timer: JoinHandle<()>) {
        self.timer = Some(timer);
    }

    /// Called by a woken timer: true if it still owns the current generation.
    pub fn claim_timer(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.timer = None;
        true
    }

    /// Cancel the armed timer, if any (a manual flush supersedes it).
    pub fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }

    /// Move the pending tree in flight and take this cycle's waiters.
    ///
    /// `None` when there is neither anything to write nor anyone waiting.
    pub fn take_batch(&mut self, reason: FlushReason) -> Option<SaveBatch> {
        if self.pending.is_empty() && self.waiters.is_empty() {
            return None;
        }
        let tree = std::mem::take(&mut self.pending);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.push(InFlight {
            seq,
            tree: tree.clone(),
        });
        Some(SaveBatch {
            id: Uuid::new_v4(),
            seq,
            reason,
            tree,
            waiters: std::mem::take(&mut self.waiters),
        })
    }

    /// The write for `seq` succeeded: drop it from flight and hand back the
    /// confirmed values that overlap it.
    pub fn complete_ok(&mut self, seq: u64) -> Vec<ConfirmedValue> {
        let Some(done) = self.remove_in_flight(seq) else {
            return Vec::new();
        };
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.confirmed)
            .into_iter()
            .partition(|c| done.tree.overlaps(&c.remote_path));
        self.confirmed = rest;
        mine
    }

    /// The write for `seq` failed: put its tree back under whatever was
    /// saved since, so the next flush retries it.
    pub fn complete_err(&mut self, seq: u64) {
        if let Some(failed) = self.remove_in_flight(seq) {
            self.pending.restore_under(failed.tree);
        }
    }

    fn remove_in_flight(&mut self, seq: u64) -> Option<InFlight> {
        let index = self.in_flight.iter().position(|f| f.seq == seq)?;
        Some(self.in_flight.remove(index))
    }

    /// True if a remote change at `remote_path` touches a pending or
    /// in-flight write of this root.
    #[must_use]
    pub fn overlaps(&self, remote_path: &[String]) -> bool {
        self.pending.overlaps(remote_path)
            || self.in_flight.iter().any(|f| f.tree.overlaps(remote_path))
    }

    /// Park `value` for the flush cycle it overlaps. Returns it back when
    /// nothing here overlaps, so the caller applies it locally instead.
    pub fn route_confirmed(&mut self, value: ConfirmedValue) -> Option<ConfirmedValue> {
        if self.overlaps(&value.remote_path) {
            self.confirmed.push(value);
            None
        } else {
            Some(value)
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && self.in_flight.is_empty()
            && self.waiters.is_empty()
            && self.timer.is_none()
    }

    /// Mark the root retired if idle; a retired root accepts no more writes.
    pub fn retire_if_idle(&mut self) -> bool {
        if self.is_idle() {
            self.confirmed.clear();
            self.retired = true;
        }
        self.retired
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

/// Save state for one resolved sync path.
pub struct SyncRoot {
    base_path: String,
    options: SyncOptions,
    remote_spec: ModifiedSpec,
    state: Mutex<RootState>,
}

impl SyncRoot {
    pub fn new(base_path: impl Into<String>, options: SyncOptions) -> Self {
        let remote_spec = options.remote_modified_spec();
        Self {
            base_path: base_path.into(),
            options,
            remote_spec,
            state: Mutex::new(RootState::default()),
        }
    }

    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    #[must_use]
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn lock(&self) -> MutexGuard<'_, RootState> {
        self.state.lock()
    }

    /// Flatten `tree` into absolute `path -> value` update entries.
    ///
    /// Values are stamped per the root's timestamp spec; writes beneath a
    /// stamped node add a `<node>/@` entry carrying `timestamp`.
    pub fn build_entries(&self, tree: &PendingNode, timestamp: &Value) -> BTreeMap<String, Value> {
        let mut entries = BTreeMap::new();
        for (path, value) in tree.leaves() {
            let stamped = self.remote_spec.stamp(&path, value.clone(), timestamp);
            for mut marker in stamped.markers {
                marker.push(TIMESTAMP_KEY.to_string());
                entries.insert(join_path(&self.base_path, &marker), timestamp.clone());
            }
            entries.insert(join_path(&self.base_path, &path), stamped.value);
        }
        entries
    }
}

impl fmt::Debug for SyncRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRoot")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}
