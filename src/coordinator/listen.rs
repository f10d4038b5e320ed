// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change listener: initial load plus streamed child changes.
//!
//! A `listen` call opens one listener per target node. Usually that is the
//! sync root itself; a nested timestamp spec whose children are not all
//! stamped is split per child key so that stamped subtrees can still be
//! range-queried from their newest local timestamp.
//!
//! Each listener subscribes to child-added and child-changed before fetching
//! its initial snapshot. Events that arrive before that snapshot is applied
//! are dropped. After the first load, every event is decoded, renamed to
//! local names and either applied to the local tree or, if it overlaps an
//! own pending write, parked as a confirmed value for that save.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batching::save_batcher::ConfirmedValue;
use crate::config::SyncOptions;
use crate::local_tree::LocalTree;
use crate::metrics;
use crate::modified::{decode, is_wrapped, Decoded, ModifiedSpec, TIMESTAMP_KEY, VALUE_KEY, WILDCARD_KEY};
use crate::storage::traits::{ChildEvent, StoreError, Subscription};
use crate::transform::FieldTransformMap;
use crate::value::{expand_key, join_path};

use super::{ChangeCallback, ChangeEvent, ListenState, SyncEngine, SyncError};

/// A node to listen on, relative to the sync root (local names).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenTarget {
    local_path: Vec<String>,
    /// Range-filter children from the newest local timestamp
    ranged: bool,
}

/// State shared between one listener task and its handle.
struct ListenerSlot {
    local_path: Vec<String>,
    state: watch::Sender<ListenState>,
    error: Mutex<Option<SyncError>>,
    /// `None` once the handle is dropped
    subscriptions: Mutex<Option<Vec<Subscription>>>,
    /// Set once the initial snapshot is applied
    loaded: Mutex<Option<Arc<ListenerContext>>>,
}

impl ListenerSlot {
    fn new(local_path: Vec<String>, initial: ListenState) -> Self {
        let (state, _rx) = watch::channel(initial);
        Self {
            local_path,
            state,
            error: Mutex::new(None),
            subscriptions: Mutex::new(Some(Vec::new())),
            loaded: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ListenState) {
        self.state.send_replace(state);
    }

    /// Keep `subs` alive for the life of the handle; drop them at once if
    /// the handle is already gone.
    fn hold(&self, subs: Vec<Subscription>) {
        if let Some(held) = self.subscriptions.lock().as_mut() {
            held.extend(subs);
        }
    }

    /// Open the listener's event gate after its snapshot is applied.
    ///
    /// Returns false if the handle was dropped first.
    fn mark_loaded(&self, ctx: &Arc<ListenerContext>) -> bool {
        let held = self.subscriptions.lock();
        if held.is_none() {
            return false;
        }
        ctx.loaded.store(true, Ordering::Release);
        ctx.engine.retain_loaded(&ctx.full_path);
        *self.loaded.lock() = Some(Arc::clone(ctx));
        true
    }

    fn close(&self) {
        let subs = self.subscriptions.lock().take();
        drop(subs);
        if let Some(ctx) = self.loaded.lock().take() {
            ctx.loaded.store(false, Ordering::Release);
            ctx.engine.release_loaded(&ctx.full_path);
        }
        self.set_state(ListenState::Unsubscribed);
    }
}

struct Listener {
    slot: Arc<ListenerSlot>,
    task: JoinHandle<()>,
}

/// Owns the listeners opened by one `listen` call.
///
/// Dropping the handle unsubscribes every listener.
#[must_use = "dropping a ListenHandle unsubscribes its listeners"]
pub struct ListenHandle {
    listeners: Vec<Listener>,
}

impl ListenHandle {
    /// Local paths (relative to the sync root) being listened on.
    pub fn paths(&self) -> Vec<&[String]> {
        self.listeners.iter().map(|l| l.slot.local_path.as_slice()).collect()
    }

    pub fn states(&self) -> Vec<ListenState> {
        self.listeners.iter().map(|l| *l.slot.state.borrow()).collect()
    }

    /// State of the least advanced listener.
    pub fn state(&self) -> ListenState {
        self.states()
            .into_iter()
            .min()
            .unwrap_or(ListenState::Unsubscribed)
    }

    pub fn is_loaded(&self) -> bool {
        self.states().iter().all(ListenState::is_loaded)
    }

    /// Watch the state of the listener at `index`.
    pub fn subscribe_state(&self, index: usize) -> Option<watch::Receiver<ListenState>> {
        self.listeners.get(index).map(|l| l.slot.state.subscribe())
    }

    /// Wait until every listener has applied its initial snapshot.
    ///
    /// # Errors
    ///
    /// The error that stopped a listener before its first load, such as
    /// [`SyncError::Query`] or [`SyncError::AuthTimeout`].
    pub async fn wait_loaded(&self) -> Result<(), SyncError> {
        for listener in &self.listeners {
            let mut rx = listener.slot.state.subscribe();
            let state = *rx
                .wait_for(|s| s.is_loaded() || *s == ListenState::Unsubscribed)
                .await
                .map_err(|_| SyncError::Abandoned)?;
            if !state.is_loaded() {
                return Err(listener.slot.error.lock().clone().unwrap_or(SyncError::Abandoned));
            }
        }
        Ok(())
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.task.abort();
            listener.slot.close();
        }
    }
}

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Listen
    // ═══════════════════════════════════════════════════════════════════════════

    /// Mirror the remote subtree of `options` into `tree`.
    ///
    /// Returns immediately; loading happens on spawned tasks. Use
    /// [`ListenHandle::wait_loaded`] to wait for the initial snapshot.
    /// `on_change` is called for every value applied to `tree`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotSignedIn`] if the sync path needs a principal, there
    /// is none, and `require_auth` is not set.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use tree_sync::{MemoryTree, SyncEngine, SyncOptions};
    /// # async fn example(engine: &SyncEngine) {
    /// let tree = Arc::new(MemoryTree::new());
    /// let handle = engine.listen(tree.clone(), SyncOptions::at("/shared/"), None).unwrap();
    /// handle.wait_loaded().await.unwrap();
    /// println!("{}", tree.snapshot());
    /// # }
    /// ```
    pub fn listen(
        &self,
        tree: Arc<dyn LocalTree>,
        options: SyncOptions,
        on_change: Option<ChangeCallback>,
    ) -> Result<ListenHandle, SyncError> {
        if !options.require_auth {
            self.resolve_base(&options)?;
        }
        self.check_transforms(&options);

        let mut targets = Vec::new();
        plan_targets(&options.query_by_modified, tree.as_ref(), Vec::new(), &mut targets);
        debug!(sync_path = %options.sync_path, listeners = targets.len(), "Opening listeners");

        let initial = if options.require_auth {
            ListenState::AwaitingAuth
        } else {
            ListenState::QueryingInitialSnapshot
        };
        let options = Arc::new(options);
        let listeners = targets
            .into_iter()
            .map(|target| {
                let slot = Arc::new(ListenerSlot::new(target.local_path.clone(), initial));
                let task = tokio::spawn(self.clone().run_listener(
                    Arc::clone(&tree),
                    Arc::clone(&options),
                    on_change.clone(),
                    target,
                    Arc::clone(&slot),
                ));
                Listener { slot, task }
            })
            .collect();

        Ok(ListenHandle { listeners })
    }

    async fn run_listener(
        self,
        tree: Arc<dyn LocalTree>,
        options: Arc<SyncOptions>,
        on_change: Option<ChangeCallback>,
        target: ListenTarget,
        slot: Arc<ListenerSlot>,
    ) {
        if let Err(e) = self.load_and_subscribe(tree, options, on_change, target, &slot).await {
            error!(path = ?slot.local_path, error = %e, "Listener failed before first load");
            metrics::record_listener_error("load");
            *slot.error.lock() = Some(e);
            slot.close();
        }
    }

    async fn load_and_subscribe(
        &self,
        tree: Arc<dyn LocalTree>,
        options: Arc<SyncOptions>,
        on_change: Option<ChangeCallback>,
        target: ListenTarget,
        slot: &ListenerSlot,
    ) -> Result<(), SyncError> {
        if options.require_auth {
            slot.set_state(ListenState::AwaitingAuth);
            self.wait_for_auth().await?;
        }
        let base = self.resolve_base(&options)?;
        slot.set_state(ListenState::QueryingInitialSnapshot);

        let floor = if target.ranged {
            tree.max_modified(&target.local_path)
        } else {
            None
        };
        let ctx = Arc::new(ListenerContext::new(self.clone(), tree, &options, on_change, base, target.local_path));

        let mut query = self.store.resolve_ref(&ctx.full_path);
        if let Some(floor) = floor {
            query = self.store.range_query(query, TIMESTAMP_KEY, floor + 1);
        }

        if !options.once {
            let on_event = {
                let ctx = Arc::clone(&ctx);
                Arc::new(move |event: ChildEvent| ctx.on_child_event(event))
            };
            let on_cancel = {
                let path = ctx.full_path.clone();
                Arc::new(move |e: StoreError| {
                    error!(path = %path, error = %e, "Listener cancelled by remote store");
                    metrics::record_listener_error("cancelled");
                })
            };
            let added = self.store.on_child_added(&query, on_event.clone(), on_cancel.clone());
            let changed = self.store.on_child_changed(&query, on_event, on_cancel);
            slot.hold(vec![added, changed]);
        }

        let snapshot = self
            .store
            .once(&query)
            .await
            .map_err(|source| SyncError::Query {
                path: ctx.full_path.clone(),
                source,
            })?;
        ctx.apply_snapshot(snapshot);
        if !slot.mark_loaded(&ctx) {
            debug!(path = %ctx.full_path, "Listener closed during initial load");
            return Ok(());
        }

        slot.set_state(if options.once {
            ListenState::Loaded
        } else {
            ListenState::Subscribed
        });
        info!(path = %ctx.full_path, floor = ?floor, once = options.once, "Initial load complete");
        Ok(())
    }
}

/// Whether `spec` or anything below it can use a range-query floor.
fn wants_floor(spec: &ModifiedSpec) -> bool {
    spec.children_tracked()
        || matches!(spec, ModifiedSpec::Nested(children) if children.values().any(wants_floor))
}

/// Decide which nodes to listen on.
///
/// A nested spec that cannot range-filter its own children, but has a child
/// that can, is split into one target per child key (local keys plus
/// explicit spec keys).
fn plan_targets(spec: &ModifiedSpec, tree: &dyn LocalTree, path: Vec<String>, out: &mut Vec<ListenTarget>) {
    if let ModifiedSpec::Nested(children) = spec {
        if !spec.children_tracked() && children.values().any(wants_floor) {
            let mut keys: BTreeSet<String> = tree.keys(&path).into_iter().collect();
            keys.extend(children.keys().filter(|k| *k != WILDCARD_KEY).cloned());
            if !keys.is_empty() {
                for key in keys {
                    let mut child = path.clone();
                    child.push(key.clone());
                    plan_targets(spec.child(&key), tree, child, out);
                }
                return;
            }
        }
    }
    out.push(ListenTarget {
        ranged: spec.children_tracked(),
        local_path: path,
    });
}

/// Everything a child callback needs to decode and apply one event.
struct ListenerContext {
    engine: SyncEngine,
    tree: Arc<dyn LocalTree>,
    on_change: Option<ChangeCallback>,
    ignore_keys: Vec<String>,
    base: String,
    full_path: String,
    local_path: Vec<String>,
    remote_path: Vec<String>,
    /// Timestamp spec at this node, remote names
    spec: ModifiedSpec,
    /// Remote to local shape at this node
    inverse: Option<FieldTransformMap>,
    /// Events are dropped until this listener's snapshot is applied
    loaded: AtomicBool,
}

impl ListenerContext {
    fn new(
        engine: SyncEngine,
        tree: Arc<dyn LocalTree>,
        options: &SyncOptions,
        on_change: Option<ChangeCallback>,
        base: String,
        local_path: Vec<String>,
    ) -> Self {
        let remote_path = match &options.field_transforms {
            Some(transforms) => transforms.transform_path(&local_path),
            None => local_path.clone(),
        };
        let inverse = options
            .field_transforms
            .as_ref()
            .and_then(|transforms| transforms.at_path(&local_path))
            .map(FieldTransformMap::invert);
        let spec = options.remote_modified_spec().at_path(&remote_path).clone();
        Self {
            engine,
            tree,
            on_change,
            ignore_keys: options.ignore_keys.clone(),
            full_path: join_path(&base, &remote_path),
            base,
            local_path,
            remote_path,
            spec,
            inverse,
            loaded: AtomicBool::new(false),
        }
    }

    fn on_child_event(&self, event: ChildEvent) {
        if !self.loaded.load(Ordering::Acquire) {
            debug!(path = %self.full_path, key = %event.key, "Dropping child event before initial load");
            metrics::record_dropped_event("not_loaded");
            return;
        }
        self.apply_child(&event.key, event.value, false);
    }

    fn apply_snapshot(&self, snapshot: Value) {
        if self.spec.tracked_here() && is_wrapped(&snapshot) {
            // The node holds one wrapped value rather than children.
            let decoded = self.spec.decode_tree(snapshot);
            if let Some(ts) = decoded.timestamp {
                self.tree.set_modified(&self.local_path, ts);
            }
            if decoded.value.is_some() {
                self.apply_value(&[], &[], decoded.value, None, true);
            }
            return;
        }
        let decoded = if self.spec.tracked_here() {
            decode(snapshot)
        } else {
            Decoded {
                value: Some(snapshot).filter(|v| !v.is_null()),
                timestamp: None,
            }
        };
        if let Some(ts) = decoded.timestamp {
            self.tree.set_modified(&self.local_path, ts);
        }
        match decoded.value {
            Some(Value::Object(children)) => {
                for (key, child) in children {
                    self.apply_child(&key, child, true);
                }
            }
            Some(value) => self.apply_value(&[], &[], Some(value), None, true),
            None => {}
        }
    }

    /// Decode one child record (remote key) and apply or route it.
    fn apply_child(&self, key: &str, record: Value, initial: bool) {
        if key == TIMESTAMP_KEY {
            if let Some(ts) = record.as_i64() {
                self.tree.set_modified(&self.local_path, ts);
            }
            return;
        }
        if key == VALUE_KEY && self.spec.tracked_here() {
            // Wrapped value stored at this node itself.
            let value = Some(record)
                .filter(|v| !v.is_null())
                .map(|v| self.spec.decode_children(v));
            self.apply_value(&[], &[], value, None, initial);
            return;
        }

        let remote_rel = expand_key(key);
        let decoded = self.spec.at_path(&remote_rel).decode_tree(record);
        let (local_rel, value) = match &self.inverse {
            Some(inverse) => {
                let value = decoded.value.map(|v| match inverse.at_path(&remote_rel) {
                    Some(shape) => shape.transform_object(&v),
                    None => v,
                });
                (inverse.transform_path(&remote_rel), value)
            }
            None => (remote_rel.clone(), decoded.value),
        };

        if local_rel.first().is_some_and(|k| self.ignore_keys.contains(k)) {
            metrics::record_dropped_event("ignored_key");
            return;
        }
        self.apply_value(&remote_rel, &local_rel, value, decoded.timestamp, initial);
    }

    fn apply_value(
        &self,
        remote_rel: &[String],
        local_rel: &[String],
        value: Option<Value>,
        timestamp: Option<i64>,
        initial: bool,
    ) {
        let local_path: Vec<String> = self.local_path.iter().chain(local_rel).cloned().collect();

        if !initial {
            let confirmed = ConfirmedValue {
                remote_path: self.remote_path.iter().chain(remote_rel).cloned().collect(),
                local_path: local_path.clone(),
                value: value.clone(),
                timestamp,
            };
            if self.engine.route_confirmed(&self.base, confirmed).is_none() {
                debug!(path = %self.full_path, key = ?local_rel, "Remote change overlaps a pending save, parked as confirmed");
                metrics::record_confirmed_echo();
                return;
            }
        }

        self.tree.set(&local_path, value.clone().unwrap_or(Value::Null));
        if let Some(ts) = timestamp {
            self.tree.set_modified(&local_path, ts);
        }
        metrics::record_applied_event(if initial { "snapshot" } else { "change" });

        if let Some(on_change) = &self.on_change {
            on_change(&ChangeEvent {
                path: local_path,
                value,
                timestamp,
                initial,
            });
        }
    }
}
