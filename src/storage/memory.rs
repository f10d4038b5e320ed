// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`RemoteStore`] backed by a single JSON document.
//!
//! Behaves like a hosted realtime tree database as far as the engine can
//! observe:
//!
//! - server timestamp sentinels (`{".sv": "timestamp"}`) resolve to the
//!   store's clock, which advances by one millisecond per update
//! - existing children are replayed as added events on subscribe
//! - child events are computed by diffing each subscribed node around an
//!   update, honouring range filters
//! - callbacks run synchronously after the document lock is released
//!
//! Test helpers let a second "client" write directly, sign principals in
//! and out, and revoke subscriptions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::traits::{
    AuthCallback, CancelCallback, ChildCallback, ChildEvent, ChildEventKind, Query, RangeFilter,
    RemoteStore, StoreError, Subscription,
};
use crate::value::{get_at_path, set_at_path, split_path};

/// Key of the server-timestamp sentinel object.
pub const SERVER_VALUE_KEY: &str = ".sv";

#[derive(Clone)]
struct Subscriber {
    path: Vec<String>,
    raw_path: String,
    range: Option<RangeFilter>,
    kind: ChildEventKind,
    callback: ChildCallback,
    on_cancel: CancelCallback,
}

pub struct MemoryStore {
    data: RwLock<Value>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    clock: AtomicI64,
    principal: RwLock<Option<String>>,
    auth_listeners: Mutex<Vec<AuthCallback>>,
    history: Mutex<Vec<BTreeMap<String, Value>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Value::Null),
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(0),
            clock: AtomicI64::new(0),
            principal: RwLock::new(None),
            auth_listeners: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Current clock in epoch milliseconds.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Move the clock; the next update is stamped `ms + 1`.
    pub fn set_now(&self, ms: i64) {
        self.clock.store(ms, Ordering::SeqCst);
    }

    /// Value at an absolute path, `null` when missing.
    #[must_use]
    pub fn value_at(&self, path: &str) -> Value {
        let data = self.data.read();
        get_at_path(&data, &split_path(path))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Every batch applied so far, in order, as submitted (sentinels unresolved).
    #[must_use]
    pub fn batches(&self) -> Vec<BTreeMap<String, Value>> {
        self.history.lock().clone()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Write as another client would, firing child events.
    pub fn write_external(&self, path: &str, value: Value) {
        let mut batch = BTreeMap::new();
        batch.insert(path.to_string(), value);
        self.apply(batch);
    }

    pub fn sign_in(&self, uid: &str) {
        *self.principal.write() = Some(uid.to_string());
        self.notify_auth(Some(uid));
    }

    pub fn sign_out(&self) {
        *self.principal.write() = None;
        self.notify_auth(None);
    }

    /// Cancel every subscription at or below `prefix` with `error`.
    pub fn revoke(&self, prefix: &str, error: StoreError) {
        let prefix = split_path(prefix);
        let revoked: Vec<(u64, CancelCallback)> = self
            .subscribers
            .iter()
            .filter(|entry| entry.path.starts_with(&prefix))
            .map(|entry| (*entry.key(), entry.on_cancel.clone()))
            .collect();
        for (id, on_cancel) in revoked {
            self.subscribers.remove(&id);
            on_cancel(error.clone());
        }
    }

    fn notify_auth(&self, principal: Option<&str>) {
        let listeners = self.auth_listeners.lock().clone();
        for listener in listeners {
            listener(principal);
        }
    }

    fn subscribe(&self, query: &Query, kind: ChildEventKind, callback: ChildCallback, on_cancel: CancelCallback) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            path: split_path(&query.path),
            raw_path: query.path.clone(),
            range: query.range.clone(),
            kind,
            callback,
            on_cancel,
        };

        let replay: Vec<ChildEvent> = match kind {
            ChildEventKind::Added => {
                let data = self.data.read();
                children_in_range(&data, &subscriber.path, subscriber.range.as_ref())
                    .into_iter()
                    .map(|(key, value)| ChildEvent {
                        kind,
                        key,
                        value,
                    })
                    .collect()
            }
            ChildEventKind::Changed => Vec::new(),
        };
        let callback = subscriber.callback.clone();
        debug!(path = %subscriber.raw_path, ?kind, replayed = replay.len(), "Subscriber registered");
        self.subscribers.insert(id, subscriber);

        for event in replay {
            callback(event);
        }

        let subscribers = Arc::clone(&self.subscribers);
        Subscription::new(move || {
            subscribers.remove(&id);
        })
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply(&self, batch: BTreeMap<String, Value>) {
        let now = self.tick();
        let subscribers: Vec<Subscriber> = self.subscribers.iter().map(|e| e.value().clone()).collect();

        let events = {
            let mut data = self.data.write();
            let before: Vec<Map<String, Value>> = subscribers
                .iter()
                .map(|s| children_in_range(&data, &s.path, s.range.as_ref()))
                .collect();

            for (path, value) in &batch {
                set_at_path(&mut data, &split_path(path), resolve_server_values(value.clone(), now));
            }

            let mut events = Vec::new();
            for (subscriber, before) in subscribers.iter().zip(before) {
                let after = children_in_range(&data, &subscriber.path, subscriber.range.as_ref());
                for (key, value) in after {
                    let kind = match before.get(&key) {
                        None => ChildEventKind::Added,
                        Some(old) if *old != value => ChildEventKind::Changed,
                        Some(_) => continue,
                    };
                    if kind == subscriber.kind {
                        events.push((subscriber.callback.clone(), ChildEvent { kind, key, value }));
                    }
                }
            }
            events
        };

        debug!(entries = batch.len(), events = events.len(), timestamp = now, "Update applied");
        self.history.lock().push(batch);

        for (callback, event) in events {
            callback(event);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn once(&self, query: &Query) -> Result<Value, StoreError> {
        let data = self.data.read();
        let path = split_path(&query.path);
        match &query.range {
            Some(range) => {
                let children = children_in_range(&data, &path, Some(range));
                Ok(if children.is_empty() {
                    Value::Null
                } else {
                    Value::Object(children)
                })
            }
            None => Ok(get_at_path(&data, &path).cloned().unwrap_or(Value::Null)),
        }
    }

    fn on_child_added(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback) -> Subscription {
        self.subscribe(query, ChildEventKind::Added, callback, on_cancel)
    }

    fn on_child_changed(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback) -> Subscription {
        self.subscribe(query, ChildEventKind::Changed, callback, on_cancel)
    }

    fn server_timestamp(&self) -> Value {
        let mut sentinel = Map::new();
        sentinel.insert(SERVER_VALUE_KEY.to_string(), json!("timestamp"));
        Value::Object(sentinel)
    }

    async fn atomic_update(&self, batch: BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(bad) = batch.keys().find(|path| !path.starts_with('/')) {
            return Err(StoreError::Backend(format!("update path '{bad}' is not absolute")));
        }
        self.apply(batch);
        Ok(())
    }

    fn on_auth_state_changed(&self, callback: AuthCallback) {
        self.auth_listeners.lock().push(callback.clone());
        let principal = self.principal.read().clone();
        callback(principal.as_deref());
    }

    fn current_principal(&self) -> Option<String> {
        self.principal.read().clone()
    }
}

fn is_timestamp_sentinel(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp")
}

fn resolve_server_values(value: Value, now: i64) -> Value {
    match value {
        Value::Object(map) if is_timestamp_sentinel(&map) => json!(now),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_server_values(v, now)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.into_iter().map(|v| resolve_server_values(v, now)).collect(),
        ),
        other => other,
    }
}

fn in_range(range: Option<&RangeFilter>, child: &Value) -> bool {
    let Some(range) = range else {
        return true;
    };
    child
        .get(&range.field)
        .and_then(Value::as_i64)
        .is_some_and(|v| v >= range.start_at)
}

fn children_in_range(data: &Value, path: &[String], range: Option<&RangeFilter>) -> Map<String, Value> {
    match get_at_path(data, path) {
        Some(Value::Object(children)) => children
            .iter()
            .filter(|(_, child)| in_range(range, child))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Some(Value::Array(items)) if range.is_none() => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        _ => Map::new(),
    }
}
