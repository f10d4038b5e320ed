// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The local tree the listener writes remote changes into.
//!
//! The engine only needs a handful of primitives from the application's
//! observable state: read a node, replace or shallow-merge a node, list
//! child keys, and keep a per-node "last modified" marker used as the
//! range-query floor on the next load.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::value::{get_at_path, set_at_path};

pub trait LocalTree: Send + Sync {
    /// Value at `path`, if any.
    fn get(&self, path: &[String]) -> Option<Value>;

    /// Replace the node at `path`; `null` removes it.
    fn set(&self, path: &[String], value: Value);

    /// Shallow-merge the members of `partial` into the object at `path`.
    fn assign(&self, path: &[String], partial: Value);

    /// Child keys of the node at `path`.
    fn keys(&self, path: &[String]) -> Vec<String>;

    fn modified(&self, path: &[String]) -> Option<i64>;

    fn set_modified(&self, path: &[String], timestamp: i64);

    /// Newest modified marker among the children of `path`.
    fn max_modified(&self, path: &[String]) -> Option<i64> {
        self.keys(path)
            .into_iter()
            .filter_map(|key| {
                let mut child = path.to_vec();
                child.push(key);
                self.modified(&child)
            })
            .max()
    }
}

/// [`LocalTree`] over a JSON document, with modified markers kept alongside.
#[derive(Default)]
pub struct MemoryTree {
    data: RwLock<Value>,
    modified: DashMap<String, i64>,
}

impl MemoryTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_value(value: Value) -> Self {
        Self {
            data: RwLock::new(value),
            modified: DashMap::new(),
        }
    }

    /// Clone of the whole document.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.data.read().clone()
    }
}

fn marker_key(path: &[String]) -> String {
    path.join("/")
}

impl LocalTree for MemoryTree {
    fn get(&self, path: &[String]) -> Option<Value> {
        get_at_path(&self.data.read(), path).cloned()
    }

    fn set(&self, path: &[String], value: Value) {
        set_at_path(&mut self.data.write(), path, value);
    }

    fn assign(&self, path: &[String], partial: Value) {
        let Value::Object(fields) = partial else {
            self.set(path, partial);
            return;
        };
        let mut data = self.data.write();
        let mut merged = match get_at_path(&data, path) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        for (key, value) in fields {
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }
        set_at_path(&mut data, path, Value::Object(merged));
    }

    fn keys(&self, path: &[String]) -> Vec<String> {
        match get_at_path(&self.data.read(), path) {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn modified(&self, path: &[String]) -> Option<i64> {
        self.modified.get(&marker_key(path)).map(|v| *v)
    }

    fn set_modified(&self, path: &[String], timestamp: i64) {
        self.modified
            .entry(marker_key(path))
            .and_modify(|current| *current = (*current).max(timestamp))
            .or_insert(timestamp);
    }
}
