// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Path-indexed accumulator of not-yet-flushed writes.
//!
//! Each sync root owns one [`PendingNode`] tree mirroring the remote paths
//! written since the last flush. A node is either a leaf holding exactly one
//! pending value, or an internal node with children; never both.
//!
//! ```text
//! update(["x"], {"a": 1, "b": 2})     x = Leaf({"a":1,"b":2})
//! update(["x", "a"], 5)               x = Internal { a: Leaf(5), b: Leaf(2) }
//! update(["x"], {"c": 3})             x = Internal { c: Leaf(3) }
//! update(["x"], "s")                  x = Leaf("s")
//! ```
//!
//! Flattening the tree with [`PendingNode::leaves`] yields disjoint paths, so
//! the batch built from it never writes one path and an ancestor of it.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum PendingNode {
    Leaf(Value),
    Internal(BTreeMap<String, PendingNode>),
}

impl Default for PendingNode {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingNode {
    /// An empty internal node.
    #[must_use]
    pub fn new() -> Self {
        Self::Internal(BTreeMap::new())
    }

    /// True for an internal node with no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Internal(children) if children.is_empty())
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Record a write of `value` at `path` (last write wins at that path).
    ///
    /// Descending through an existing leaf inlines an object leaf one level
    /// down (each field becomes a child leaf) and discards any other leaf.
    /// At the final segment, a node that already has children and receives a
    /// non-empty object is rebuilt from that object's fields; otherwise it
    /// becomes a leaf.
    pub fn update<S: AsRef<str>>(&mut self, path: &[S], value: Value) {
        let Some((first, rest)) = path.split_first() else {
            self.settle(value);
            return;
        };

        self.make_internal();
        if let Self::Internal(children) = self {
            children
                .entry(first.as_ref().to_string())
                .or_default()
                .update(rest, value);
        }
    }

    fn settle(&mut self, value: Value) {
        let has_children = matches!(self, Self::Internal(children) if !children.is_empty());
        *self = match value {
            Value::Object(fields) if has_children && !fields.is_empty() => {
                Self::Internal(inline(fields))
            }
            other => Self::Leaf(other),
        };
    }

    fn make_internal(&mut self) {
        if let Self::Leaf(value) = self {
            let children = match std::mem::take(value) {
                Value::Object(fields) => inline(fields),
                _ => BTreeMap::new(),
            };
            *self = Self::Internal(children);
        }
    }

    /// Node at `path`, if the tree reaches that deep.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&PendingNode> {
        path.iter().try_fold(self, |node, seg| match node {
            Self::Internal(children) => children.get(seg.as_ref()),
            Self::Leaf(_) => None,
        })
    }

    /// Whether a write at `path` touches anything pending here.
    ///
    /// True when `path` is at or below a pending leaf, or is an ancestor of
    /// one.
    pub fn overlaps<S: AsRef<str>>(&self, path: &[S]) -> bool {
        let mut node = self;
        for seg in path {
            match node {
                Self::Leaf(_) => return true,
                Self::Internal(children) => match children.get(seg.as_ref()) {
                    Some(child) => node = child,
                    None => return false,
                },
            }
        }
        !node.is_empty()
    }

    /// Every pending leaf with its path, in key order.
    pub fn leaves(&self) -> Vec<(Vec<String>, &Value)> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.collect_leaves(&mut prefix, &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: &mut Vec<String>, out: &mut Vec<(Vec<String>, &'a Value)>) {
        match self {
            Self::Leaf(value) => out.push((prefix.clone(), value)),
            Self::Internal(children) => {
                for (key, child) in children {
                    prefix.push(key.clone());
                    child.collect_leaves(prefix, out);
                    prefix.pop();
                }
            }
        }
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Internal(children) => children.values().map(PendingNode::leaf_count).sum(),
        }
    }

    /// Put an older tree back underneath this one.
    ///
    /// Used when a flush fails: the failed writes are replayed first and the
    /// writes made since then are replayed over them.
    pub fn restore_under(&mut self, older: PendingNode) {
        let newer = std::mem::replace(self, older);
        for (path, value) in newer.leaves() {
            self.update(&path, value.clone());
        }
    }
}

fn inline(fields: Map<String, Value>) -> BTreeMap<String, PendingNode> {
    fields
        .into_iter()
        .map(|(key, value)| (key, PendingNode::Leaf(value)))
        .collect()
}
