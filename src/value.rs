// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON helpers shared by the save and listen paths.
//!
//! Every value flowing through the engine is a [`serde_json::Value`]. Remote
//! records are addressed by `/`-delimited absolute paths; internally a path is
//! a slice of segments relative to a sync root.

use serde_json::{Map, Value};

/// Delimiter used inside a single child key to address a deeper node.
///
/// A child key `a~b` under node `n` stands for `n/a/b`.
pub const KEY_DELIMITER: char = '~';

/// Split a `/`-delimited path into segments, ignoring empty segments.
///
/// ```
/// use tree_sync::value::split_path;
///
/// assert_eq!(split_path("/users/u1/name"), vec!["users", "u1", "name"]);
/// assert!(split_path("/").is_empty());
/// ```
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join a base path and relative segments into an absolute path.
///
/// The result has a leading `/` and no trailing `/`:
/// `join_path("/base/", ["a", "b"])` is `/base/a/b`.
pub fn join_path<S: AsRef<str>>(base: &str, segments: &[S]) -> String {
    let mut out = String::from("/");
    let base_parts = base.split('/').filter(|s| !s.is_empty());
    let rel_parts = segments.iter().map(AsRef::as_ref).filter(|s| !s.is_empty());
    for (i, part) in base_parts.chain(rel_parts).enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Drop `null` members from objects, recursively.
///
/// A top-level `null` is returned unchanged: it is how a deletion is written.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Deep-merge `source` over `target`.
///
/// Objects merge key by key; anything else in `source` replaces the target.
pub fn merge_deep(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, src_value) in src {
                match dst.get_mut(key) {
                    Some(dst_value) => merge_deep(dst_value, src_value),
                    None => {
                        dst.insert(key.clone(), src_value.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Borrow the value at `path`, indexing objects by key and arrays by position.
pub fn get_at_path<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, seg| match node {
        Value::Object(map) => map.get(seg.as_ref()),
        Value::Array(items) => seg.as_ref().parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `new_value` at `path`, creating intermediate objects.
///
/// Non-object intermediates are replaced by objects. Writing `null` removes the
/// key and prunes parents left empty, matching how the remote store treats
/// `null` in an update.
pub fn set_at_path<S: AsRef<str>>(value: &mut Value, path: &[S], new_value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *value = new_value;
        return;
    };

    if new_value.is_null() {
        remove_at_path(value, path);
        return;
    }

    let mut node = value;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(seg.as_ref().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.as_ref().to_string(), new_value);
    }
}

/// Remove the value at `path`, pruning objects that become empty.
///
/// Returns true if anything was removed.
pub fn remove_at_path<S: AsRef<str>>(value: &mut Value, path: &[S]) -> bool {
    let Some((first, rest)) = path.split_first() else {
        let had_value = !value.is_null();
        *value = Value::Null;
        return had_value;
    };
    let Value::Object(map) = value else {
        return false;
    };
    if rest.is_empty() {
        map.remove(first.as_ref()).is_some()
    } else {
        match map.get_mut(first.as_ref()) {
            Some(child) => {
                let removed = remove_at_path(child, rest);
                if removed && child.as_object().is_some_and(Map::is_empty) {
                    map.remove(first.as_ref());
                }
                removed
            }
            None => false,
        }
    }
}

/// Build `{k1: {k2: ... value}}` from a key list.
pub fn construct_object<S: AsRef<str>>(keys: &[S], value: Value) -> Value {
    keys.iter().rev().fold(value, |inner, key| {
        let mut map = Map::new();
        map.insert(key.as_ref().to_string(), inner);
        Value::Object(map)
    })
}

/// Expand a child key using [`KEY_DELIMITER`] into path segments.
pub fn expand_key(key: &str) -> Vec<String> {
    key.split(KEY_DELIMITER)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
