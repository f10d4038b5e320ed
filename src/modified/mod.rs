// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Modified-timestamp policy.
//!
//! A [`ModifiedSpec`] says which remote records carry a server-assigned
//! last-modified timestamp under [`TIMESTAMP_KEY`]. Timestamps are what lets
//! a listener range-query only the children changed since its newest local
//! copy.
//!
//! # Record shapes
//!
//! ```text
//! tracked primitive   "Ann"          →  { "@": <ts>, "_": "Ann" }
//! tracked object      { "a": 1 }     →  { "@": <ts>, "a": 1 }
//! untracked anything  v              →  v
//! ```
//!
//! # Spec forms
//!
//! | JSON     | Variant                     | Meaning                                   |
//! |----------|-----------------------------|-------------------------------------------|
//! | `false`  | [`ModifiedSpec::Untracked`] | nothing here or below is stamped          |
//! | `true`   | [`ModifiedSpec::Tracked`]   | this exact node is stamped                |
//! | `"*"`    | [`ModifiedSpec::Wildcard`]  | this node and every descendant is stamped |
//! | `{...}`  | [`ModifiedSpec::Nested`]    | per-child specs; `"*"` key is the default |
//!
//! A write strictly beneath a stamped node does not rewrite that node; the
//! batch gets an extra `<node>/@` entry instead (see [`ModifiedSpec::stamp`]).

mod decode;

pub use decode::{decode, is_wrapped, Decoded};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transform::FieldTransformMap;

/// Key holding the server timestamp inside a stamped record.
pub const TIMESTAMP_KEY: &str = "@";

/// Key holding the wrapped value of a stamped primitive.
pub const VALUE_KEY: &str = "_";

/// Key of a [`ModifiedSpec::Nested`] entry that applies to every other child.
pub const WILDCARD_KEY: &str = "*";

static UNTRACKED: ModifiedSpec = ModifiedSpec::Untracked;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawSpec", into = "RawSpec")]
pub enum ModifiedSpec {
    #[default]
    Untracked,
    Tracked,
    Wildcard,
    Nested(BTreeMap<String, ModifiedSpec>),
}

/// Outcome of [`ModifiedSpec::stamp`] for one pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedWrite {
    /// The value to write, with timestamps injected where this policy tracks them.
    pub value: Value,
    /// Ancestors of the written path (relative to the sync root) that need a
    /// separate `<ancestor>/@` entry in the batch.
    pub markers: Vec<Vec<String>>,
}

impl ModifiedSpec {
    pub fn nested<K: Into<String>>(entries: impl IntoIterator<Item = (K, ModifiedSpec)>) -> Self {
        Self::Nested(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Whether the record at this node carries a timestamp.
    #[must_use]
    pub fn tracked_here(&self) -> bool {
        matches!(self, Self::Tracked | Self::Wildcard)
    }

    /// Spec governing child `key` of this node.
    pub fn child(&self, key: &str) -> &ModifiedSpec {
        match self {
            Self::Untracked | Self::Tracked => &UNTRACKED,
            Self::Wildcard => self,
            Self::Nested(children) => children
                .get(key)
                .or_else(|| children.get(WILDCARD_KEY))
                .unwrap_or(&UNTRACKED),
        }
    }

    /// Spec governing the node at `path` below this one.
    pub fn at_path<S: AsRef<str>>(&self, path: &[S]) -> &ModifiedSpec {
        path.iter().fold(self, |spec, seg| spec.child(seg.as_ref()))
    }

    /// Whether every child of this node is stamped.
    ///
    /// Only then can a listener range-filter the node's children by
    /// timestamp without missing untracked siblings.
    #[must_use]
    pub fn children_tracked(&self) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Nested(children) => {
                children.get(WILDCARD_KEY).is_some_and(ModifiedSpec::tracked_here)
                    && children.values().all(ModifiedSpec::tracked_here)
            }
            _ => false,
        }
    }

    /// Rename the keys of a nested spec from local to remote names.
    #[must_use]
    pub fn to_remote(&self, transforms: &FieldTransformMap) -> ModifiedSpec {
        let Self::Nested(children) = self else {
            return self.clone();
        };
        let renamed = children
            .iter()
            .map(|(key, spec)| {
                if key == WILDCARD_KEY {
                    // Every child shares the element shape, if there is one.
                    let spec = match transforms {
                        FieldTransformMap::ArrayOf(inner) | FieldTransformMap::DictionaryOf(inner) => {
                            spec.to_remote(inner)
                        }
                        FieldTransformMap::Fields(_) => spec.clone(),
                    };
                    return (key.clone(), spec);
                }
                let (target, shape) = transforms.child(key);
                let spec = match shape {
                    Some(shape) => spec.to_remote(shape),
                    None => spec.clone(),
                };
                (target.unwrap_or(key).to_string(), spec)
            })
            .collect();
        Self::Nested(renamed)
    }

    /// Apply the policy to a write of `value` at `path` below this node.
    ///
    /// Walks the path one segment at a time: every stamped ancestor becomes a
    /// marker, and the value itself is stamped with the policy reached at the
    /// end of the path.
    pub fn stamp<S: AsRef<str>>(&self, path: &[S], value: Value, timestamp: &Value) -> StampedWrite {
        let mut markers = Vec::new();
        let mut spec = self;
        for (depth, seg) in path.iter().enumerate() {
            if matches!(spec, ModifiedSpec::Untracked) {
                break;
            }
            if spec.tracked_here() {
                markers.push(path[..depth].iter().map(|s| s.as_ref().to_string()).collect());
            }
            spec = spec.child(seg.as_ref());
        }
        StampedWrite {
            value: spec.stamp_value(value, timestamp),
            markers,
        }
    }

    /// Stamp `value` as the record at this node.
    ///
    /// Objects are recursed with each child's spec and get the timestamp
    /// injected alongside their own keys; other values are wrapped. An object
    /// whose only key is `_` is wrapped whole, so it cannot be read back as a
    /// wrapped primitive. `null` is a deletion and is never wrapped.
    pub fn stamp_value(&self, value: Value, timestamp: &Value) -> Value {
        match value {
            Value::Null => Value::Null,
            Value::Object(map) => {
                let mut out: Map<String, Value> = map
                    .into_iter()
                    .map(|(key, child)| {
                        let stamped = self.child(&key).stamp_value(child, timestamp);
                        (key, stamped)
                    })
                    .collect();
                if !self.tracked_here() {
                    return Value::Object(out);
                }
                if out.len() == 1 && out.contains_key(VALUE_KEY) {
                    let mut wrapped = Map::new();
                    wrapped.insert(TIMESTAMP_KEY.to_string(), timestamp.clone());
                    wrapped.insert(VALUE_KEY.to_string(), Value::Object(out));
                    return Value::Object(wrapped);
                }
                out.insert(TIMESTAMP_KEY.to_string(), timestamp.clone());
                Value::Object(out)
            }
            other if self.tracked_here() => {
                let mut wrapped = Map::new();
                wrapped.insert(TIMESTAMP_KEY.to_string(), timestamp.clone());
                wrapped.insert(VALUE_KEY.to_string(), other);
                Value::Object(wrapped)
            }
            other => other,
        }
    }

    /// Strip the timestamps this spec put into `record`, at every depth.
    ///
    /// The returned timestamp is the one found on the record itself.
    pub fn decode_tree(&self, record: Value) -> Decoded {
        let mut decoded = if self.tracked_here() {
            decode(record)
        } else {
            Decoded {
                value: Some(record).filter(|v| !v.is_null()),
                timestamp: None,
            }
        };

        decoded.value = decoded.value.map(|value| self.decode_children(value));
        decoded
    }

    /// Strip the timestamps below the record at this node, leaving the
    /// record's own level alone.
    pub fn decode_children(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter_map(|(key, child)| {
                        let child = self.child(&key).decode_tree(child).value?;
                        Some((key, child))
                    })
                    .collect(),
            ),
            other => other,
        }
    }
}

/// Wire shape of a spec: `true`, `false`, `"*"` or an object of specs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSpec {
    Flag(bool),
    Star(String),
    Nested(BTreeMap<String, ModifiedSpec>),
}

impl TryFrom<RawSpec> for ModifiedSpec {
    type Error = String;

    fn try_from(raw: RawSpec) -> Result<Self, Self::Error> {
        match raw {
            RawSpec::Flag(true) => Ok(Self::Tracked),
            RawSpec::Flag(false) => Ok(Self::Untracked),
            RawSpec::Star(s) if s == WILDCARD_KEY => Ok(Self::Wildcard),
            RawSpec::Star(s) => Err(format!("unsupported modified spec '{s}', expected \"*\"")),
            RawSpec::Nested(children) => Ok(Self::Nested(children)),
        }
    }
}

impl From<ModifiedSpec> for RawSpec {
    fn from(spec: ModifiedSpec) -> Self {
        match spec {
            ModifiedSpec::Untracked => RawSpec::Flag(false),
            ModifiedSpec::Tracked => RawSpec::Flag(true),
            ModifiedSpec::Wildcard => RawSpec::Star(WILDCARD_KEY.to_string()),
            ModifiedSpec::Nested(children) => RawSpec::Nested(children),
        }
    }
}
