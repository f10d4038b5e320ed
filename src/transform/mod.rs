// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field transforms: bidirectional renaming between local and remote schemas.
//!
//! A [`FieldTransformMap`] describes the shape of one object level. Each key of
//! a [`FieldTransformMap::Fields`] level maps to a [`FieldTransform`] saying
//! what that key becomes remotely and how its value is shaped.
//!
//! ```text
//! local  { "name": "Ann", "tags": [{ "label": "x" }] }
//!            │                │          │
//!            ▼                ▼          ▼
//! remote { "n":    "Ann", "t":    [{ "l":     "x" }] }
//! ```
//!
//! # Example
//!
//! ```
//! use tree_sync::transform::{FieldTransform, FieldTransformMap};
//! use serde_json::json;
//!
//! let map = FieldTransformMap::fields([
//!     ("name", FieldTransform::rename("n")),
//!     ("tags", FieldTransform::nested(Some("t"), FieldTransformMap::array_of(
//!         FieldTransformMap::fields([("label", FieldTransform::rename("l"))]),
//!     ))),
//! ]);
//!
//! let remote = map.transform_object(&json!({"name": "Ann", "tags": [{"label": "x"}]}));
//! assert_eq!(remote, json!({"n": "Ann", "t": [{"l": "x"}]}));
//!
//! let local = map.invert().transform_object(&remote);
//! assert_eq!(local, json!({"name": "Ann", "tags": [{"label": "x"}]}));
//! ```

mod validate;

pub use validate::TransformValidationError;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transform applied to one key of an object level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    /// Key and value are left untouched.
    PassThrough,
    /// Rename the key; the value below it is left untouched.
    Rename(String),
    /// Optionally rename the key, and transform the value with `shape`.
    Nested {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        shape: FieldTransformMap,
    },
}

impl FieldTransform {
    pub fn rename(name: impl Into<String>) -> Self {
        Self::Rename(name.into())
    }

    pub fn nested(name: Option<&str>, shape: FieldTransformMap) -> Self {
        Self::Nested {
            name: name.map(str::to_string),
            shape,
        }
    }

    /// The new key, when this transform renames.
    fn renamed(&self) -> Option<&str> {
        match self {
            Self::PassThrough => None,
            Self::Rename(name) => Some(name),
            Self::Nested { name, .. } => name.as_deref(),
        }
    }

    /// The key this field is stored under after transforming `key`.
    fn target<'a>(&'a self, key: &'a str) -> &'a str {
        self.renamed().unwrap_or(key)
    }

    /// Shape describing the children of this field, if any.
    fn shape(&self) -> Option<&FieldTransformMap> {
        match self {
            Self::Nested { shape, .. } => Some(shape),
            _ => None,
        }
    }
}

/// Shape of one object level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransformMap {
    /// A plain object whose known keys are transformed individually.
    Fields(BTreeMap<String, FieldTransform>),
    /// An array (or index-keyed object) whose every element has this shape.
    ArrayOf(Box<FieldTransformMap>),
    /// A dictionary with arbitrary keys whose every value has this shape.
    DictionaryOf(Box<FieldTransformMap>),
}

impl FieldTransformMap {
    pub fn fields<K: Into<String>>(entries: impl IntoIterator<Item = (K, FieldTransform)>) -> Self {
        Self::Fields(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn array_of(element: FieldTransformMap) -> Self {
        Self::ArrayOf(Box::new(element))
    }

    pub fn dictionary_of(value: FieldTransformMap) -> Self {
        Self::DictionaryOf(Box::new(value))
    }

    /// Look up the transform for one child segment.
    ///
    /// Returns the new segment name (`None` when unchanged) and the shape of
    /// the child, if known.
    pub(crate) fn child(&self, segment: &str) -> (Option<&str>, Option<&FieldTransformMap>) {
        match self {
            Self::Fields(fields) => match fields.get(segment) {
                Some(transform) => (transform.renamed(), transform.shape()),
                None => (None, None),
            },
            // Array indices and dictionary keys are data, not schema.
            Self::ArrayOf(inner) | Self::DictionaryOf(inner) => (None, Some(inner)),
        }
    }

    /// Rename each segment of `path` using the shape at the matching depth.
    ///
    /// Segments with no mapping entry pass through unchanged, and so does
    /// everything below an unmapped or plainly renamed segment.
    pub fn transform_path<S: AsRef<str>>(&self, path: &[S]) -> Vec<String> {
        let mut out = Vec::with_capacity(path.len());
        let mut shape = Some(self);
        for seg in path {
            let seg = seg.as_ref();
            match shape {
                Some(current) => {
                    let (target, next) = current.child(seg);
                    out.push(target.unwrap_or(seg).to_string());
                    shape = next;
                }
                None => out.push(seg.to_string()),
            }
        }
        out
    }

    /// Shape of the node at `path`, if the map describes that deep.
    pub fn at_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&FieldTransformMap> {
        path.iter()
            .try_fold(self, |shape, seg| shape.child(seg.as_ref()).1)
    }

    /// Recursively rename the keys of `value` according to this shape.
    ///
    /// Values whose JSON type does not match the declared shape are returned
    /// unchanged.
    pub fn transform_object(&self, value: &Value) -> Value {
        match (self, value) {
            (Self::Fields(fields), Value::Object(obj)) => {
                let mut out = Map::with_capacity(obj.len());
                for (key, child) in obj {
                    let transformed = match fields.get(key) {
                        Some(transform) => {
                            let child = match transform.shape() {
                                Some(shape) => shape.transform_object(child),
                                None => child.clone(),
                            };
                            (transform.target(key).to_string(), child)
                        }
                        None => (key.clone(), child.clone()),
                    };
                    out.insert(transformed.0, transformed.1);
                }
                Value::Object(out)
            }
            (Self::ArrayOf(inner), Value::Array(items)) => {
                Value::Array(items.iter().map(|item| inner.transform_object(item)).collect())
            }
            // Remote stores hand sparse arrays back as index-keyed objects.
            (Self::ArrayOf(inner) | Self::DictionaryOf(inner), Value::Object(obj)) => Value::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), inner.transform_object(v)))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }

    /// Transform a single child `(key, value)` of a node shaped by `self`.
    pub fn transform_child(&self, key: &str, value: &Value) -> (String, Value) {
        let (target, shape) = self.child(key);
        let value = match shape {
            Some(shape) => shape.transform_object(value),
            None => value.clone(),
        };
        (target.unwrap_or(key).to_string(), value)
    }

    /// Produce the remote→local map by swapping keys and targets at every depth.
    ///
    /// Shape tags map to themselves, so `m.invert().invert() == m` whenever the
    /// sibling targets of `m` are distinct (see [`Self::validate`]).
    #[must_use]
    pub fn invert(&self) -> Self {
        match self {
            Self::Fields(fields) => Self::Fields(
                fields
                    .iter()
                    .map(|(key, transform)| {
                        let inverted = match transform {
                            FieldTransform::PassThrough => FieldTransform::PassThrough,
                            FieldTransform::Rename(_) => FieldTransform::Rename(key.clone()),
                            FieldTransform::Nested { name, shape } => FieldTransform::Nested {
                                name: name.as_ref().map(|_| key.clone()),
                                shape: shape.invert(),
                            },
                        };
                        (transform.target(key).to_string(), inverted)
                    })
                    .collect(),
            ),
            Self::ArrayOf(inner) => Self::ArrayOf(Box::new(inner.invert())),
            Self::DictionaryOf(inner) => Self::DictionaryOf(Box::new(inner.invert())),
        }
    }
}
