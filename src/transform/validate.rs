// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structural checks on a [`FieldTransformMap`].
//!
//! Problems are reported, never fatal: the engine logs them (in builds where
//! validation is enabled) and keeps going with the map as given.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{FieldTransform, FieldTransformMap};
use crate::modified::{TIMESTAMP_KEY, VALUE_KEY};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformValidationError {
    #[error("field transform at '{path}' maps {keys:?} to the same target '{target}'")]
    DuplicateTarget {
        path: String,
        target: String,
        keys: Vec<String>,
    },
    #[error("field transform at '{path}' maps '{key}' to reserved key '{target}'")]
    ReservedTarget {
        path: String,
        key: String,
        target: String,
    },
}

impl FieldTransformMap {
    /// Check that sibling targets are distinct and never reserved.
    ///
    /// Returns every problem found, depth first. An empty vec means the map
    /// can be inverted without losing entries.
    pub fn validate(&self) -> Vec<TransformValidationError> {
        let mut errors = Vec::new();
        self.validate_at("", &mut errors);
        errors
    }

    fn validate_at(&self, path: &str, errors: &mut Vec<TransformValidationError>) {
        let fields = match self {
            Self::Fields(fields) => fields,
            Self::ArrayOf(inner) | Self::DictionaryOf(inner) => {
                inner.validate_at(&format!("{path}/*"), errors);
                return;
            }
        };

        // Unrenamed keys keep their own name, so they compete for targets too.
        let mut by_target: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (key, transform) in fields {
            if let Some(target) = transform.renamed() {
                if target == TIMESTAMP_KEY || target == VALUE_KEY {
                    errors.push(TransformValidationError::ReservedTarget {
                        path: display_path(path),
                        key: key.clone(),
                        target: target.to_string(),
                    });
                }
            }
            by_target.entry(transform.target(key)).or_default().push(key.clone());

            if let FieldTransform::Nested { shape, .. } = transform {
                shape.validate_at(&format!("{path}/{key}"), errors);
            }
        }

        for (target, keys) in by_target {
            if keys.len() > 1 {
                errors.push(TransformValidationError::DuplicateTarget {
                    path: display_path(path),
                    target: target.to_string(),
                    keys,
                });
            }
        }
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}
