// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync engine.
//!
//! [`SyncEngineConfig`] holds engine-wide settings; [`SyncOptions`] describes
//! one synced subtree and is passed to every `save` and `listen` call.
//!
//! # Example
//!
//! ```
//! use tree_sync::{SyncEngineConfig, SyncOptions};
//! use serde_json::json;
//!
//! let config = SyncEngineConfig::default();
//! assert_eq!(config.save_debounce_ms, 3000);
//!
//! let options: SyncOptions = serde_json::from_value(json!({
//!     "sync_path": "/users/{uid}/",
//!     "require_auth": true,
//!     "query_by_modified": {"todos": {"*": true}},
//!     "field_transforms": {"fields": {"todos": {"rename": "t"}}},
//! })).unwrap();
//! assert_eq!(options.sync_path.resolve(Some("u1")).as_deref(), Some("/users/u1/"));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::modified::ModifiedSpec;
use crate::transform::FieldTransformMap;

/// Placeholder replaced by the signed-in principal id.
pub const UID_PLACEHOLDER: &str = "{uid}";

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    /// Debounce window for saves, unless a subtree overrides it (0 = flush immediately)
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,

    /// Log structural problems in field transform maps
    #[serde(default = "default_validate_transforms")]
    pub validate_transforms: bool,

    /// Fail auth-gated calls after this long instead of waiting forever
    #[serde(default)]
    pub auth_timeout_ms: Option<u64>,
}

fn default_save_debounce_ms() -> u64 { 3000 }
fn default_validate_transforms() -> bool { cfg!(debug_assertions) }

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: default_save_debounce_ms(),
            validate_transforms: default_validate_transforms(),
            auth_timeout_ms: None,
        }
    }
}

/// Remote base path template, e.g. `/users/{uid}/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncPath(String);

impl SyncPath {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn needs_principal(&self) -> bool {
        self.0.contains(UID_PLACEHOLDER)
    }

    /// Substitute the principal and normalise to a leading and trailing `/`.
    ///
    /// Returns `None` when the template needs a principal and there is none.
    #[must_use]
    pub fn resolve(&self, principal: Option<&str>) -> Option<String> {
        let substituted = if self.needs_principal() {
            self.0.replace(UID_PLACEHOLDER, principal?)
        } else {
            self.0.clone()
        };
        let trimmed = substituted.trim_matches('/');
        Some(if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        })
    }
}

impl Default for SyncPath {
    fn default() -> Self {
        Self::new("/")
    }
}

impl fmt::Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncPath {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

/// Settings for one synced subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    pub sync_path: SyncPath,

    /// Wait for a signed-in principal before touching the store
    #[serde(default)]
    pub require_auth: bool,

    /// Load once; do not subscribe to changes
    #[serde(default)]
    pub once: bool,

    /// Never write to the store
    #[serde(default)]
    pub readonly: bool,

    /// Overrides [`SyncEngineConfig::save_debounce_ms`]
    #[serde(default)]
    pub save_debounce_ms: Option<u64>,

    #[serde(default)]
    pub field_transforms: Option<FieldTransformMap>,

    /// Which records carry a server timestamp (`true`, `"*"` or nested)
    #[serde(default)]
    pub query_by_modified: ModifiedSpec,

    /// Child keys the listener never applies locally
    #[serde(default)]
    pub ignore_keys: Vec<String>,
}

impl SyncOptions {
    pub fn at(sync_path: impl Into<String>) -> Self {
        Self {
            sync_path: SyncPath::new(sync_path),
            ..Default::default()
        }
    }

    /// The timestamp spec with keys renamed to remote names.
    #[must_use]
    pub fn remote_modified_spec(&self) -> ModifiedSpec {
        match &self.field_transforms {
            Some(transforms) => self.query_by_modified.to_remote(transforms),
            None => self.query_by_modified.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: SyncEngineConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.save_debounce_ms, 3000);
        assert_eq!(config.auth_timeout_ms, None);
        assert_eq!(config.validate_transforms, cfg!(debug_assertions));
    }

    #[test]
    fn test_sync_path_resolution() {
        assert_eq!(SyncPath::new("users/{uid}").resolve(Some("u1")).as_deref(), Some("/users/u1/"));
        assert_eq!(SyncPath::new("/users/{uid}/").resolve(None), None);
        assert_eq!(SyncPath::new("/shared").resolve(None).as_deref(), Some("/shared/"));
        assert_eq!(SyncPath::new("").resolve(None).as_deref(), Some("/"));
    }

    #[test]
    fn test_options_deserialize() {
        let options: SyncOptions = serde_json::from_value(json!({
            "sync_path": "/base/",
            "readonly": true,
            "save_debounce_ms": 0,
            "ignore_keys": ["local_only"],
            "query_by_modified": "*",
        }))
        .unwrap();
        assert!(options.readonly);
        assert!(!options.once);
        assert_eq!(options.save_debounce_ms, Some(0));
        assert_eq!(options.ignore_keys, vec!["local_only"]);
        assert_eq!(options.query_by_modified, ModifiedSpec::Wildcard);
        assert!(options.field_transforms.is_none());
    }
}
