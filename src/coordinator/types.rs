// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync engine coordinator.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::storage::traits::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Remote write failed: {0}")]
    RemoteWrite(#[source] StoreError),
    #[error("Initial query at '{path}' failed: {source}")]
    Query {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("No signed-in principal after {0:?}")]
    AuthTimeout(Duration),
    #[error("Sync path '{0}' needs a signed-in principal")]
    NotSignedIn(String),
    #[error("Save was dropped before its flush completed")]
    Abandoned,
}

/// What `save` resolves to once its flush cycle completes.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedValue {
    /// The saved value, with any confirmed remote values merged over it
    pub value: Value,
    /// Newest server timestamp among the confirmed values, if any
    pub date_modified: Option<i64>,
}

/// Lifecycle of one listener.
///
/// ```text
/// Unsubscribed → AwaitingAuth → QueryingInitialSnapshot → Subscribed
///                                                       ↘ Loaded (once-only)
/// ```
///
/// Variants are ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenState {
    /// Not started, or torn down
    Unsubscribed,
    /// Waiting for a signed-in principal
    AwaitingAuth,
    /// Subscribed; initial snapshot not applied yet
    QueryingInitialSnapshot,
    /// Initial snapshot applied; streaming changes
    Subscribed,
    /// Initial snapshot applied; not streaming (`once`)
    Loaded,
}

impl ListenState {
    /// True once the initial snapshot has been applied.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Subscribed | Self::Loaded)
    }
}

impl fmt::Display for ListenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubscribed => write!(f, "Unsubscribed"),
            Self::AwaitingAuth => write!(f, "AwaitingAuth"),
            Self::QueryingInitialSnapshot => write!(f, "QueryingInitialSnapshot"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Loaded => write!(f, "Loaded"),
        }
    }
}

/// A remote change applied to the local tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Local path of the node that changed, relative to the sync root
    pub path: Vec<String>,
    /// New value; `None` when the node was removed
    pub value: Option<Value>,
    pub timestamp: Option<i64>,
    /// Part of the initial snapshot rather than a streamed change
    pub initial: bool,
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
