// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Contract of the hierarchical remote store the engine synchronizes with.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Permission denied at '{path}'")]
    PermissionDenied { path: String },
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
    #[error("Remote store backend error: {0}")]
    Backend(String),
}

/// Children of the queried node whose `field` is at least `start_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    pub field: String,
    pub start_at: i64,
}

/// A reference to one remote node, optionally narrowed by a range filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub path: String,
    pub range: Option<RangeFilter>,
}

impl Query {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            range: None,
        }
    }

    /// Order children by `field` and start at `start_at` (inclusive).
    #[must_use]
    pub fn start_at(mut self, field: impl Into<String>, start_at: i64) -> Self {
        self.range = Some(RangeFilter {
            field: field.into(),
            start_at,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Added,
    Changed,
}

/// A child of a subscribed node appeared or changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    pub key: String,
    pub value: Value,
}

pub type ChildCallback = Arc<dyn Fn(ChildEvent) + Send + Sync>;
pub type CancelCallback = Arc<dyn Fn(StoreError) + Send + Sync>;
/// Called with the signed-in principal id, or `None` when signed out.
pub type AuthCallback = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Handle to an active child subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A hierarchical key/value store with server timestamps, multi-path atomic
/// updates, child subscriptions and an auth principal.
///
/// Child callbacks may be invoked synchronously from inside
/// [`RemoteStore::atomic_update`]; implementations must not hold internal
/// locks while calling them.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reference to the node at an absolute path.
    fn resolve_ref(&self, path: &str) -> Query {
        Query::at(path)
    }

    /// Narrow `query` to children whose `field` is at least `start_at`.
    fn range_query(&self, query: Query, field: &str, start_at: i64) -> Query {
        query.start_at(field, start_at)
    }

    /// One-shot read; a missing node reads as `null`.
    async fn once(&self, query: &Query) -> Result<Value, StoreError>;

    /// Existing children are replayed as added events on subscribe.
    fn on_child_added(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback)
        -> Subscription;

    fn on_child_changed(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback)
        -> Subscription;

    /// Opaque sentinel the store replaces with its own clock on write.
    fn server_timestamp(&self) -> Value;

    /// Write every `path -> value` entry as one atomic operation.
    /// A `null` value deletes the node.
    async fn atomic_update(&self, batch: BTreeMap<String, Value>) -> Result<(), StoreError>;

    fn on_auth_state_changed(&self, callback: AuthCallback);

    fn current_principal(&self) -> Option<String>;
}
