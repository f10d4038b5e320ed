// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gate for operations that need a signed-in principal.
//!
//! The gate registers one auth-state callback with the store the first time
//! anything waits on it, and opens on the first signed-in principal. Once
//! open it stays open, even across a later sign-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::storage::traits::RemoteStore;

use super::SyncError;

pub(super) struct AuthGate {
    signed_in: Arc<watch::Sender<bool>>,
    registered: AtomicBool,
}

impl AuthGate {
    pub(super) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signed_in: Arc::new(tx),
            registered: AtomicBool::new(false),
        }
    }

    pub(super) fn is_open(&self) -> bool {
        *self.signed_in.borrow()
    }

    fn register(&self, store: &dyn RemoteStore) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let signed_in = Arc::clone(&self.signed_in);
        store.on_auth_state_changed(Arc::new(move |principal: Option<&str>| {
            if let Some(uid) = principal {
                if !signed_in.send_replace(true) {
                    info!(principal = uid, "Auth gate opened");
                }
            }
        }));
        debug!("Auth state callback registered");
    }

    /// Resolve once a principal has been seen.
    ///
    /// Without a `timeout` this waits as long as it takes.
    pub(super) async fn wait(&self, store: &dyn RemoteStore, timeout: Option<Duration>) -> Result<(), SyncError> {
        self.register(store);
        let mut rx = self.signed_in.subscribe();
        let opened = async move { rx.wait_for(|open| *open).await.map(|_| ()) };

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, opened)
                .await
                .map_err(|_| SyncError::AuthTimeout(limit))?,
            None => opened.await,
        };
        result.map_err(|_| SyncError::Abandoned)
    }
}
