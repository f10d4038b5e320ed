// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end engine tests over the in-process store.
//!
//! Every test runs on a paused tokio clock: debounce windows elapse as soon
//! as the runtime is otherwise idle, so no test waits in real time.
//!
//! # Test Organization
//! - `save_*` - batching, debounce, echo routing, root lifecycle
//! - `listen_*` - initial load, streamed changes, range floors, transforms
//! - `auth_*` - principal templates and the auth gate

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use tree_sync::storage::traits::{AuthCallback, CancelCallback, ChildCallback};
use tree_sync::{
    ChangeCallback, ChangeEvent, FieldTransform, FieldTransformMap, ListenState, LocalTree,
    MemoryStore, MemoryTree, ModifiedSpec, Query, RemoteStore, StoreError, Subscription, SyncEngine,
    SyncEngineConfig, SyncError, SyncOptions,
};

// =============================================================================
// Helpers
// =============================================================================

fn p(path: &[&str]) -> Vec<String> {
    path.iter().map(|s| s.to_string()).collect()
}

fn engine_over(store: Arc<dyn RemoteStore>) -> SyncEngine {
    SyncEngine::new(store, SyncEngineConfig::default())
}

fn options(sync_path: &str, spec: Value) -> SyncOptions {
    SyncOptions {
        query_by_modified: serde_json::from_value::<ModifiedSpec>(spec).unwrap(),
        ..SyncOptions::at(sync_path)
    }
}

fn recorder() -> (ChangeCallback, Arc<Mutex<Vec<ChangeEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: ChangeCallback = Arc::new(move |event: &ChangeEvent| sink.lock().push(event.clone()));
    (callback, events)
}

/// Lets the flush and listener tasks run without moving the clock far.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Writes a second value at `path` from "another client" right after each
/// batch lands, before the flush that sent the batch observes its result.
struct RacingWriterStore {
    inner: Arc<MemoryStore>,
    path: String,
    value: Value,
}

#[async_trait]
impl RemoteStore for RacingWriterStore {
    async fn once(&self, query: &Query) -> Result<Value, StoreError> {
        self.inner.once(query).await
    }

    fn on_child_added(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback) -> Subscription {
        self.inner.on_child_added(query, callback, on_cancel)
    }

    fn on_child_changed(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback) -> Subscription {
        self.inner.on_child_changed(query, callback, on_cancel)
    }

    fn server_timestamp(&self) -> Value {
        self.inner.server_timestamp()
    }

    async fn atomic_update(&self, batch: BTreeMap<String, Value>) -> Result<(), StoreError> {
        self.inner.atomic_update(batch).await?;
        self.inner.write_external(&self.path, self.value.clone());
        Ok(())
    }

    fn on_auth_state_changed(&self, callback: AuthCallback) {
        self.inner.on_auth_state_changed(callback);
    }

    fn current_principal(&self) -> Option<String> {
        self.inner.current_principal()
    }
}

/// Reads the snapshot, then lets another client write before the listener
/// has applied it.
struct LateWriterStore {
    inner: Arc<MemoryStore>,
    path: String,
    value: Value,
}

#[async_trait]
impl RemoteStore for LateWriterStore {
    async fn once(&self, query: &Query) -> Result<Value, StoreError> {
        let snapshot = self.inner.once(query).await?;
        self.inner.write_external(&self.path, self.value.clone());
        Ok(snapshot)
    }

    fn on_child_added(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback) -> Subscription {
        self.inner.on_child_added(query, callback, on_cancel)
    }

    fn on_child_changed(&self, query: &Query, callback: ChildCallback, on_cancel: CancelCallback) -> Subscription {
        self.inner.on_child_changed(query, callback, on_cancel)
    }

    fn server_timestamp(&self) -> Value {
        self.inner.server_timestamp()
    }

    async fn atomic_update(&self, batch: BTreeMap<String, Value>) -> Result<(), StoreError> {
        self.inner.atomic_update(batch).await
    }

    fn on_auth_state_changed(&self, callback: AuthCallback) {
        self.inner.on_auth_state_changed(callback);
    }

    fn current_principal(&self) -> Option<String> {
        self.inner.current_principal()
    }
}

// =============================================================================
// Save
// =============================================================================

#[tokio::test(start_paused = true)]
async fn save_wraps_tracked_primitive_in_one_entry() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = options("/base/users/u1/", json!({"name": true}));

    let saved = engine.save(&opts, "/name", json!("Ann")).await.unwrap();
    assert_eq!(saved.value, json!("Ann"));

    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    let mut expected = BTreeMap::new();
    expected.insert(
        "/base/users/u1/name".to_string(),
        json!({"@": store.server_timestamp(), "_": "Ann"}),
    );
    assert_eq!(batches[0], expected);
    assert_eq!(store.value_at("/base/users/u1/name"), json!({"@": 1, "_": "Ann"}));
}

#[tokio::test(start_paused = true)]
async fn save_resolves_with_echo_that_raced_the_flush() {
    let inner = Arc::new(MemoryStore::new());
    let store = Arc::new(RacingWriterStore {
        inner: inner.clone(),
        path: "/base/users/u1/name".into(),
        value: json!({"@": inner.server_timestamp(), "_": "Ann2"}),
    });
    let engine = engine_over(store);
    let opts = options("/base/users/u1/", json!({"name": true}));

    let tree = Arc::new(MemoryTree::new());
    let handle = engine.listen(tree.clone(), opts.clone(), None).unwrap();
    handle.wait_loaded().await.unwrap();

    let saved = engine.save(&opts, "/name", json!("Ann")).await.unwrap();
    assert_eq!(saved.value, json!("Ann2"));
    assert_eq!(saved.date_modified, Some(2));

    // Both echoes went to the save, not to the tree.
    assert_eq!(tree.get(&p(&["name"])), None);
    assert_eq!(inner.value_at("/base/users/u1/name"), json!({"@": 2, "_": "Ann2"}));
}

#[tokio::test(start_paused = true)]
async fn save_overlapping_writes_coalesce_into_one_batch() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions::at("/base/");

    let (first, second) = tokio::join!(
        engine.save(&opts, "/x", json!({"a": 1})),
        engine.save(&opts, "/x/a", json!(2)),
    );
    assert_eq!(first.unwrap().value, json!({"a": 1}));
    assert_eq!(second.unwrap().value, json!(2));

    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].get("/base/x/a"), Some(&json!(2)));
    assert_eq!(batches[0].len(), 1);
    assert_eq!(store.value_at("/base/x"), json!({"a": 2}));
}

#[tokio::test(start_paused = true)]
async fn save_debounce_restarts_on_each_write() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions::at("/base/");

    let first = tokio::spawn({
        let (engine, opts) = (engine.clone(), opts.clone());
        async move { engine.save(&opts, "/a", json!(1)).await }
    });
    tokio::time::sleep(Duration::from_millis(2000)).await;

    let second = tokio::spawn({
        let (engine, opts) = (engine.clone(), opts.clone());
        async move { engine.save(&opts, "/b", json!(2)).await }
    });
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(store.batches().is_empty(), "window restarted by the second save");

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(store.batches().len(), 1);
    assert_eq!(store.value_at("/base"), json!({"a": 1, "b": 2}));
}

#[tokio::test(start_paused = true)]
async fn save_zero_window_flushes_each_write() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions {
        save_debounce_ms: Some(0),
        ..SyncOptions::at("/base/")
    };

    engine.save(&opts, "/a", json!(1)).await.unwrap();
    engine.save(&opts, "/b", json!(2)).await.unwrap();

    assert_eq!(store.batches().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn save_readonly_never_writes() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions {
        readonly: true,
        ..SyncOptions::at("/base/")
    };

    let saved = engine.save(&opts, "/a", json!({"k": null})).await.unwrap();
    assert_eq!(saved.value, json!({"k": null}));
    assert!(store.batches().is_empty());
    assert_eq!(engine.root_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn save_strips_null_members() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions::at("/base/");

    let saved = engine.save(&opts, "/x", json!({"a": 1, "b": null})).await.unwrap();
    assert_eq!(saved.value, json!({"a": 1}));
    assert_eq!(store.value_at("/base/x"), json!({"a": 1}));
}

#[tokio::test(start_paused = true)]
async fn save_flush_now_skips_the_window() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions::at("/base/");

    let pending = tokio::spawn({
        let (engine, opts) = (engine.clone(), opts.clone());
        async move { engine.save(&opts, "/a", json!(1)).await }
    });
    settle().await;
    assert!(engine.has_pending());

    assert_eq!(engine.flush_now().await.unwrap(), 1);
    pending.await.unwrap().unwrap();
    assert_eq!(store.value_at("/base/a"), json!(1));

    // The disarmed timer must not flush an empty tree later.
    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(store.batches().len(), 1);
    assert_eq!(engine.flush_now().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn save_roots_retire_when_idle() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());

    let a = SyncOptions::at("/one/");
    let b = SyncOptions::at("/two/");
    let (ra, rb) = tokio::join!(engine.save(&a, "/k", json!(1)), engine.save(&b, "/k", json!(2)));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(engine.root_count(), 0);
    assert!(!engine.has_pending());
    // One batch per root
    assert_eq!(store.batches().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn save_applies_field_transforms_and_wildcard_markers() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions {
        field_transforms: Some(FieldTransformMap::fields([(
            "todos",
            FieldTransform::nested(
                Some("t"),
                FieldTransformMap::dictionary_of(FieldTransformMap::fields([(
                    "title",
                    FieldTransform::rename("ti"),
                )])),
            ),
        )])),
        ..options("/base/", json!({"todos": "*"}))
    };

    engine.save(&opts, "/todos/t1/title", json!("milk")).await.unwrap();

    let batch = &store.batches()[0];
    let ts = store.server_timestamp();
    assert_eq!(batch.get("/base/t/t1/ti"), Some(&json!({"@": ts, "_": "milk"})));
    assert_eq!(batch.get("/base/t/@"), Some(&ts));
    assert_eq!(batch.get("/base/t/t1/@"), Some(&ts));
}

// =============================================================================
// Listen
// =============================================================================

#[tokio::test(start_paused = true)]
async fn listen_loads_snapshot_then_streams_changes() {
    let store = Arc::new(MemoryStore::new());
    store.write_external("/base/profile", json!({"name": "Ann", "age": 30}));
    let engine = engine_over(store.clone());
    let (on_change, events) = recorder();

    let tree = Arc::new(MemoryTree::new());
    let handle = engine
        .listen(tree.clone(), SyncOptions::at("/base/"), Some(on_change))
        .unwrap();
    handle.wait_loaded().await.unwrap();

    assert_eq!(handle.state(), ListenState::Subscribed);
    assert!(engine.is_loaded("/base"));
    assert_eq!(tree.snapshot(), json!({"profile": {"name": "Ann", "age": 30}}));
    assert!(events.lock().iter().all(|e| e.initial));

    store.write_external("/base/profile/age", json!(31));
    store.write_external("/base/city", json!("Oslo"));

    assert_eq!(tree.get(&p(&["profile", "age"])), Some(json!(31)));
    assert_eq!(tree.get(&p(&["city"])), Some(json!("Oslo")));
    let streamed: Vec<ChangeEvent> = events.lock().iter().filter(|e| !e.initial).cloned().collect();
    assert_eq!(streamed.len(), 2);
    assert_eq!(streamed[1].path, p(&["city"]));
    assert_eq!(streamed[1].value, Some(json!("Oslo")));
}

#[tokio::test(start_paused = true)]
async fn listen_drops_changes_that_arrive_before_first_load() {
    let inner = Arc::new(MemoryStore::new());
    inner.write_external("/base/a", json!(1));
    let store = Arc::new(LateWriterStore {
        inner: inner.clone(),
        path: "/base/b".into(),
        value: json!(2),
    });
    let engine = engine_over(store);

    let tree = Arc::new(MemoryTree::new());
    let handle = engine.listen(tree.clone(), SyncOptions::at("/base/"), None).unwrap();
    handle.wait_loaded().await.unwrap();

    // `b` landed between the snapshot read and the load completing.
    assert_eq!(tree.snapshot(), json!({"a": 1}));
    assert_eq!(inner.value_at("/base/b"), json!(2));

    inner.write_external("/base/b", json!(3));
    assert_eq!(tree.get(&p(&["b"])), Some(json!(3)));
}

#[tokio::test(start_paused = true)]
async fn listen_decodes_timestamps_and_marks_modified() {
    let store = Arc::new(MemoryStore::new());
    store.write_external("/base/name", json!({"@": 40, "_": "Ann"}));
    let engine = engine_over(store.clone());

    let tree = Arc::new(MemoryTree::new());
    let handle = engine
        .listen(tree.clone(), options("/base/", json!({"name": true})), None)
        .unwrap();
    handle.wait_loaded().await.unwrap();

    assert_eq!(tree.get(&p(&["name"])), Some(json!("Ann")));
    assert_eq!(tree.modified(&p(&["name"])), Some(40));

    store.write_external("/base/name", json!({"@": 41, "_": "Bea"}));
    assert_eq!(tree.get(&p(&["name"])), Some(json!("Bea")));
    assert_eq!(tree.modified(&p(&["name"])), Some(41));
}

#[tokio::test(start_paused = true)]
async fn listen_reads_back_object_keyed_by_value_marker() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    engine
        .save(&options("/base/", json!({"n": true})), "/n", json!({"_": 5}))
        .await
        .unwrap();
    assert_eq!(store.value_at("/base/n"), json!({"@": 1, "_": {"_": 5}}));

    // From the parent: the record arrives as a child.
    let parent = Arc::new(MemoryTree::new());
    let handle = engine
        .listen(parent.clone(), options("/base/", json!({"n": true})), None)
        .unwrap();
    handle.wait_loaded().await.unwrap();
    assert_eq!(parent.get(&p(&["n"])), Some(json!({"_": 5})));
    assert_eq!(parent.modified(&p(&["n"])), Some(1));

    // On the node itself: the record is the snapshot.
    let node = Arc::new(MemoryTree::new());
    let handle = engine.listen(node.clone(), options("/base/n/", json!(true)), None).unwrap();
    handle.wait_loaded().await.unwrap();
    assert_eq!(node.snapshot(), json!({"_": 5}));
}

#[tokio::test(start_paused = true)]
async fn listen_range_floor_skips_children_already_seen() {
    let store = Arc::new(MemoryStore::new());
    store.write_external("/base/t1", json!({"@": 3, "title": {"@": 3, "_": "remote"}}));
    store.write_external("/base/t2", json!({"@": 7, "title": {"@": 7, "_": "b"}}));
    let engine = engine_over(store.clone());

    let tree = Arc::new(MemoryTree::with_value(json!({"t1": {"title": "local"}})));
    tree.set_modified(&p(&["t1"]), 5);

    let handle = engine.listen(tree.clone(), options("/base/", json!("*")), None).unwrap();
    handle.wait_loaded().await.unwrap();

    assert_eq!(tree.get(&p(&["t1", "title"])), Some(json!("local")));
    assert_eq!(tree.get(&p(&["t2", "title"])), Some(json!("b")));
    assert_eq!(tree.modified(&p(&["t2"])), Some(7));
}

#[tokio::test(start_paused = true)]
async fn listen_splits_mixed_spec_per_child() {
    let store = Arc::new(MemoryStore::new());
    store.write_external("/base/todos/t1", json!({"@": 9, "done": {"@": 9, "_": true}}));
    store.write_external("/base/name", json!({"@": 2, "_": "Ann"}));
    let engine = engine_over(store.clone());

    let tree = Arc::new(MemoryTree::new());
    let opts = options("/base/", json!({"todos": "*", "name": true}));
    let handle = engine.listen(tree.clone(), opts, None).unwrap();
    assert_eq!(handle.paths(), vec![p(&["name"]).as_slice(), p(&["todos"]).as_slice()]);
    handle.wait_loaded().await.unwrap();

    assert_eq!(tree.get(&p(&["todos", "t1", "done"])), Some(json!(true)));
    assert_eq!(tree.get(&p(&["name"])), Some(json!("Ann")));
    assert_eq!(tree.modified(&p(&["name"])), Some(2));
}

#[tokio::test(start_paused = true)]
async fn listen_once_loads_without_subscribing() {
    let store = Arc::new(MemoryStore::new());
    store.write_external("/base/a", json!(1));
    let engine = engine_over(store.clone());

    let tree = Arc::new(MemoryTree::new());
    let opts = SyncOptions {
        once: true,
        ..SyncOptions::at("/base/")
    };
    let handle = engine.listen(tree.clone(), opts, None).unwrap();
    handle.wait_loaded().await.unwrap();

    assert_eq!(handle.state(), ListenState::Loaded);
    assert_eq!(store.subscriber_count(), 0);

    store.write_external("/base/a", json!(2));
    assert_eq!(tree.get(&p(&["a"])), Some(json!(1)));
}

#[tokio::test(start_paused = true)]
async fn listen_ignores_configured_keys_and_expands_tilde_keys() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());

    let tree = Arc::new(MemoryTree::new());
    let opts = SyncOptions {
        ignore_keys: vec!["secret".into()],
        ..SyncOptions::at("/base/")
    };
    let handle = engine.listen(tree.clone(), opts, None).unwrap();
    handle.wait_loaded().await.unwrap();

    store.write_external("/base/secret", json!("x"));
    store.write_external("/base/a~b", json!(1));

    assert_eq!(tree.get(&p(&["secret"])), None);
    assert_eq!(tree.get(&p(&["a", "b"])), Some(json!(1)));
}

#[tokio::test(start_paused = true)]
async fn listen_renames_remote_fields_to_local_names() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions {
        field_transforms: Some(FieldTransformMap::fields([(
            "profile",
            FieldTransform::nested(
                Some("p"),
                FieldTransformMap::fields([("name", FieldTransform::rename("n"))]),
            ),
        )])),
        ..SyncOptions::at("/base/")
    };

    engine.save(&opts, "/profile", json!({"name": "Ann"})).await.unwrap();
    assert_eq!(store.value_at("/base/p"), json!({"n": "Ann"}));

    let tree = Arc::new(MemoryTree::new());
    let handle = engine.listen(tree.clone(), opts.clone(), None).unwrap();
    handle.wait_loaded().await.unwrap();
    assert_eq!(tree.snapshot(), json!({"profile": {"name": "Ann"}}));

    store.write_external("/base/p/n", json!("Bob"));
    assert_eq!(tree.get(&p(&["profile", "name"])), Some(json!("Bob")));
}

#[tokio::test(start_paused = true)]
async fn listen_applies_changes_outside_pending_writes() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions::at("/base/");

    let tree = Arc::new(MemoryTree::new());
    let handle = engine.listen(tree.clone(), opts.clone(), None).unwrap();
    handle.wait_loaded().await.unwrap();

    let pending = tokio::spawn({
        let (engine, opts) = (engine.clone(), opts.clone());
        async move { engine.save(&opts, "/mine", json!(1)).await }
    });
    settle().await;

    store.write_external("/base/mine", json!(5));
    store.write_external("/base/theirs", json!(6));
    assert_eq!(tree.get(&p(&["mine"])), None);
    assert_eq!(tree.get(&p(&["theirs"])), Some(json!(6)));

    let saved = pending.await.unwrap().unwrap();
    // The own write is the newest value; the earlier external one was
    // merged first and then overwritten by the echo.
    assert_eq!(saved.value, json!(1));
    assert_eq!(store.value_at("/base/mine"), json!(1));
}

#[tokio::test(start_paused = true)]
async fn listen_handle_drop_unsubscribes() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());

    let tree = Arc::new(MemoryTree::new());
    let handle = engine.listen(tree.clone(), SyncOptions::at("/base/"), None).unwrap();
    handle.wait_loaded().await.unwrap();
    assert_eq!(store.subscriber_count(), 2);

    handle.unsubscribe();
    assert_eq!(store.subscriber_count(), 0);

    store.write_external("/base/a", json!(1));
    assert_eq!(tree.get(&p(&["a"])), None);
}

#[tokio::test(start_paused = true)]
async fn listen_again_after_drop_gates_on_its_own_load() {
    let store = Arc::new(MemoryStore::new());
    store.write_external("/base/a", json!(1));
    let engine = engine_over(store.clone());

    let first = engine.listen(Arc::new(MemoryTree::new()), SyncOptions::at("/base/"), None).unwrap();
    first.wait_loaded().await.unwrap();
    assert!(engine.is_loaded("/base"));
    drop(first);
    assert!(!engine.is_loaded("/base"));

    // Subscribing replays `a` before the snapshot read; that replay must be
    // dropped rather than applied as a streamed change.
    let (on_change, events) = recorder();
    let tree = Arc::new(MemoryTree::new());
    let second = engine.listen(tree.clone(), SyncOptions::at("/base/"), Some(on_change)).unwrap();
    let mut state = second.subscribe_state(0).unwrap();
    assert!(second.subscribe_state(1).is_none());
    state.wait_for(|s| *s == ListenState::Subscribed).await.unwrap();

    assert!(engine.is_loaded("/base"));
    assert_eq!(tree.snapshot(), json!({"a": 1}));
    let recorded = events.lock().clone();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].initial);
}

#[tokio::test(start_paused = true)]
async fn listen_loaded_flag_outlives_one_of_two_listeners() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());

    let first = engine.listen(Arc::new(MemoryTree::new()), SyncOptions::at("/base/"), None).unwrap();
    let second = engine.listen(Arc::new(MemoryTree::new()), SyncOptions::at("/base/"), None).unwrap();
    first.wait_loaded().await.unwrap();
    second.wait_loaded().await.unwrap();

    first.unsubscribe();
    assert!(engine.is_loaded("/base"));
    second.unsubscribe();
    assert!(!engine.is_loaded("/base"));
}

// =============================================================================
// Auth
// =============================================================================

#[tokio::test(start_paused = true)]
async fn auth_principal_template_needs_sign_in() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions::at("/users/{uid}/");

    let err = engine.save(&opts, "/a", json!(1)).await.unwrap_err();
    assert_eq!(err, SyncError::NotSignedIn("/users/{uid}/".into()));
    assert!(engine.listen(Arc::new(MemoryTree::new()), opts.clone(), None).is_err());

    store.sign_in("u1");
    engine.save(&opts, "/a", json!(1)).await.unwrap();
    assert_eq!(store.value_at("/users/u1/a"), json!(1));
}

#[tokio::test(start_paused = true)]
async fn auth_gated_save_waits_for_principal() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone());
    let opts = SyncOptions {
        require_auth: true,
        ..SyncOptions::at("/users/{uid}/")
    };

    let tree = Arc::new(MemoryTree::new());
    let handle = engine.listen(tree.clone(), opts.clone(), None).unwrap();
    let pending = tokio::spawn({
        let (engine, opts) = (engine.clone(), opts.clone());
        async move { engine.save(&opts, "/a", json!(1)).await }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!pending.is_finished());
    assert_eq!(handle.state(), ListenState::AwaitingAuth);
    assert!(!engine.is_signed_in());

    store.sign_in("u7");
    pending.await.unwrap().unwrap();
    handle.wait_loaded().await.unwrap();
    assert!(engine.is_signed_in());
    assert_eq!(store.value_at("/users/u7/a"), json!(1));
}

#[tokio::test(start_paused = true)]
async fn auth_timeout_fails_gated_operations() {
    let store = Arc::new(MemoryStore::new());
    let engine = SyncEngine::new(
        store.clone(),
        SyncEngineConfig {
            auth_timeout_ms: Some(500),
            ..Default::default()
        },
    );
    let opts = SyncOptions {
        require_auth: true,
        ..SyncOptions::at("/users/{uid}/")
    };

    let err = engine.save(&opts, "/a", json!(1)).await.unwrap_err();
    assert_eq!(err, SyncError::AuthTimeout(Duration::from_millis(500)));

    let handle = engine.listen(Arc::new(MemoryTree::new()), opts, None).unwrap();
    let err = handle.wait_loaded().await.unwrap_err();
    assert_eq!(err, SyncError::AuthTimeout(Duration::from_millis(500)));
    assert_eq!(handle.state(), ListenState::Unsubscribed);
}
