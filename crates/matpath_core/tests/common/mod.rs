#![allow(dead_code)]

use async_trait::async_trait;
use matpath_core::{
    open_db_in_memory, Body, DeleteMode, Fields, Filter, FindOptions, Node, NodeId, NodeStore,
    NodeStream, NodeUpdate, Selector, SqliteNodeStore, StoreError, StoreResult, TreeConfig,
    TreeService, UpsertMode, UpsertOutcome,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub fn store() -> SqliteNodeStore {
    SqliteNodeStore::try_new(open_db_in_memory().unwrap()).unwrap()
}

pub fn service(mode: DeleteMode) -> TreeService<SqliteNodeStore> {
    TreeService::new(store(), TreeConfig::default().with_delete_mode(mode)).unwrap()
}

pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

pub async fn save_root<S: NodeStore>(service: &TreeService<S>, id: &str) -> Node {
    let mut node = Node::with_id(id, Fields::new());
    service.save(&mut node).await.unwrap();
    node
}

pub async fn save_child<S: NodeStore>(service: &TreeService<S>, parent: &Node, id: &str) -> Node {
    let mut node = Node::with_id(id, Fields::new()).child_of(parent);
    service.save(&mut node).await.unwrap();
    node
}

pub async fn reload<S: NodeStore>(service: &TreeService<S>, id: &str) -> Node {
    service
        .find_by_id(&NodeId::from(id))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("node {id} should exist"))
}

pub async fn path_of<S: NodeStore>(service: &TreeService<S>, id: &str) -> String {
    reload(service, id).await.path().unwrap().to_string()
}

pub async fn all_paths<S: NodeStore>(service: &TreeService<S>) -> Vec<String> {
    let nodes = service
        .store()
        .find(&Filter::All, &FindOptions::default())
        .await
        .unwrap();
    let mut paths: Vec<String> = nodes
        .iter()
        .map(|node| node.path().unwrap_or_default().to_string())
        .collect();
    paths.sort();
    paths
}

pub fn sorted_ids(nodes: &[Node]) -> Vec<String> {
    let mut ids: Vec<String> = nodes.iter().map(|node| node.id().to_string()).collect();
    ids.sort();
    ids
}

/// Records the highest number of concurrent `update_by_id` calls.
pub struct CountingStore<S> {
    inner: S,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl<S> CountingStore<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: NodeStore> NodeStore for CountingStore<S> {
    async fn find_one(&self, filter: &Filter) -> StoreResult<Option<Node>> {
        self.inner.find_one(filter).await
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> StoreResult<Vec<Node>> {
        self.inner.find(filter, options).await
    }

    fn stream(&self, filter: Filter) -> NodeStream {
        self.inner.stream(filter)
    }

    async fn find_one_and_upsert(
        &self,
        selector: &Selector,
        body: &Body,
        mode: UpsertMode,
    ) -> StoreResult<UpsertOutcome> {
        self.inner.find_one_and_upsert(selector, body, mode).await
    }

    async fn insert(&self, node: &Node) -> StoreResult<()> {
        self.inner.insert(node).await
    }

    async fn update_by_id(&self, id: &NodeId, update: &NodeUpdate) -> StoreResult<bool> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.update_by_id(id, update).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn remove(&self, filter: &Filter) -> StoreResult<u64> {
        self.inner.remove(filter).await
    }
}

/// Injects failures into lookups and updates of an inner store.
pub struct FailingStore<S> {
    inner: S,
    fail_lookups: AtomicBool,
    updates_left: AtomicUsize,
}

impl<S> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_lookups: AtomicBool::new(false),
            updates_left: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn fail_lookups(&self, enabled: bool) {
        self.fail_lookups.store(enabled, Ordering::SeqCst);
    }

    /// Lets `count` more updates through, then fails every update.
    pub fn allow_updates(&self, count: usize) {
        self.updates_left.store(count, Ordering::SeqCst);
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Backend(format!("injected {what} failure"))
    }
}

#[async_trait]
impl<S: NodeStore> NodeStore for FailingStore<S> {
    async fn find_one(&self, filter: &Filter) -> StoreResult<Option<Node>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Self::injected("lookup"));
        }
        self.inner.find_one(filter).await
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> StoreResult<Vec<Node>> {
        self.inner.find(filter, options).await
    }

    fn stream(&self, filter: Filter) -> NodeStream {
        self.inner.stream(filter)
    }

    async fn find_one_and_upsert(
        &self,
        selector: &Selector,
        body: &Body,
        mode: UpsertMode,
    ) -> StoreResult<UpsertOutcome> {
        self.inner.find_one_and_upsert(selector, body, mode).await
    }

    async fn insert(&self, node: &Node) -> StoreResult<()> {
        self.inner.insert(node).await
    }

    async fn update_by_id(&self, id: &NodeId, update: &NodeUpdate) -> StoreResult<bool> {
        let granted = self
            .updates_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !granted {
            return Err(Self::injected("update"));
        }
        self.inner.update_by_id(id, update).await
    }

    async fn remove(&self, filter: &Filter) -> StoreResult<u64> {
        self.inner.remove(filter).await
    }
}
