//! Document store contract consumed by the tree engine.
//!
//! # Responsibility
//! - Name the store capabilities the engine relies on: point lookups,
//!   prefix queries, atomic upsert, bulk removal, point updates and
//!   incremental streaming.
//! - Keep backend details (SQL, connections) behind one async trait.
//!
//! # Invariants
//! - `find_one_and_upsert` is a single atomic step: concurrent calls with the
//!   same selector create at most one node.
//! - `stream` yields matches incrementally and never buffers the full result.

use crate::db::DbError;
use crate::model::node::{Node, NodeId};
use crate::model::selector::{Body, Filter, FindOptions, NodeUpdate, Selector, UpsertMode};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod sqlite_store;

pub use sqlite_store::SqliteNodeStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Incremental sequence of matched nodes.
pub type NodeStream = BoxStream<'static, StoreResult<Node>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    /// Connection schema is not at the expected migrated version.
    #[error("node store requires schema version {expected_version}, got {actual_version}")]
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    #[error("node store requires table `{0}`")]
    MissingRequiredTable(&'static str),
    #[error("node store requires column `{column}` in table `{table}`")]
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    /// Persisted data cannot be converted to a valid node.
    #[error("invalid persisted node data: {0}")]
    InvalidData(String),
    #[error("store connection lock poisoned")]
    Poisoned,
    #[error("store task failed: {0}")]
    Task(String),
    /// Failure reported by a non-SQLite backend.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Result of an atomic find-or-insert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub node: Node,
    /// `false` when this call inserted the node.
    pub updated_existing: bool,
}

/// Store capabilities required by the tree engine.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Loads the first node matching `filter`.
    async fn find_one(&self, filter: &Filter) -> StoreResult<Option<Node>>;

    /// Loads every node matching `filter`.
    async fn find(&self, filter: &Filter, options: &FindOptions) -> StoreResult<Vec<Node>>;

    /// Opens an incremental cursor over `filter` matches.
    fn stream(&self, filter: Filter) -> NodeStream;

    /// Finds the first `selector` match or inserts one, in a single atomic step.
    ///
    /// Inserted nodes get a store-assigned id (unless the selector names one),
    /// the selector's parent and equality fields, and `body`. On a match,
    /// `UpsertMode::Set` merges `body` into the existing fields.
    async fn find_one_and_upsert(
        &self,
        selector: &Selector,
        body: &Body,
        mode: UpsertMode,
    ) -> StoreResult<UpsertOutcome>;

    /// Persists a node that does not exist yet.
    async fn insert(&self, node: &Node) -> StoreResult<()>;

    /// Applies `update` to one node; returns whether it existed.
    async fn update_by_id(&self, id: &NodeId, update: &NodeUpdate) -> StoreResult<bool>;

    /// Removes every node matching `filter`; returns the removed count.
    async fn remove(&self, filter: &Filter) -> StoreResult<u64>;
}
