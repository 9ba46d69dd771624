//! Materialized-path trees over a document store.
//! Every node stores the ids of its ancestors in `path`, so subtree and
//! ancestry queries become prefix lookups.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod service;
pub mod store;

pub use config::{DeleteMode, IdFormat, TreeConfig};
pub use db::{open_db, open_db_in_memory, DbError};
pub use error::{AddChildrenError, ErrorKind, TreeError, TreeResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::node::{Fields, Node, NodeId};
pub use model::path::PathModel;
pub use model::selector::{
    Body, Filter, FindOptions, NodeUpdate, Selector, SortField, SortKey, UpsertMode,
};
pub use service::cascade::{CascadeError, CascadeExecutor, CascadeReport};
pub use service::children_tree::{ChildrenTreeQuery, TreeNode};
pub use service::tree_service::{AddMode, AncestorQuery, ChildSpec, ChildrenQuery, TreeService};
pub use service::upsert::{FindOrCreate, FindOrCreateOutcome, UpsertOptions};
pub use store::{NodeStore, NodeStream, SqliteNodeStore, StoreError, StoreResult, UpsertOutcome};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
