//! Error taxonomy of tree operations.
//!
//! # Responsibility
//! - Classify failures as invalid input, missing dependency, failed cascade,
//!   or store transport.
//! - Keep the underlying store error attached as `source`.
//!
//! # Invariants
//! - Store errors are never swallowed or rewritten, only wrapped.
//! - Nothing here is retried internally; retry policy belongs to callers.

use crate::model::node::{Node, NodeId};
use crate::service::cascade::CascadeError;
use crate::store::StoreError;
use thiserror::Error;

/// Coarse category of a [`TreeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; surfaced before any store access.
    InvalidArgument,
    /// A related document could not be fetched or is unusable.
    Dependency,
    /// A bulk rewrite stopped midway; partial results may have landed.
    Cascade,
    /// Store transport failure outside the categories above.
    Store,
}

/// Errors from tree engine operations.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("invalid document body: {0}")]
    InvalidBody(String),
    #[error("invalid child batch: {0}")]
    InvalidBatch(String),
    #[error("invalid tree config: {0}")]
    InvalidConfig(String),
    #[error("invalid node id `{id}`: {reason}")]
    InvalidNodeId { id: String, reason: String },
    /// Prefix tests need both operands to carry a path.
    #[error("node {0} has no path")]
    MissingPath(NodeId),
    #[error("moving node {node} under {parent} would create a cycle")]
    CycleDetected { node: NodeId, parent: NodeId },
    #[error("parent {parent} of node {node} not found")]
    ParentNotFound { node: NodeId, parent: NodeId },
    #[error("parent {parent} of node {node} has no path")]
    ParentWithoutPath { node: NodeId, parent: NodeId },
    #[error("root of node {0} cannot be resolved")]
    RootNotFound(NodeId),
    /// The node disappeared from the store before its save was committed.
    #[error("node {0} no longer exists")]
    NodeNotFound(NodeId),
    #[error("failed to load {what} of node {node}: {source}")]
    Dependency {
        node: NodeId,
        what: &'static str,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Cascade(#[from] CascadeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TreeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSelector(_)
            | Self::InvalidBody(_)
            | Self::InvalidBatch(_)
            | Self::InvalidConfig(_)
            | Self::InvalidNodeId { .. }
            | Self::MissingPath(_)
            | Self::CycleDetected { .. } => ErrorKind::InvalidArgument,
            Self::ParentNotFound { .. }
            | Self::ParentWithoutPath { .. }
            | Self::RootNotFound(_)
            | Self::NodeNotFound(_)
            | Self::Dependency { .. } => ErrorKind::Dependency,
            Self::Cascade(_) => ErrorKind::Cascade,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Partial result of a batch child creation.
///
/// `created` lists every child persisted before `source` occurred.
#[derive(Debug, Error)]
#[error("child batch stopped after {} created item(s): {source}", created.len())]
pub struct AddChildrenError {
    pub created: Vec<Node>,
    #[source]
    pub source: TreeError,
}

pub type TreeResult<T> = Result<T, TreeError>;
