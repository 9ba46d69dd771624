//! Tree domain model.
//!
//! # Responsibility
//! - Define nodes, path arithmetic and the store-facing query shapes.
//! - Stay free of I/O so invariants can be checked in isolation.
//!
//! # Invariants
//! - Every node is identified by a stable `NodeId`.
//! - Paths are derived, never edited by callers.

pub mod node;
pub mod path;
pub mod selector;
