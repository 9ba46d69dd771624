//! Tree use-case services.
//!
//! # Responsibility
//! - Orchestrate store calls into hierarchy-level operations.
//! - Keep path arithmetic and cascade scheduling out of store backends.

pub mod cascade;
pub mod children_tree;
pub mod tree_service;
pub mod upsert;
