//! Tree node document.
//!
//! # Responsibility
//! - Carry identity, parent pointer, materialized path and opaque fields.
//! - Track unsaved, parent-modified and changed-field state for the save hook.
//!
//! # Invariants
//! - `id` never changes after construction.
//! - `path` is only written by the tree engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// Opaque domain fields of a node.
pub type Fields = Map<String, Value>;

/// Node identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ChangeState {
    is_new: bool,
    parent_modified: bool,
    path_assigned: bool,
    dirty_fields: BTreeSet<String>,
}

/// One document participating in a hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    #[serde(default)]
    parent: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default)]
    fields: Fields,
    #[serde(skip)]
    state: ChangeState,
}

impl Node {
    /// Creates an unsaved node with the given id.
    pub fn with_id(id: impl Into<NodeId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            parent: None,
            path: None,
            fields,
            state: ChangeState {
                is_new: true,
                ..ChangeState::default()
            },
        }
    }

    /// Rebuilds a node as read from a store.
    pub fn persisted(
        id: NodeId,
        parent: Option<NodeId>,
        path: Option<String>,
        fields: Fields,
    ) -> Self {
        Self {
            id,
            parent,
            path,
            fields,
            state: ChangeState::default(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Whether this node has never been saved.
    pub fn is_new(&self) -> bool {
        self.state.is_new
    }

    /// Whether `parent` changed since the last save.
    pub fn is_parent_modified(&self) -> bool {
        self.state.parent_modified
    }

    /// Points this node at another parent; takes effect on the next save.
    pub fn set_parent(&mut self, parent: Option<NodeId>) {
        if self.parent != parent {
            self.parent = parent;
            self.state.parent_modified = true;
        }
    }

    /// Builder form of [`Self::set_parent`].
    pub fn child_of(mut self, parent: &Node) -> Self {
        self.set_parent(Some(parent.id.clone()));
        self
    }

    /// Domain fields as loaded or set; may be a projection of the stored ones.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets one field; only changed fields are written by the next save.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        self.state.dirty_fields.insert(field.clone());
        self.fields.insert(field, value.into());
    }

    /// Drops one field; the next save removes it from the store as well.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.state.dirty_fields.insert(field.to_string());
        self.fields.remove(field)
    }

    /// Names of fields changed since the last save.
    pub fn changed_fields(&self) -> impl Iterator<Item = &str> {
        self.state.dirty_fields.iter().map(String::as_str)
    }

    /// Whether `parent` and `path` must be written by the next save.
    pub(crate) fn is_relocated(&self) -> bool {
        self.state.is_new || self.state.parent_modified || self.state.path_assigned
    }

    pub(crate) fn assign_path(&mut self, path: String) {
        self.path = Some(path);
        self.state.path_assigned = true;
    }

    /// Applies fields written by the store without marking them changed.
    pub(crate) fn absorb_fields(&mut self, fields: &Fields) {
        for (key, value) in fields {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    pub(crate) fn mark_saved(&mut self) {
        self.state = ChangeState::default();
    }
}
