//! Store-facing query, update and upsert shapes.
//!
//! # Responsibility
//! - Turn caller JSON into typed selectors and bodies.
//! - Describe store-side filters without committing to a backend.
//!
//! # Invariants
//! - `path` is engine-owned: never accepted from selectors or bodies.
//! - Field names are non-empty and contain no `"`.

use crate::error::TreeError;
use crate::model::node::{Fields, NodeId};
use serde_json::Value;

pub const ID_KEY: &str = "id";
pub const PARENT_KEY: &str = "parent";
pub const PATH_KEY: &str = "path";

/// Equality criteria over id, parent and domain fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub id: Option<NodeId>,
    /// `Some(None)` matches root nodes only.
    pub parent: Option<Option<NodeId>>,
    pub fields: Fields,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object of equality criteria.
    ///
    /// # Errors
    /// - `InvalidSelector` when `value` is not an object, or carries a
    ///   malformed `id`/`parent`, a `path` key, or an invalid field name.
    pub fn from_json(value: Value) -> Result<Self, TreeError> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(TreeError::InvalidSelector(format!(
                    "expected an object, got {}",
                    json_kind(&other)
                )))
            }
        };

        let mut selector = Self::default();
        for (key, value) in map {
            match key.as_str() {
                ID_KEY => match value {
                    Value::String(id) => selector.id = Some(NodeId::new(id)),
                    other => {
                        return Err(TreeError::InvalidSelector(format!(
                            "`id` must be a string, got {}",
                            json_kind(&other)
                        )))
                    }
                },
                PARENT_KEY => match value {
                    Value::Null => selector.parent = Some(None),
                    Value::String(id) => selector.parent = Some(Some(NodeId::new(id))),
                    other => {
                        return Err(TreeError::InvalidSelector(format!(
                            "`parent` must be a string or null, got {}",
                            json_kind(&other)
                        )))
                    }
                },
                PATH_KEY => {
                    return Err(TreeError::InvalidSelector(
                        "`path` is managed by the tree engine".to_string(),
                    ))
                }
                _ => {
                    validate_field_name(&key).map_err(TreeError::InvalidSelector)?;
                    selector.fields.insert(key, value);
                }
            }
        }
        Ok(selector)
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: Option<NodeId>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.parent.is_none() && self.fields.is_empty()
    }

    /// Checks field names added through the builder methods.
    pub fn validate(&self) -> Result<(), TreeError> {
        for key in self.fields.keys() {
            if key == ID_KEY || key == PARENT_KEY || key == PATH_KEY {
                return Err(TreeError::InvalidSelector(format!(
                    "`{key}` cannot be used as a field name"
                )));
            }
            validate_field_name(key).map_err(TreeError::InvalidSelector)?;
        }
        Ok(())
    }

    pub fn to_filter(&self) -> Filter {
        let mut clauses = Vec::new();
        if let Some(id) = &self.id {
            clauses.push(Filter::Id(id.clone()));
        }
        if let Some(parent) = &self.parent {
            clauses.push(Filter::Parent(parent.clone()));
        }
        for (name, value) in &self.fields {
            clauses.push(Filter::Field(name.clone(), value.clone()));
        }
        Filter::all_of(clauses)
    }
}

/// Domain fields written by an upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body(Fields);

impl Body {
    pub fn new(fields: Fields) -> Result<Self, TreeError> {
        for key in fields.keys() {
            if key == ID_KEY || key == PARENT_KEY || key == PATH_KEY {
                return Err(TreeError::InvalidBody(format!(
                    "`{key}` cannot be set through a document body"
                )));
            }
            validate_field_name(key).map_err(TreeError::InvalidBody)?;
        }
        Ok(Self(fields))
    }

    pub fn from_json(value: Value) -> Result<Self, TreeError> {
        match value {
            Value::Object(map) => Self::new(map),
            Value::Null => Ok(Self::default()),
            other => Err(TreeError::InvalidBody(format!(
                "expected an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How an upsert treats the body when a match already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpsertMode {
    /// Body is written on insert only.
    #[default]
    SetOnInsert,
    /// Body is written on insert and merged into an existing match.
    Set,
}

/// Store-side predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Id(NodeId),
    IdIn(Vec<NodeId>),
    Parent(Option<NodeId>),
    /// Path starts with the given string, compared case-sensitively.
    PathPrefix(String),
    /// Path contains `id` as a whole segment other than its last one.
    PathSegment { id: NodeId, separator: char },
    Field(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Conjunction that collapses trivial cases.
    pub fn all_of(mut clauses: Vec<Filter>) -> Filter {
        clauses.retain(|clause| *clause != Filter::All);
        match clauses.len() {
            0 => Filter::All,
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        }
    }

    pub fn and(self, other: Filter) -> Filter {
        Filter::all_of(vec![self, other])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortField {
    Id,
    Parent,
    Path,
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }
}

/// Options of a materialized query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<SortKey>,
    /// Domain fields to keep; `None` keeps all. Structural fields are always kept.
    pub fields: Option<Vec<String>>,
    pub limit: Option<usize>,
}

/// Partial update applied to one node by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub parent: Option<Option<NodeId>>,
    pub path: Option<Option<String>>,
    /// Fields merged into the stored ones; keys not named here are left alone.
    pub set_fields: Fields,
    pub unset_fields: Vec<String>,
}

impl NodeUpdate {
    pub fn set_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(Some(path.into())),
            ..Self::default()
        }
    }

    pub fn set_parent(parent: Option<NodeId>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_none()
            && self.path.is_none()
            && self.set_fields.is_empty()
            && self.unset_fields.is_empty()
    }
}

pub(crate) fn validate_field_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("field names must not be blank".to_string());
    }
    if name.contains('"') {
        return Err(format!("field name `{name}` must not contain `\"`"));
    }
    Ok(())
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
