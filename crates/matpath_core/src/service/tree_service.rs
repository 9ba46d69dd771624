//! Materialized-path tree use-case service.
//!
//! # Responsibility
//! - Maintain `path` on save and rewrite descendant paths after a move.
//! - Apply the configured delete policy to descendants.
//! - Answer hierarchy queries and create children atomically.
//!
//! # Invariants
//! - A root node's path equals its id; a child's path is
//!   `parent.path + separator + id`.
//! - Node ids never contain the configured separator.
//! - A node is never moved under itself or one of its descendants.
//! - A failed descendant cascade aborts the pending save or delete.

use crate::config::{DeleteMode, TreeConfig};
use crate::error::{AddChildrenError, TreeError, TreeResult};
use crate::model::node::{Fields, Node, NodeId};
use crate::model::path::PathModel;
use crate::model::selector::{Body, Filter, FindOptions, NodeUpdate, Selector, SortField, SortKey};
use crate::service::cascade::{CascadeExecutor, CascadeReport};
use crate::service::children_tree::{nest_by_level, sort_siblings, ChildrenTreeQuery, TreeNode};
use crate::service::upsert::{FindOrCreate, FindOrCreateOutcome, UpsertOptions};
use crate::store::NodeStore;
use log::{debug, error, info};
use serde_json::Value;
use std::time::Instant;

const DEFAULT_NESTED_SEPARATOR: &str = ".";

/// Query of [`TreeService::get_children`] and [`TreeService::get_leaves`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildrenQuery {
    pub filters: Option<Selector>,
    pub fields: Option<Vec<String>>,
    pub sort: Vec<SortKey>,
    /// Include every descendant instead of direct children only.
    pub recursive: bool,
}

impl ChildrenQuery {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Self::default()
        }
    }

    fn find_options(&self) -> FindOptions {
        FindOptions {
            sort: self.sort.clone(),
            fields: self.fields.clone(),
            limit: None,
        }
    }
}

/// Query of [`TreeService::get_ancestors`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AncestorQuery {
    pub filters: Option<Selector>,
    pub fields: Option<Vec<String>>,
    pub sort: Vec<SortKey>,
}

/// How a child batch links its items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddMode {
    /// Every item becomes a child of the batch parent.
    #[default]
    Normal,
    /// Each item becomes a child of the previously created one.
    Nested,
}

impl From<&str> for AddMode {
    /// `"nest"` and `"nested"` (any case) select [`AddMode::Nested`].
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "nest" | "nested" => Self::Nested,
            _ => Self::Normal,
        }
    }
}

/// One item of a child batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildSpec {
    pub selector: Selector,
    pub body: Body,
    /// Overrides the batch options for this item.
    pub options: Option<UpsertOptions>,
}

impl ChildSpec {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn options(mut self, options: UpsertOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Parses either a bare selector object or a
    /// `[selector, body?, options?]` array.
    ///
    /// # Errors
    /// - `InvalidBatch` for any other shape.
    pub fn from_json(value: Value) -> TreeResult<Self> {
        match value {
            Value::Object(_) => Ok(Self::new(Selector::from_json(value)?)),
            Value::Array(items) => {
                let mut items = items.into_iter();
                let selector = match items.next() {
                    Some(selector @ Value::Object(_)) => Selector::from_json(selector)?,
                    _ => {
                        return Err(TreeError::InvalidBatch(
                            "array item must start with a selector object".to_string(),
                        ))
                    }
                };
                let body = match items.next() {
                    None | Some(Value::Null) => Body::default(),
                    Some(body @ Value::Object(_)) => Body::from_json(body)?,
                    Some(_) => {
                        return Err(TreeError::InvalidBatch(
                            "item body must be an object or null".to_string(),
                        ))
                    }
                };
                let options = match items.next() {
                    Some(options @ Value::Object(_)) => {
                        Some(serde_json::from_value(options).map_err(|err| {
                            TreeError::InvalidBatch(format!("invalid item options: {err}"))
                        })?)
                    }
                    _ => None,
                };
                Ok(Self {
                    selector,
                    body,
                    options,
                })
            }
            other => Err(TreeError::InvalidBatch(format!(
                "expected an object or array item, got {}",
                crate::model::selector::json_kind(&other)
            ))),
        }
    }

    /// Parses a JSON array of items.
    pub fn list_from_json(value: Value) -> TreeResult<Vec<Self>> {
        match value {
            Value::Array(items) => items.into_iter().map(Self::from_json).collect(),
            _ => Err(TreeError::InvalidBatch(
                "child batch must be an array".to_string(),
            )),
        }
    }
}

/// Tree engine bound to one store.
pub struct TreeService<S: NodeStore> {
    store: S,
    config: TreeConfig,
    paths: PathModel,
    cascade: CascadeExecutor,
}

impl<S: NodeStore> TreeService<S> {
    /// # Errors
    /// - `InvalidConfig` when `config` fails validation.
    pub fn new(store: S, config: TreeConfig) -> TreeResult<Self> {
        config.validate()?;
        Ok(Self {
            paths: PathModel::new(config.path_separator),
            cascade: CascadeExecutor::new(config.concurrency)?,
            store,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathModel {
        &self.paths
    }

    /// Creates an unsaved node with a fresh id.
    pub fn new_node(&self, fields: Fields) -> Node {
        Node::with_id(self.config.id_format.generate(), fields)
    }

    pub async fn find_by_id(&self, id: &NodeId) -> TreeResult<Option<Node>> {
        Ok(self.store.find_one(&Filter::Id(id.clone())).await?)
    }

    /// Persists `node`, recomputing its path when it is new or re-parented.
    ///
    /// A moved node first rewrites the paths of its whole subtree.
    ///
    /// # Errors
    /// - `InvalidNodeId` or `CycleDetected` before any store access.
    /// - `ParentNotFound`, `ParentWithoutPath` or `Dependency` for an unusable
    ///   parent.
    /// - `Cascade` when the subtree rewrite fails; `node` is left unsaved.
    pub async fn save(&self, node: &mut Node) -> TreeResult<()> {
        let started_at = Instant::now();
        match self.save_inner(node).await {
            Ok(report) => {
                debug!(
                    "event=tree_save module=tree status=ok id={} moved={} cascaded={} duration_ms={}",
                    node.id(),
                    report.is_some(),
                    report.map_or(0, |report| report.updated),
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=tree_save module=tree status=error id={} duration_ms={} error={err}",
                    node.id(),
                    started_at.elapsed().as_millis()
                );
                Err(err)
            }
        }
    }

    async fn save_inner(&self, node: &mut Node) -> TreeResult<Option<CascadeReport>> {
        self.ensure_id(node.id())?;
        let mut report = None;

        if node.is_new() || node.is_parent_modified() {
            let new_path = match node.parent().cloned() {
                None => self.paths.root_path(node.id().as_str()),
                Some(parent_id) => {
                    let parent = self.load_parent(node.id(), &parent_id).await?;
                    let parent_path =
                        parent.path().ok_or_else(|| TreeError::ParentWithoutPath {
                            node: node.id().clone(),
                            parent: parent_id.clone(),
                        })?;
                    self.ensure_acyclic(node.id(), &parent_id, parent_path)?;
                    self.paths.child_path(parent_path, node.id().as_str())
                }
            };

            if !node.is_new() {
                let stored = self.load_stored(node.id()).await?;
                if let Some(previous) = stored.path().filter(|previous| *previous != new_path) {
                    report = Some(self.rewrite_subtree(previous, &new_path).await?);
                }
            }
            node.assign_path(new_path);
        }

        self.commit(node).await?;
        node.mark_saved();
        Ok(report)
    }

    /// The stored copy of a node; its path may be newer than the caller's.
    async fn load_stored(&self, id: &NodeId) -> TreeResult<Node> {
        let options = FindOptions {
            fields: Some(Vec::new()),
            limit: Some(1),
            ..FindOptions::default()
        };
        self.store
            .find(&Filter::Id(id.clone()), &options)
            .await
            .map_err(|source| TreeError::Dependency {
                node: id.clone(),
                what: "node",
                source,
            })?
            .into_iter()
            .next()
            .ok_or_else(|| TreeError::NodeNotFound(id.clone()))
    }

    async fn load_parent(&self, node: &NodeId, parent: &NodeId) -> TreeResult<Node> {
        self.store
            .find_one(&Filter::Id(parent.clone()))
            .await
            .map_err(|source| TreeError::Dependency {
                node: node.clone(),
                what: "parent",
                source,
            })?
            .ok_or_else(|| TreeError::ParentNotFound {
                node: node.clone(),
                parent: parent.clone(),
            })
    }

    fn ensure_acyclic(&self, node: &NodeId, parent: &NodeId, parent_path: &str) -> TreeResult<()> {
        let separator = self.paths.separator();
        if node == parent
            || parent_path
                .split(separator)
                .any(|segment| segment == node.as_str())
        {
            return Err(TreeError::CycleDetected {
                node: node.clone(),
                parent: parent.clone(),
            });
        }
        Ok(())
    }

    async fn rewrite_subtree(&self, previous: &str, replacement: &str) -> TreeResult<CascadeReport> {
        let paths = self.paths;
        let filter = Filter::PathPrefix(paths.descendant_prefix(previous));
        let report = self
            .cascade
            .run(&self.store, "rewrite_subtree", filter, |descendant| {
                descendant
                    .path()
                    .and_then(|path| paths.splice_prefix(path, previous, replacement))
                    .map(NodeUpdate::set_path)
            })
            .await?;
        Ok(report)
    }

    async fn commit(&self, node: &Node) -> TreeResult<()> {
        if node.is_new() {
            self.store.insert(node).await?;
            return Ok(());
        }
        let mut update = NodeUpdate::default();
        if node.is_relocated() {
            update.parent = Some(node.parent().cloned());
            update.path = Some(node.path().map(str::to_string));
        }
        for field in node.changed_fields() {
            match node.get(field) {
                Some(value) => {
                    update.set_fields.insert(field.to_string(), value.clone());
                }
                None => update.unset_fields.push(field.to_string()),
            }
        }
        if !self.store.update_by_id(node.id(), &update).await? {
            return Err(TreeError::NodeNotFound(node.id().clone()));
        }
        Ok(())
    }

    /// Removes `node` and applies the delete policy to its descendants.
    ///
    /// Returns the number of removed nodes.
    ///
    /// # Errors
    /// - `Cascade` when re-parenting fails; `node` itself is kept then.
    pub async fn remove(&self, node: &Node) -> TreeResult<u64> {
        let started_at = Instant::now();
        info!(
            "event=tree_delete module=tree status=start id={} mode={:?}",
            node.id(),
            self.config.on_delete
        );
        let result = self.remove_inner(node).await;
        match &result {
            Ok(removed) => info!(
                "event=tree_delete module=tree status=ok id={} removed={removed} duration_ms={}",
                node.id(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=tree_delete module=tree status=error id={} duration_ms={} error={err}",
                node.id(),
                started_at.elapsed().as_millis()
            ),
        }
        result
    }

    async fn remove_inner(&self, node: &Node) -> TreeResult<u64> {
        let self_filter = Filter::Id(node.id().clone());
        let Some(path) = node.path() else {
            return Ok(self.store.remove(&self_filter).await?);
        };

        match self.config.on_delete {
            DeleteMode::Delete => {
                let subtree = Filter::Or(vec![
                    self_filter,
                    Filter::PathPrefix(self.paths.descendant_prefix(path)),
                ]);
                Ok(self.store.remove(&subtree).await?)
            }
            DeleteMode::Reparent => {
                let new_parent = node.parent().cloned();
                self.cascade
                    .run(
                        &self.store,
                        "reparent_children",
                        Filter::Parent(Some(node.id().clone())),
                        |_| Some(NodeUpdate::set_parent(new_parent.clone())),
                    )
                    .await?;

                let paths = self.paths;
                let id = node.id().as_str();
                self.cascade
                    .run(
                        &self.store,
                        "splice_paths",
                        Filter::PathSegment {
                            id: node.id().clone(),
                            separator: paths.separator(),
                        },
                        |descendant| {
                            descendant
                                .path()
                                .and_then(|path| paths.remove_segment(path, id))
                                .map(NodeUpdate::set_path)
                        },
                    )
                    .await?;

                Ok(self.store.remove(&self_filter).await?)
            }
        }
    }

    /// Finds the first selector match or creates it, atomically.
    pub async fn find_or_create(&self, request: &FindOrCreate) -> TreeResult<FindOrCreateOutcome> {
        if let Some(id) = &request.selector.id {
            self.ensure_id(id)?;
        }
        request.execute(&self.store).await
    }

    /// Direct children, or every descendant when `query.recursive` is set.
    pub async fn get_children(&self, node: &Node, query: &ChildrenQuery) -> TreeResult<Vec<Node>> {
        let mut selector = query.filters.clone().unwrap_or_default();
        let structural = if query.recursive {
            let path = self.require_path(node)?;
            Filter::PathPrefix(self.paths.descendant_prefix(path))
        } else {
            selector.parent = Some(Some(node.id().clone()));
            Filter::All
        };
        selector.validate()?;
        let filter = selector.to_filter().and(structural);
        Ok(self.store.find(&filter, &query.find_options()).await?)
    }

    /// Descendants with no other matched descendant under their path.
    pub async fn get_leaves(&self, node: &Node, query: &ChildrenQuery) -> TreeResult<Vec<Node>> {
        let query = ChildrenQuery {
            recursive: true,
            ..query.clone()
        };
        let descendants = self.get_children(node, &query).await?;
        let leaves = descendants
            .iter()
            .filter(|candidate| {
                let Some(candidate_path) = candidate.path() else {
                    return true;
                };
                !descendants.iter().any(|other| {
                    other
                        .path()
                        .is_some_and(|path| self.paths.is_descendant_prefix(path, candidate_path))
                })
            })
            .cloned()
            .collect();
        Ok(leaves)
    }

    /// The node named by `node.parent`, if any.
    pub async fn get_parent(&self, node: &Node) -> TreeResult<Option<Node>> {
        let Some(parent) = node.parent() else {
            return Ok(None);
        };
        self.store
            .find_one(&Filter::Id(parent.clone()))
            .await
            .map_err(|source| TreeError::Dependency {
                node: node.id().clone(),
                what: "parent",
                source,
            })
    }

    /// Nodes named by the path segments before this node's own id.
    pub async fn get_ancestors(&self, node: &Node, query: &AncestorQuery) -> TreeResult<Vec<Node>> {
        let ids: Vec<NodeId> = node
            .path()
            .map(|path| {
                self.paths
                    .ancestor_ids(path)
                    .into_iter()
                    .map(NodeId::from)
                    .collect()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let selector = query.filters.clone().unwrap_or_default();
        selector.validate()?;
        let filter = selector.to_filter().and(Filter::IdIn(ids));
        let options = FindOptions {
            sort: query.sort.clone(),
            fields: query.fields.clone(),
            limit: None,
        };
        Ok(self.store.find(&filter, &options).await?)
    }

    /// The node named by the first path segment; `node` itself for a root.
    ///
    /// # Errors
    /// - `RootNotFound` when a child has no path or its root is gone.
    pub async fn get_root(&self, node: &Node) -> TreeResult<Node> {
        if node.parent().is_none() {
            return Ok(node.clone());
        }
        let root_id = node
            .path()
            .and_then(|path| self.paths.root_id(path))
            .ok_or_else(|| TreeError::RootNotFound(node.id().clone()))?;
        if root_id == node.id().as_str() {
            return Ok(node.clone());
        }
        self.store
            .find_one(&Filter::Id(NodeId::from(root_id)))
            .await
            .map_err(|source| TreeError::Dependency {
                node: node.id().clone(),
                what: "root",
                source,
            })?
            .ok_or_else(|| TreeError::RootNotFound(node.id().clone()))
    }

    /// Depth of `node`: 1 for a root, 0 before its first save.
    pub fn level(&self, node: &Node) -> usize {
        self.paths.depth(node.path())
    }

    /// Joins `field` over the ancestors and `node` itself, root first.
    ///
    /// Missing values render as `-` when the separator is `#`, as `#`
    /// otherwise. `separator` defaults to `.`.
    pub async fn get_nested_field(
        &self,
        node: &Node,
        field: &str,
        separator: Option<&str>,
    ) -> TreeResult<String> {
        let separator = separator.unwrap_or(DEFAULT_NESTED_SEPARATOR);
        let placeholder = if separator == "#" { "-" } else { "#" };
        let query = AncestorQuery {
            filters: None,
            fields: Some(vec![field.to_string()]),
            sort: vec![SortKey::asc(SortField::Path)],
        };
        let ancestors = self.get_ancestors(node, &query).await?;
        let parts: Vec<String> = ancestors
            .iter()
            .chain(std::iter::once(node))
            .map(|entry| render_value(entry.get(field), placeholder))
            .collect();
        Ok(parts.join(separator))
    }

    /// Whether `node` is a strict ancestor of `other`.
    pub fn is_parent_of(&self, node: &Node, other: &Node) -> TreeResult<bool> {
        let ancestor = self.require_path(node)?;
        let descendant = self.require_path(other)?;
        Ok(self.paths.is_descendant_prefix(descendant, ancestor))
    }

    /// Whether `node` is a strict descendant of `other`.
    pub fn is_child_of(&self, node: &Node, other: &Node) -> TreeResult<bool> {
        self.is_parent_of(other, node)
    }

    pub async fn has_child(&self, node: &Node) -> TreeResult<bool> {
        let child = self
            .store
            .find_one(&Filter::Parent(Some(node.id().clone())))
            .await?;
        Ok(child.is_some())
    }

    /// Finds or creates one child of `parent` and stores its path.
    ///
    /// # Errors
    /// - `MissingPath` when `parent` has never been saved.
    pub async fn add_child(&self, parent: &Node, child: &ChildSpec) -> TreeResult<Node> {
        self.create_under(Some(parent), child, UpsertOptions::default())
            .await
    }

    /// Creates `items` in order under `parent` (roots when `None`).
    ///
    /// # Errors
    /// - `AddChildrenError` carrying every child created before the failure.
    pub async fn add_children(
        &self,
        items: &[ChildSpec],
        parent: Option<&Node>,
        options: UpsertOptions,
        mode: AddMode,
    ) -> Result<Vec<Node>, AddChildrenError> {
        let mut created = Vec::with_capacity(items.len());
        let mut current_parent = parent.cloned();
        for item in items {
            let result = self
                .create_under(current_parent.as_ref(), item, options)
                .await;
            match result {
                Ok(child) => {
                    if mode == AddMode::Nested {
                        current_parent = Some(child.clone());
                    }
                    created.push(child);
                }
                Err(source) => return Err(AddChildrenError { created, source }),
            }
        }
        Ok(created)
    }

    async fn create_under(
        &self,
        parent: Option<&Node>,
        item: &ChildSpec,
        options: UpsertOptions,
    ) -> TreeResult<Node> {
        let parent_path = match parent {
            Some(parent) => Some(self.require_path(parent)?),
            None => None,
        };
        let mut selector = item.selector.clone();
        selector.parent = Some(parent.map(|parent| parent.id().clone()));
        let request = FindOrCreate::new(selector)
            .body(item.body.clone())
            .options(item.options.unwrap_or(options));

        let mut child = self.find_or_create(&request).await?.doc;
        self.ensure_id(child.id())?;
        let path = match parent_path {
            Some(parent_path) => self.paths.child_path(parent_path, child.id().as_str()),
            None => self.paths.root_path(child.id().as_str()),
        };
        child.assign_path(path);
        self.save(&mut child).await?;
        Ok(child)
    }

    /// Renders the subtree under `root` (every hierarchy when `None`) as
    /// nested nodes.
    pub async fn get_children_tree(
        &self,
        root: Option<&Node>,
        query: &ChildrenTreeQuery,
    ) -> TreeResult<Vec<TreeNode>> {
        let mut selector = query.filters.clone().unwrap_or_default();
        let structural = if query.recursive {
            if selector.parent == Some(None) {
                selector.parent = None;
            }
            match root {
                Some(root) => {
                    Filter::PathPrefix(self.paths.descendant_prefix(self.require_path(root)?))
                }
                None => Filter::All,
            }
        } else {
            selector.parent = Some(root.map(|root| root.id().clone()));
            Filter::All
        };
        selector.validate()?;

        let options = FindOptions {
            sort: vec![SortKey::asc(SortField::Path)],
            fields: query.fields.clone(),
            limit: None,
        };
        let nodes = self
            .store
            .find(&selector.to_filter().and(structural), &options)
            .await?;

        let root_level = root.map_or(1, |root| self.level(root) + 1);
        let min_level = query.min_level.max(root_level);
        let mut tree = nest_by_level(nodes, &self.paths, min_level, query.allow_empty_children);
        sort_siblings(&mut tree, &query.sort);
        Ok(tree)
    }

    fn require_path<'a>(&self, node: &'a Node) -> TreeResult<&'a str> {
        node.path()
            .ok_or_else(|| TreeError::MissingPath(node.id().clone()))
    }

    fn ensure_id(&self, id: &NodeId) -> TreeResult<()> {
        if id.as_str().is_empty() {
            return Err(TreeError::InvalidNodeId {
                id: String::new(),
                reason: "id must not be empty".to_string(),
            });
        }
        if self.paths.contains_separator(id.as_str()) {
            return Err(TreeError::InvalidNodeId {
                id: id.to_string(),
                reason: format!(
                    "id must not contain the path separator `{}`",
                    self.paths.separator()
                ),
            });
        }
        Ok(())
    }
}

fn render_value(value: Option<&Value>, placeholder: &str) -> String {
    match value {
        None | Some(Value::Null) => placeholder.to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{render_value, AddMode, ChildSpec};
    use crate::error::TreeError;
    use crate::model::node::NodeId;
    use serde_json::json;

    #[test]
    fn add_mode_parses_nested_aliases() {
        assert_eq!(AddMode::from("nest"), AddMode::Nested);
        assert_eq!(AddMode::from(" Nested "), AddMode::Nested);
        assert_eq!(AddMode::from("flat"), AddMode::Normal);
    }

    #[test]
    fn child_spec_accepts_both_item_shapes() {
        let bare = ChildSpec::from_json(json!({"name": "a"})).expect("bare selector");
        assert_eq!(bare.selector.fields.get("name"), Some(&json!("a")));
        assert!(bare.options.is_none());

        let full = ChildSpec::from_json(json!([{"id": "a"}, {"title": "A"}, {"upsert": true}]))
            .expect("array item");
        assert_eq!(full.selector.id, Some(NodeId::from("a")));
        assert_eq!(full.body.fields().get("title"), Some(&json!("A")));
        assert_eq!(full.options.map(|options| options.upsert), Some(true));
    }

    #[test]
    fn child_spec_rejects_malformed_items() {
        for value in [json!("a"), json!([]), json!([1]), json!([{"a": 1}, 3])] {
            let err = ChildSpec::from_json(value).expect_err("must be rejected");
            assert!(matches!(err, TreeError::InvalidBatch(_)));
        }
        let err = ChildSpec::list_from_json(json!({"a": 1})).expect_err("not an array");
        assert!(matches!(err, TreeError::InvalidBatch(_)));
    }

    #[test]
    fn missing_values_render_as_placeholder() {
        assert_eq!(render_value(None, "#"), "#");
        assert_eq!(render_value(Some(&json!(null)), "-"), "-");
        assert_eq!(render_value(Some(&json!("a")), "#"), "a");
        assert_eq!(render_value(Some(&json!(3)), "#"), "3");
    }
}
