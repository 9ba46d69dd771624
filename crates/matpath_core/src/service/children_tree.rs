//! Nested rendering of a subtree.
//!
//! # Responsibility
//! - Fold a flat node list into nested `children` vectors.
//! - Order siblings by caller sort keys once nesting is done.
//!
//! # Invariants
//! - Nodes are ordered segment by segment before nesting, so every parent
//!   directly precedes its subtree whatever the separator sorts against.
//! - A node attaches under the last element of each intermediate level.
//!   Nodes with no attachment point, or above `min_level`, are dropped.

use crate::model::node::Node;
use crate::model::path::PathModel;
use crate::model::selector::{Selector, SortField, SortKey};
use log::trace;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

/// One node with its nested descendants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: Node,
    /// `None` when the node has no children and empty vectors are disallowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

impl TreeNode {
    fn new(node: Node, allow_empty_children: bool) -> Self {
        Self {
            node,
            children: allow_empty_children.then(Vec::new),
        }
    }

    /// Children slice; empty when none were attached.
    pub fn children(&self) -> &[TreeNode] {
        self.children.as_deref().unwrap_or(&[])
    }
}

/// Query of [`crate::service::tree_service::TreeService::get_children_tree`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChildrenTreeQuery {
    /// Extra equality criteria.
    pub filters: Option<Selector>,
    /// Domain fields to project; structural fields are always kept.
    pub fields: Option<Vec<String>>,
    /// Sibling order inside each level.
    pub sort: Vec<SortKey>,
    /// Shallowest level rendered at the top. Raised to the root's
    /// level + 1 when a root is given.
    pub min_level: usize,
    /// `false` renders direct children only.
    pub recursive: bool,
    /// Give leaves an empty `children` vector instead of none.
    pub allow_empty_children: bool,
}

impl Default for ChildrenTreeQuery {
    fn default() -> Self {
        Self {
            filters: None,
            fields: None,
            sort: Vec::new(),
            min_level: 1,
            recursive: true,
            allow_empty_children: true,
        }
    }
}

/// Nests a flat node list by path depth.
pub(crate) fn nest_by_level(
    mut nodes: Vec<Node>,
    paths: &PathModel,
    min_level: usize,
    allow_empty_children: bool,
) -> Vec<TreeNode> {
    nodes.sort_by(|left, right| compare_segments(paths, left.path(), right.path()));
    let mut roots = Vec::new();
    for node in nodes {
        let level = paths.depth(node.path());
        if level < min_level {
            trace!(
                "event=children_tree module=tree status=skip id={} level={level}",
                node.id()
            );
            continue;
        }
        let id = node.id().clone();
        if !attach(&mut roots, node, level - min_level, allow_empty_children) {
            trace!("event=children_tree module=tree status=orphan id={id} level={level}");
        }
    }
    roots
}

fn compare_segments(paths: &PathModel, left: Option<&str>, right: Option<&str>) -> Ordering {
    let separator = paths.separator();
    let left = left.unwrap_or_default().split(separator);
    let right = right.unwrap_or_default().split(separator);
    left.cmp(right)
}

fn attach(
    siblings: &mut Vec<TreeNode>,
    node: Node,
    steps: usize,
    allow_empty_children: bool,
) -> bool {
    if steps == 0 {
        siblings.push(TreeNode::new(node, allow_empty_children));
        return true;
    }
    let Some(last) = siblings.last_mut() else {
        return false;
    };
    if steps > 1 && last.children().is_empty() {
        return false;
    }
    attach(
        last.children.get_or_insert_with(Vec::new),
        node,
        steps - 1,
        allow_empty_children,
    )
}

/// Stable-sorts every sibling list by `keys`.
pub(crate) fn sort_siblings(level: &mut [TreeNode], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    level.sort_by(|left, right| compare_nodes(&left.node, &right.node, keys));
    for entry in level.iter_mut() {
        if let Some(children) = entry.children.as_mut() {
            sort_siblings(children, keys);
        }
    }
}

fn compare_nodes(left: &Node, right: &Node, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ordering = match &key.field {
            SortField::Id => left.id().cmp(right.id()),
            SortField::Parent => left.parent().cmp(&right.parent()),
            SortField::Path => left.path().cmp(&right.path()),
            SortField::Field(name) => compare_values(left.get(name), right.get(name)),
        };
        let ordering = if key.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

#[cfg(test)]
mod tests {
    use super::{nest_by_level, sort_siblings};
    use crate::model::node::{Fields, Node, NodeId};
    use crate::model::path::PathModel;
    use crate::model::selector::{SortField, SortKey};
    use serde_json::json;

    fn node(path: &str) -> Node {
        let paths = PathModel::default();
        let ids = paths.ancestor_ids(path);
        let id = path.rsplit('#').next().unwrap_or(path);
        Node::persisted(
            NodeId::from(id),
            ids.last().map(|parent| NodeId::from(*parent)),
            Some(path.to_string()),
            Fields::new(),
        )
    }

    #[test]
    fn nests_path_ordered_nodes() {
        let nodes = vec![node("r"), node("r#a"), node("r#a#x"), node("r#b")];
        let tree = nest_by_level(nodes, &PathModel::default(), 1, true);
        assert_eq!(tree.len(), 1);
        let root = &tree[0];
        assert_eq!(root.children().len(), 2);
        assert_eq!(root.children()[0].node.id().as_str(), "a");
        assert_eq!(root.children()[0].children()[0].node.id().as_str(), "x");
        assert_eq!(root.children()[1].children, Some(Vec::new()));
    }

    #[test]
    fn nests_by_segment_when_ids_sort_around_the_separator() {
        // Plain path order puts `r#a!b` between `r#a` and its child `r#a#x`.
        let nodes = vec![node("r"), node("r#a"), node("r#a!b"), node("r#a#x")];
        let tree = nest_by_level(nodes, &PathModel::default(), 1, true);
        let children = tree[0].children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].node.id().as_str(), "a");
        assert_eq!(children[0].children()[0].node.id().as_str(), "x");
        assert_eq!(children[1].node.id().as_str(), "a!b");
        assert!(children[1].children().is_empty());
    }

    #[test]
    fn drops_nodes_without_attachment_point() {
        let nodes = vec![node("r#a#x"), node("r#b")];
        let tree = nest_by_level(nodes, &PathModel::default(), 2, false);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].node.id().as_str(), "b");
        assert_eq!(tree[0].children, None);
    }

    #[test]
    fn skips_levels_above_minimum() {
        let nodes = vec![node("r"), node("r#a")];
        let tree = nest_by_level(nodes, &PathModel::default(), 2, true);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].node.id().as_str(), "a");
    }

    #[test]
    fn siblings_follow_sort_keys() {
        let mut first = node("r#a");
        first.set("rank", 2);
        let mut second = node("r#b");
        second.set("rank", 1);
        let mut tree = nest_by_level(vec![node("r"), first, second], &PathModel::default(), 1, true);
        sort_siblings(&mut tree, &[SortKey::asc(SortField::Field("rank".into()))]);
        let order: Vec<_> = tree[0]
            .children()
            .iter()
            .map(|entry| entry.node.get("rank").cloned())
            .collect();
        assert_eq!(order, vec![Some(json!(1)), Some(json!(2))]);
    }
}
