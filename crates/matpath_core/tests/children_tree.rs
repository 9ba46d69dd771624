mod common;

use common::{fields, save_root, service, store};
use matpath_core::{
    ChildrenTreeQuery, DeleteMode, Node, Selector, SortField, SortKey, SqliteNodeStore,
    TreeConfig, TreeNode, TreeService,
};
use serde_json::json;

async fn add(
    service: &TreeService<SqliteNodeStore>,
    parent: &Node,
    id: &str,
    rank: i64,
) -> Node {
    let mut node = Node::with_id(id, fields(json!({"rank": rank}))).child_of(parent);
    service.save(&mut node).await.unwrap();
    node
}

/// Checks that every nested child points back at its enclosing node.
fn assert_nesting_matches_parents(level: &[TreeNode]) {
    for entry in level {
        for child in entry.children() {
            assert_eq!(child.node.parent(), Some(entry.node.id()));
            assert_nesting_matches_parents(std::slice::from_ref(child));
        }
    }
}

fn shape(level: &[TreeNode]) -> Vec<String> {
    level
        .iter()
        .map(|entry| {
            let children = shape(entry.children());
            if children.is_empty() {
                entry.node.id().to_string()
            } else {
                format!("{}({})", entry.node.id(), children.join(","))
            }
        })
        .collect()
}

async fn forest(service: &TreeService<SqliteNodeStore>) -> Vec<Node> {
    let a = save_root(service, "a").await;
    let b = save_root(service, "b").await;
    let a1 = add(service, &a, "a1", 2).await;
    let a2 = add(service, &a, "a2", 1).await;
    let a1x = add(service, &a1, "a1x", 0).await;
    let b1 = add(service, &b, "b1", 0).await;
    vec![a, b, a1, a2, a1x, b1]
}

#[tokio::test]
async fn static_form_nests_every_hierarchy() {
    let service = service(DeleteMode::Delete);
    forest(&service).await;

    let tree = service
        .get_children_tree(None, &ChildrenTreeQuery::default())
        .await
        .unwrap();

    assert_eq!(shape(&tree), vec!["a(a1(a1x),a2)", "b(b1)"]);
    assert_nesting_matches_parents(&tree);
    assert_eq!(tree[0].children()[1].children, Some(Vec::new()));
}

#[tokio::test]
async fn node_form_starts_below_the_node() {
    let service = service(DeleteMode::Delete);
    let nodes = forest(&service).await;

    let tree = service
        .get_children_tree(Some(&nodes[0]), &ChildrenTreeQuery::default())
        .await
        .unwrap();

    assert_eq!(shape(&tree), vec!["a1(a1x)", "a2"]);
    assert_nesting_matches_parents(&tree);
}

#[tokio::test]
async fn non_recursive_forms_return_one_level() {
    let service = service(DeleteMode::Delete);
    let nodes = forest(&service).await;
    let flat = ChildrenTreeQuery {
        recursive: false,
        ..ChildrenTreeQuery::default()
    };

    let roots = service.get_children_tree(None, &flat).await.unwrap();
    assert_eq!(shape(&roots), vec!["a", "b"]);

    let children = service.get_children_tree(Some(&nodes[0]), &flat).await.unwrap();
    assert_eq!(shape(&children), vec!["a1", "a2"]);
}

#[tokio::test]
async fn leaves_can_omit_empty_children() {
    let service = service(DeleteMode::Delete);
    forest(&service).await;
    let query = ChildrenTreeQuery {
        allow_empty_children: false,
        ..ChildrenTreeQuery::default()
    };

    let tree = service.get_children_tree(None, &query).await.unwrap();

    let a2 = &tree[0].children()[1];
    assert_eq!(a2.node.id().as_str(), "a2");
    assert_eq!(a2.children, None);
    let rendered = serde_json::to_value(a2).unwrap();
    assert!(rendered.get("children").is_none());
    assert_eq!(rendered["id"], json!("a2"));
}

#[tokio::test]
async fn sibling_order_follows_caller_sort() {
    let service = service(DeleteMode::Delete);
    forest(&service).await;
    let query = ChildrenTreeQuery {
        sort: vec![SortKey::asc(SortField::Field("rank".to_string()))],
        ..ChildrenTreeQuery::default()
    };

    let tree = service.get_children_tree(None, &query).await.unwrap();

    assert_eq!(shape(&tree), vec!["a(a2,a1(a1x))", "b(b1)"]);
}

#[tokio::test]
async fn min_level_and_filters_trim_the_result() {
    let service = service(DeleteMode::Delete);
    forest(&service).await;

    let deeper = ChildrenTreeQuery {
        min_level: 2,
        ..ChildrenTreeQuery::default()
    };
    let tree = service.get_children_tree(None, &deeper).await.unwrap();
    assert_eq!(shape(&tree), vec!["a1(a1x)", "a2", "b1"]);

    let ranked_zero = ChildrenTreeQuery {
        filters: Some(Selector::new().field("rank", 0)),
        min_level: 2,
        ..ChildrenTreeQuery::default()
    };
    // a1x loses its attachment point once a1 is filtered out.
    let tree = service.get_children_tree(None, &ranked_zero).await.unwrap();
    assert_eq!(shape(&tree), vec!["b1"]);
}

#[tokio::test]
async fn nesting_holds_for_separators_sorting_above_ids() {
    let service = TreeService::new(store(), TreeConfig::default().with_separator('~')).unwrap();
    let r = save_root(&service, "r").await;
    let a = add(&service, &r, "a", 0).await;
    add(&service, &r, "ab", 0).await;
    add(&service, &a, "x", 0).await;
    assert_eq!(a.path(), Some("r~a"));

    let tree = service
        .get_children_tree(None, &ChildrenTreeQuery::default())
        .await
        .unwrap();

    assert_eq!(shape(&tree), vec!["r(a(x),ab)"]);
    assert_nesting_matches_parents(&tree);
}
