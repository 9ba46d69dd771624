mod common;

use common::fields;
use futures::TryStreamExt;
use matpath_core::db::migrations::latest_version;
use matpath_core::{
    open_db, open_db_in_memory, Body, DbError, Filter, FindOptions, IdFormat, Node, NodeId,
    NodeStore, NodeUpdate, Selector, SortField, SortKey, SqliteNodeStore, StoreError, UpsertMode,
};
use rusqlite::Connection;
use serde_json::json;

fn node(id: &str, parent: Option<&str>, path: &str, body: serde_json::Value) -> Node {
    Node::persisted(
        NodeId::from(id),
        parent.map(NodeId::from),
        Some(path.to_string()),
        fields(body),
    )
}

#[test]
fn open_db_creates_the_nodes_schema() {
    let conn = open_db_in_memory().unwrap();
    let version: u32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(version, latest_version());

    let mut stmt = conn.prepare("PRAGMA table_info(nodes);").unwrap();
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get(1))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(columns, vec!["id", "parent", "path", "fields"]);
}

#[test]
fn newer_schema_versions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    match open_db(&path).unwrap_err() {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn store_rejects_unmigrated_connections() {
    let raw = Connection::open_in_memory().unwrap();
    let err = SqliteNodeStore::try_new(raw).err().unwrap();
    assert!(matches!(err, StoreError::UninitializedConnection { .. }));
}

#[tokio::test]
async fn stream_pages_through_every_match() {
    let store = SqliteNodeStore::try_new(open_db_in_memory().unwrap())
        .unwrap()
        .with_page_size(2);
    store.insert(&node("r", None, "r", json!({}))).await.unwrap();
    for index in 0..7 {
        let id = format!("c{index}");
        store
            .insert(&node(&id, Some("r"), &format!("r#{id}"), json!({})))
            .await
            .unwrap();
    }

    let streamed: Vec<Node> = store
        .stream(Filter::PathPrefix("r#".to_string()))
        .try_collect()
        .await
        .unwrap();

    let mut ids: Vec<_> = streamed.iter().map(|node| node.id().to_string()).collect();
    ids.sort();
    assert_eq!(ids, (0..7).map(|index| format!("c{index}")).collect::<Vec<_>>());
}

#[tokio::test]
async fn path_prefix_is_case_sensitive_and_literal() {
    let store = SqliteNodeStore::try_new(open_db_in_memory().unwrap()).unwrap();
    for (id, path) in [("a", "R#a"), ("b", "r#b"), ("c", "r_x#c"), ("d", "r%#d")] {
        store.insert(&node(id, None, path, json!({}))).await.unwrap();
    }

    let lower = store
        .find(&Filter::PathPrefix("r#".to_string()), &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(lower.len(), 1);
    assert_eq!(lower[0].id().as_str(), "b");

    let percent = store
        .find(&Filter::PathPrefix("r%#".to_string()), &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(percent.len(), 1);
    assert_eq!(percent[0].id().as_str(), "d");
}

#[tokio::test]
async fn upsert_inserts_selector_fields_with_generated_id() {
    let store = SqliteNodeStore::try_new(open_db_in_memory().unwrap())
        .unwrap()
        .with_id_format(IdFormat::Hyphenated);
    let selector = Selector::new().field("name", "x").with_parent(None);
    let body = Body::new(fields(json!({"size": 3}))).unwrap();

    let created = store
        .find_one_and_upsert(&selector, &body, UpsertMode::SetOnInsert)
        .await
        .unwrap();

    assert!(!created.updated_existing);
    assert_eq!(created.node.id().as_str().len(), 36);
    assert_eq!(created.node.get("name"), Some(&json!("x")));
    assert_eq!(created.node.get("size"), Some(&json!(3)));
    assert_eq!(created.node.parent(), None);
}

#[tokio::test]
async fn updates_sorts_and_bulk_removal() {
    let store = SqliteNodeStore::try_new(open_db_in_memory().unwrap()).unwrap();
    store.insert(&node("a", None, "a", json!({"rank": 2}))).await.unwrap();
    store.insert(&node("b", None, "b", json!({"rank": 1}))).await.unwrap();

    let moved = store
        .update_by_id(&NodeId::from("a"), &NodeUpdate::set_path("z#a"))
        .await
        .unwrap();
    assert!(moved);
    assert!(!store
        .update_by_id(&NodeId::from("ghost"), &NodeUpdate::set_path("g"))
        .await
        .unwrap());

    let options = FindOptions {
        sort: vec![SortKey::desc(SortField::Field("rank".to_string()))],
        ..FindOptions::default()
    };
    let sorted = store.find(&Filter::All, &options).await.unwrap();
    let ids: Vec<_> = sorted.iter().map(|node| node.id().as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(sorted[0].path(), Some("z#a"));

    let removed = store
        .remove(&Filter::Or(vec![
            Filter::Id(NodeId::from("a")),
            Filter::Field("rank".to_string(), json!(1)),
        ]))
        .await
        .unwrap();
    assert_eq!(removed, 2);
}

#[tokio::test]
async fn field_updates_merge_into_stored_fields() {
    let store = SqliteNodeStore::try_new(open_db_in_memory().unwrap()).unwrap();
    store
        .insert(&node("a", None, "a", json!({"name": "a", "rank": 2, "tags": ["x"]})))
        .await
        .unwrap();

    let mut update = NodeUpdate::default();
    update.set_fields.insert("name".to_string(), json!("renamed"));
    update.set_fields.insert("meta".to_string(), json!({"depth": 1}));
    update.unset_fields.push("tags".to_string());
    assert!(store.update_by_id(&NodeId::from("a"), &update).await.unwrap());

    let stored = store
        .find_one(&Filter::Id(NodeId::from("a")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.fields(),
        &fields(json!({"name": "renamed", "rank": 2, "meta": {"depth": 1}}))
    );
    assert_eq!(stored.path(), Some("a"));
}
