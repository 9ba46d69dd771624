//! SQLite-backed node store.
//!
//! # Responsibility
//! - Implement [`NodeStore`] over the `nodes` table.
//! - Keep SQL generation and row decoding inside the store boundary.
//!
//! # Invariants
//! - Domain fields live in the JSON `fields` column and are matched with
//!   `json_extract`.
//! - Path predicates use `substr`/`instr`, so they are case-sensitive and need
//!   no pattern escaping.
//! - Streams page through matches by ascending id; only one page is held in
//!   memory at a time.

use super::{NodeStore, NodeStream, StoreError, StoreResult, UpsertOutcome};
use crate::config::IdFormat;
use crate::db::migrations::{current_user_version, latest_version};
use crate::model::node::{Fields, Node, NodeId};
use crate::model::selector::{
    Body, Filter, FindOptions, NodeUpdate, Selector, SortField, SortKey, UpsertMode,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use serde_json::Value;
use std::sync::{Arc, Mutex};

const NODE_SELECT_SQL: &str = "SELECT id, parent, path, fields FROM nodes";
const DEFAULT_PAGE_SIZE: usize = 64;
const REQUIRED_COLUMNS: [&str; 4] = ["id", "parent", "path", "fields"];

/// Node store over one migrated SQLite connection.
///
/// Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteNodeStore {
    conn: Arc<Mutex<Connection>>,
    id_format: IdFormat,
    page_size: usize,
}

impl SqliteNodeStore {
    /// Creates a store from a migrated connection.
    ///
    /// # Errors
    /// - `UninitializedConnection` when migrations are not fully applied.
    /// - `MissingRequiredTable`/`MissingRequiredColumn` for a foreign schema.
    pub fn try_new(conn: Connection) -> StoreResult<Self> {
        ensure_connection_ready(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            id_format: IdFormat::default(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_id_format(mut self, id_format: IdFormat) -> Self {
        self.id_format = id_format;
        self
    }

    /// Number of rows fetched per stream round trip.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.conn), op).await
    }
}

#[async_trait]
impl NodeStore for SqliteNodeStore {
    async fn find_one(&self, filter: &Filter) -> StoreResult<Option<Node>> {
        let filter = filter.clone();
        self.run(move |conn| {
            let options = FindOptions {
                limit: Some(1),
                ..FindOptions::default()
            };
            Ok(query_nodes(conn, &filter, &options)?.into_iter().next())
        })
        .await
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> StoreResult<Vec<Node>> {
        let filter = filter.clone();
        let options = options.clone();
        self.run(move |conn| query_nodes(conn, &filter, &options))
            .await
    }

    fn stream(&self, filter: Filter) -> NodeStream {
        let conn = Arc::clone(&self.conn);
        let page_size = self.page_size;

        let pages = stream::try_unfold(PageCursor::default(), move |cursor| {
            let conn = Arc::clone(&conn);
            let filter = filter.clone();
            async move {
                if cursor.exhausted {
                    return Ok::<_, StoreError>(None);
                }
                let after = cursor.after;
                let page = run_blocking(conn, move |conn| {
                    load_page(conn, &filter, after.as_deref(), page_size)
                })
                .await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = PageCursor {
                    after: page.last().map(|node| node.id().as_str().to_string()),
                    exhausted: page.len() < page_size,
                };
                Ok(Some((page, next)))
            }
        });

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    async fn find_one_and_upsert(
        &self,
        selector: &Selector,
        body: &Body,
        mode: UpsertMode,
    ) -> StoreResult<UpsertOutcome> {
        let selector = selector.clone();
        let body = body.clone();
        let id_format = self.id_format;
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let options = FindOptions {
                limit: Some(1),
                ..FindOptions::default()
            };
            let existing = query_nodes(&tx, &selector.to_filter(), &options)?
                .into_iter()
                .next();

            let outcome = match existing {
                Some(mut node) => {
                    if mode == UpsertMode::Set && !body.is_empty() {
                        node.absorb_fields(body.fields());
                        tx.execute(
                            "UPDATE nodes SET fields = ?2 WHERE id = ?1;",
                            params![node.id().as_str(), encode_fields(node.fields())?],
                        )?;
                    }
                    UpsertOutcome {
                        node,
                        updated_existing: true,
                    }
                }
                None => {
                    let id = selector
                        .id
                        .clone()
                        .unwrap_or_else(|| NodeId::new(id_format.generate()));
                    let parent = selector.parent.clone().flatten();
                    let mut fields = selector.fields.clone();
                    for (key, value) in body.fields() {
                        fields.insert(key.clone(), value.clone());
                    }
                    let node = Node::persisted(id, parent, None, fields);
                    insert_node(&tx, &node)?;
                    UpsertOutcome {
                        node,
                        updated_existing: false,
                    }
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn insert(&self, node: &Node) -> StoreResult<()> {
        let node = node.clone();
        self.run(move |conn| insert_node(conn, &node)).await
    }

    async fn update_by_id(&self, id: &NodeId, update: &NodeUpdate) -> StoreResult<bool> {
        let id = id.clone();
        let update = update.clone();
        self.run(move |conn| update_node(conn, &id, &update)).await
    }

    async fn remove(&self, filter: &Filter) -> StoreResult<u64> {
        let filter = filter.clone();
        self.run(move |conn| {
            let mut params = Vec::new();
            let clause = compile_filter(&filter, &mut params)?;
            let removed = conn.execute(
                &format!("DELETE FROM nodes WHERE {clause};"),
                params_from_iter(params.iter()),
            )?;
            Ok(removed as u64)
        })
        .await
    }
}

#[derive(Debug, Default)]
struct PageCursor {
    after: Option<String>,
    exhausted: bool,
}

async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, op: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
        op(&mut guard)
    })
    .await
    .map_err(|err| StoreError::Task(err.to_string()))?
}

fn query_nodes(conn: &Connection, filter: &Filter, options: &FindOptions) -> StoreResult<Vec<Node>> {
    let mut params = Vec::new();
    let mut sql = format!(
        "{NODE_SELECT_SQL} WHERE {}",
        compile_filter(filter, &mut params)?
    );
    append_order(&mut sql, &options.sort, &mut params)?;
    if let Some(limit) = options.limit {
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(limit as i64));
    }
    sql.push(';');

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_node_row(row, options.fields.as_deref())?);
    }
    Ok(items)
}

fn load_page(
    conn: &Connection,
    filter: &Filter,
    after: Option<&str>,
    page_size: usize,
) -> StoreResult<Vec<Node>> {
    let mut params = Vec::new();
    let mut sql = format!(
        "{NODE_SELECT_SQL} WHERE {}",
        compile_filter(filter, &mut params)?
    );
    if let Some(after) = after {
        sql.push_str(" AND id > ?");
        params.push(SqlValue::Text(after.to_string()));
    }
    sql.push_str(" ORDER BY id ASC LIMIT ?;");
    params.push(SqlValue::Integer(page_size as i64));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut page = Vec::with_capacity(page_size);
    while let Some(row) = rows.next()? {
        page.push(parse_node_row(row, None)?);
    }
    Ok(page)
}

fn insert_node(conn: &Connection, node: &Node) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO nodes (id, parent, path, fields) VALUES (?1, ?2, ?3, ?4);",
        params![
            node.id().as_str(),
            node.parent().map(NodeId::as_str),
            node.path(),
            encode_fields(node.fields())?,
        ],
    )?;
    Ok(())
}

fn update_node(conn: &Connection, id: &NodeId, update: &NodeUpdate) -> StoreResult<bool> {
    if update.is_empty() {
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?1);",
            [id.as_str()],
            |row| row.get(0),
        )?;
        return Ok(exists == 1);
    }

    let mut assignments = Vec::new();
    let mut params = Vec::new();
    if let Some(parent) = &update.parent {
        assignments.push("parent = ?".to_string());
        params.push(optional_text(parent.as_ref().map(NodeId::as_str)));
    }
    if let Some(path) = &update.path {
        assignments.push("path = ?".to_string());
        params.push(optional_text(path.as_deref()));
    }
    if !update.set_fields.is_empty() || !update.unset_fields.is_empty() {
        assignments.push(format!("fields = {}", merge_fields_expr(update, &mut params)?));
    }
    params.push(SqlValue::Text(id.as_str().to_string()));

    let changed = conn.execute(
        &format!("UPDATE nodes SET {} WHERE id = ?;", assignments.join(", ")),
        params_from_iter(params.iter()),
    )?;
    Ok(changed > 0)
}

/// Rewrites only the named keys of the stored `fields` object.
fn merge_fields_expr(update: &NodeUpdate, params: &mut Vec<SqlValue>) -> StoreResult<String> {
    let mut expr = "fields".to_string();
    if !update.set_fields.is_empty() {
        let mut pairs = Vec::with_capacity(update.set_fields.len());
        for (key, value) in &update.set_fields {
            params.push(SqlValue::Text(json_path(key)?));
            params.push(SqlValue::Text(encode_value(value)?));
            pairs.push("?, json(?)");
        }
        expr = format!("json_set({expr}, {})", pairs.join(", "));
    }
    if !update.unset_fields.is_empty() {
        let mut paths = Vec::with_capacity(update.unset_fields.len());
        for key in &update.unset_fields {
            params.push(SqlValue::Text(json_path(key)?));
            paths.push("?");
        }
        expr = format!("json_remove({expr}, {})", paths.join(", "));
    }
    Ok(expr)
}

fn compile_filter(filter: &Filter, params: &mut Vec<SqlValue>) -> StoreResult<String> {
    let clause = match filter {
        Filter::All => "1 = 1".to_string(),
        Filter::Id(id) => {
            params.push(SqlValue::Text(id.as_str().to_string()));
            "id = ?".to_string()
        }
        Filter::IdIn(ids) => {
            if ids.is_empty() {
                return Ok("0 = 1".to_string());
            }
            for id in ids {
                params.push(SqlValue::Text(id.as_str().to_string()));
            }
            format!("id IN ({})", vec!["?"; ids.len()].join(", "))
        }
        Filter::Parent(None) => "parent IS NULL".to_string(),
        Filter::Parent(Some(parent)) => {
            params.push(SqlValue::Text(parent.as_str().to_string()));
            "parent = ?".to_string()
        }
        Filter::PathPrefix(prefix) => {
            params.push(SqlValue::Text(prefix.clone()));
            params.push(SqlValue::Text(prefix.clone()));
            "(path IS NOT NULL AND substr(path, 1, length(?)) = ?)".to_string()
        }
        Filter::PathSegment { id, separator } => {
            let head = format!("{id}{separator}");
            let inner = format!("{separator}{id}{separator}");
            params.push(SqlValue::Text(head.clone()));
            params.push(SqlValue::Text(head));
            params.push(SqlValue::Text(inner));
            "(path IS NOT NULL AND (substr(path, 1, length(?)) = ? OR instr(path, ?) > 0))"
                .to_string()
        }
        Filter::Field(name, value) => {
            params.push(SqlValue::Text(json_path(name)?));
            match value {
                Value::Null => "json_extract(fields, ?) IS NULL".to_string(),
                Value::Array(_) | Value::Object(_) => {
                    params.push(SqlValue::Text(value.to_string()));
                    "json_extract(fields, ?) = json(?)".to_string()
                }
                scalar => {
                    params.push(scalar_to_sql(scalar));
                    "json_extract(fields, ?) = ?".to_string()
                }
            }
        }
        Filter::And(clauses) | Filter::Or(clauses) => {
            let joiner = if matches!(filter, Filter::And(_)) {
                " AND "
            } else {
                " OR "
            };
            if clauses.is_empty() {
                return Ok(if matches!(filter, Filter::And(_)) {
                    "1 = 1".to_string()
                } else {
                    "0 = 1".to_string()
                });
            }
            let mut parts = Vec::with_capacity(clauses.len());
            for clause in clauses {
                parts.push(compile_filter(clause, params)?);
            }
            format!("({})", parts.join(joiner))
        }
    };
    Ok(clause)
}

fn append_order(sql: &mut String, sort: &[SortKey], params: &mut Vec<SqlValue>) -> StoreResult<()> {
    let mut terms = Vec::with_capacity(sort.len() + 1);
    let mut has_id = false;
    for key in sort {
        let expr = match &key.field {
            SortField::Id => {
                has_id = true;
                "id".to_string()
            }
            SortField::Parent => "parent".to_string(),
            SortField::Path => "path".to_string(),
            SortField::Field(name) => {
                params.push(SqlValue::Text(json_path(name)?));
                "json_extract(fields, ?)".to_string()
            }
        };
        let direction = if key.descending { "DESC" } else { "ASC" };
        terms.push(format!("{expr} {direction}"));
    }
    if !has_id {
        terms.push("id ASC".to_string());
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&terms.join(", "));
    Ok(())
}

fn json_path(field: &str) -> StoreResult<String> {
    if field.is_empty() || field.contains('"') {
        return Err(StoreError::InvalidData(format!(
            "unsupported field name `{field}`"
        )));
    }
    Ok(format!("$.\"{field}\""))
}

fn scalar_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn optional_text(value: Option<&str>) -> SqlValue {
    match value {
        Some(text) => SqlValue::Text(text.to_string()),
        None => SqlValue::Null,
    }
}

fn encode_fields(fields: &Fields) -> StoreResult<String> {
    serde_json::to_string(fields)
        .map_err(|err| StoreError::InvalidData(format!("unencodable fields: {err}")))
}

fn encode_value(value: &Value) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::InvalidData(format!("unencodable field value: {err}")))
}

fn parse_node_row(row: &Row<'_>, projection: Option<&[String]>) -> StoreResult<Node> {
    let id: String = row.get("id")?;
    let parent: Option<String> = row.get("parent")?;
    let path: Option<String> = row.get("path")?;
    let raw_fields: String = row.get("fields")?;

    let mut fields = match serde_json::from_str::<Value>(&raw_fields) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(StoreError::InvalidData(format!(
                "fields of node `{id}` are not a JSON object"
            )))
        }
        Err(err) => {
            return Err(StoreError::InvalidData(format!(
                "fields of node `{id}` are not valid JSON: {err}"
            )))
        }
    };
    if let Some(keep) = projection {
        fields.retain(|key, _| keep.iter().any(|wanted| wanted == key));
    }

    Ok(Node::persisted(
        NodeId::new(id),
        parent.map(NodeId::new),
        path,
        fields,
    ))
}

fn ensure_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version = current_user_version(conn)?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'nodes');",
        [],
        |row| row.get(0),
    )?;
    if exists != 1 {
        return Err(StoreError::MissingRequiredTable("nodes"));
    }

    let mut stmt = conn.prepare("PRAGMA table_info(nodes);")?;
    let mut rows = stmt.query([])?;
    let mut present = Vec::new();
    while let Some(row) = rows.next()? {
        present.push(row.get::<_, String>(1)?);
    }
    for column in REQUIRED_COLUMNS {
        if !present.iter().any(|name| name == column) {
            return Err(StoreError::MissingRequiredColumn {
                table: "nodes",
                column,
            });
        }
    }
    Ok(())
}
