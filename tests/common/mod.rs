//! In-process stand-in for the remote REST store.
//!
//! Serves the same resource-per-table protocol the backend speaks: filters
//! and ordering in the query string, upserts as POSTed JSON arrays. Rows
//! live in memory so tests can seed and inspect them directly.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::DateTime;
use secrecy::SecretString;
use serde_json::{json, Value};
use url::Url;

use chronicler::config::RemoteConfig;
use chronicler::db::remote::RestBackend;

#[derive(Clone, Default)]
pub struct FakeStore {
    tables: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    requests: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .expect("store lock")
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .expect("store lock")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every request seen so far, as `GET table?query` / `POST table?query`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("request lock").clone()
    }

    /// When set, reads answer 500 until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_failing(&self) -> bool {
        self.failing.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn log(&self, line: String) {
        self.requests.lock().expect("request lock").push(line);
    }

    fn upsert(&self, table: &str, key: &str, incoming: Vec<Value>) {
        let mut tables = self.tables.lock().expect("store lock");
        let rows = tables.entry(table.to_string()).or_default();
        for new_row in incoming {
            let id = new_row.get(key).cloned();
            match rows.iter_mut().find(|row| row.get(key).cloned() == id) {
                Some(existing) => *existing = new_row,
                None => rows.push(new_row),
            }
        }
    }
}

async fn table_get(
    State(store): State<FakeStore>,
    Path(table): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    store.log(format!("GET {table}?{query}"));
    if store.is_failing() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage offline").into_response();
    }
    Json(apply_query(store.rows(&table), &query)).into_response()
}

async fn table_post(
    State(store): State<FakeStore>,
    Path(table): Path<String>,
    RawQuery(query): RawQuery,
    Json(body): Json<Value>,
) -> Response {
    let query = query.unwrap_or_default();
    store.log(format!("POST {table}?{query}"));
    if store.is_failing() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage offline").into_response();
    }
    let key = pairs_of(&query)
        .into_iter()
        .find(|(k, _)| k == "on_conflict")
        .map(|(_, v)| v)
        .unwrap_or_else(|| "id".to_string());
    let rows = body.as_array().cloned().unwrap_or_default();
    store.upsert(&table, &key, rows);
    StatusCode::CREATED.into_response()
}

fn pairs_of(raw: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}

/// Apply filters, ordering, the page window and the column projection, in
/// that order.
fn apply_query(rows: Vec<Value>, raw: &str) -> Vec<Value> {
    let pairs = pairs_of(raw);
    let mut out = rows;

    for (key, value) in &pairs {
        match key.as_str() {
            "select" | "order" | "limit" | "offset" | "on_conflict" => {}
            column => out.retain(|row| matches_filter(row, column, value)),
        }
    }

    for (key, value) in &pairs {
        if key == "order" {
            let (column, direction) = value.split_once('.').unwrap_or((value.as_str(), "asc"));
            let descending = direction == "desc";
            out.sort_by(|a, b| {
                let ord = compare_columns(a.get(column), b.get(column));
                if descending { ord.reverse() } else { ord }
            });
        }
    }

    let offset = pairs
        .iter()
        .find(|(k, _)| k == "offset")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let limit = pairs
        .iter()
        .find(|(k, _)| k == "limit")
        .and_then(|(_, v)| v.parse::<usize>().ok());
    let mut out: Vec<Value> = out.into_iter().skip(offset).collect();
    if let Some(limit) = limit {
        out.truncate(limit);
    }

    if let Some((_, select)) = pairs.iter().find(|(k, _)| k == "select") {
        let columns: Vec<&str> = select.split(',').collect();
        out = out
            .into_iter()
            .map(|row| {
                let mut projected = serde_json::Map::new();
                for column in &columns {
                    if let Some(value) = row.get(*column) {
                        projected.insert((*column).to_string(), value.clone());
                    }
                }
                Value::Object(projected)
            })
            .collect();
    }
    out
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Range comparison that understands timestamps and numbers; anything else
/// compares as text.
fn compare_rendered(actual: &str, bound: &str) -> Ordering {
    if let (Ok(a), Ok(b)) = (
        DateTime::parse_from_rfc3339(actual),
        DateTime::parse_from_rfc3339(bound),
    ) {
        return a.cmp(&b);
    }
    if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), bound.parse::<f64>()) {
        return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
    }
    actual.cmp(bound)
}

fn compare_columns(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.map(render).unwrap_or_default();
    let b = b.map(render).unwrap_or_default();
    compare_rendered(&a, &b)
}

/// Wildcard-wrapped patterns only, which is all the backend emits.
fn ilike(actual: &str, pattern: &str) -> bool {
    let lowered = actual.to_lowercase();
    pattern
        .to_lowercase()
        .split('*')
        .filter(|segment| !segment.is_empty())
        .all(|segment| lowered.contains(segment))
}

fn matches_filter(row: &Value, column: &str, op: &str) -> bool {
    let actual = row.get(column).map(render).unwrap_or_default();
    if let Some(bound) = op.strip_prefix("eq.") {
        actual == bound
    } else if let Some(bound) = op.strip_prefix("gte.") {
        compare_rendered(&actual, bound) != Ordering::Less
    } else if let Some(bound) = op.strip_prefix("gt.") {
        compare_rendered(&actual, bound) == Ordering::Greater
    } else if let Some(bound) = op.strip_prefix("lte.") {
        compare_rendered(&actual, bound) != Ordering::Greater
    } else if let Some(list) = op.strip_prefix("in.") {
        list.trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .any(|item| item.trim() == actual)
    } else if let Some(pattern) = op.strip_prefix("not.ilike.") {
        !ilike(&actual, pattern)
    } else if let Some(pattern) = op.strip_prefix("ilike.") {
        ilike(&actual, pattern)
    } else {
        true
    }
}

/// Serve `store` on an ephemeral local port.
pub async fn spawn_remote(store: FakeStore) -> SocketAddr {
    let app = Router::new()
        .route("/rest/v1/{table}", get(table_get).post(table_post))
        .with_state(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake remote");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fake remote");
    });
    addr
}

pub fn remote_config(addr: SocketAddr, page_size: usize) -> RemoteConfig {
    RemoteConfig {
        url: Url::parse(&format!("http://{addr}/")).expect("remote url"),
        service_key: SecretString::from("test-service-key".to_string()),
        request_timeout: Duration::from_secs(5),
        page_size,
    }
}

/// A backend wired to a freshly spawned fake store.
pub async fn rest_backend(store: &FakeStore, page_size: usize) -> RestBackend {
    let addr = spawn_remote(store.clone()).await;
    RestBackend::new(&remote_config(addr, page_size)).expect("build rest backend")
}

// ---------------------------------------------------------------------------
// Seed rows, in the remote store's native encoding
// ---------------------------------------------------------------------------

pub fn remote_message(id: i64, channel_id: i64, author_id: i64, created_at: &str) -> Value {
    json!({
        "message_id": id,
        "channel_id": channel_id,
        "author_id": author_id,
        "content": format!("message {id}"),
        "created_at": created_at,
        "edited_at": null,
        "attachments": [],
        "embeds": [],
        "reaction_count": 0,
        "reactors": [],
        "reference_id": null,
        "thread_id": null,
        "is_pinned": false,
        "message_type": null,
        "flags": 0,
        "is_deleted": false,
    })
}

pub fn with_reactors(mut row: Value, reactors: &[i64]) -> Value {
    row["reactors"] = json!(reactors);
    row["reaction_count"] = json!(reactors.len());
    row
}

pub fn with_attachment(mut row: Value, url: &str, filename: &str) -> Value {
    row["attachments"] = json!([{ "url": url, "filename": filename }]);
    row
}

pub fn remote_channel(id: i64, name: &str, category_id: Option<i64>) -> Value {
    json!({
        "channel_id": id,
        "channel_name": name,
        "category_id": category_id,
        "description": null,
        "nsfw": false,
        "enriched": false,
        "setup_complete": true,
    })
}

pub fn remote_member(id: i64, username: &str, server_nick: Option<&str>) -> Value {
    json!({
        "member_id": id,
        "username": username,
        "global_name": null,
        "server_nick": server_nick,
        "avatar_url": null,
        "bot": false,
        "role_ids": [],
        "twitter_handle": null,
        "instagram_handle": null,
        "youtube_handle": null,
        "website": null,
        "sharing_consent": true,
        "dm_preference": false,
        "guild_join_date": null,
        "created_at": "2024-01-01T00:00:00+00:00",
        "updated_at": null,
    })
}
