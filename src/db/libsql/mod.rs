//! Embedded libSQL backend.
//!
//! Owns the pooled connections to the local archive file and implements the
//! full store surface against it. Statement execution always goes through
//! [`ConnectionPool::execute_with_retry`], so transient lock contention is
//! absorbed here rather than surfaced to the router.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::config::PoolConfig;
use crate::db::{QuerySurface, ResultRow};
use crate::error::DatabaseError;

use super::pool::ConnectionPool;

mod directory;
mod messages;

/// Canonical timestamp encoding for every text timestamp column: UTC with a
/// fixed six-digit fraction, so lexicographic order equals time order. The
/// remote normalizer targets the same form.
pub(crate) const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

const SCHEMA: &str = "\
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS messages (
    message_id INTEGER PRIMARY KEY,
    channel_id INTEGER NOT NULL,
    author_id INTEGER NOT NULL,
    author_name TEXT,
    content TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    edited_at TEXT,
    attachments TEXT NOT NULL DEFAULT '[]',
    embeds TEXT NOT NULL DEFAULT '[]',
    reaction_count INTEGER NOT NULL DEFAULT 0,
    reactors TEXT NOT NULL DEFAULT '[]',
    reference_id INTEGER,
    thread_id INTEGER,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    message_type TEXT,
    flags INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_channel_created
    ON messages (channel_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages (created_at);
CREATE INDEX IF NOT EXISTS idx_messages_author ON messages (author_id);

CREATE TABLE IF NOT EXISTS members (
    member_id INTEGER PRIMARY KEY,
    username TEXT NOT NULL,
    global_name TEXT,
    server_nick TEXT,
    avatar_url TEXT,
    bot INTEGER NOT NULL DEFAULT 0,
    role_ids TEXT NOT NULL DEFAULT '[]',
    twitter_handle TEXT,
    instagram_handle TEXT,
    youtube_handle TEXT,
    website TEXT,
    sharing_consent INTEGER NOT NULL DEFAULT 0,
    dm_preference INTEGER NOT NULL DEFAULT 0,
    guild_join_date TEXT,
    created_at TEXT,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS channels (
    channel_id INTEGER PRIMARY KEY,
    channel_name TEXT NOT NULL,
    category_id INTEGER,
    description TEXT,
    nsfw INTEGER NOT NULL DEFAULT 0,
    enriched INTEGER NOT NULL DEFAULT 0,
    setup_complete INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_channels_category ON channels (category_id);

CREATE TABLE IF NOT EXISTS channel_summary (
    channel_id INTEGER PRIMARY KEY,
    summary_thread_id INTEGER,
    updated_at TEXT
);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    content='messages',
    content_rowid='message_id'
);

CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts (rowid, content) VALUES (new.message_id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts (messages_fts, rowid, content)
    VALUES ('delete', old.message_id, old.content);
END;
CREATE TRIGGER IF NOT EXISTS messages_fts_update AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts (messages_fts, rowid, content)
    VALUES ('delete', old.message_id, old.content);
    INSERT INTO messages_fts (rowid, content) VALUES (new.message_id, new.content);
END;
";

/// Store implementation over one local database file.
pub struct LibSqlBackend {
    pool: ConnectionPool,
}

impl LibSqlBackend {
    /// Open (creating if absent) the archive file, fill the connection pool,
    /// and apply the schema.
    pub async fn open(path: &Path, pool_config: PoolConfig) -> Result<Self, DatabaseError> {
        let pool = ConnectionPool::open(path, pool_config).await?;
        let backend = Self { pool };
        backend
            .pool
            .execute_with_retry(|conn| async move {
                conn.execute_batch(SCHEMA).await?;
                Ok(())
            })
            .await?;
        Ok(backend)
    }

    pub(super) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl QuerySurface for LibSqlBackend {
    async fn execute_query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<ResultRow>, DatabaseError> {
        self.pool
            .execute_with_retry(|conn| async move {
                let args: Vec<libsql::Value> = params.iter().map(json_param).collect();
                let mut rows = conn.query(sql, args).await?;
                let names: Vec<String> = (0..rows.column_count())
                    .map(|idx| rows.column_name(idx).unwrap_or_default().to_string())
                    .collect();

                let mut out = Vec::new();
                while let Some(row) = rows.next().await? {
                    let mut mapped = ResultRow::new();
                    for (idx, name) in names.iter().enumerate() {
                        let value = row.get_value(idx as i32)?;
                        mapped.insert(name.clone(), value_to_json(value));
                    }
                    out.push(mapped);
                }
                Ok(out)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row and parameter helpers
// ---------------------------------------------------------------------------

pub(super) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(super) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<Option<String>>(idx).ok().flatten()
}

pub(super) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or_default()
}

pub(super) fn get_opt_i64(row: &libsql::Row, idx: i32) -> Option<i64> {
    row.get::<Option<i64>>(idx).ok().flatten()
}

pub(super) fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(text) => libsql::Value::Text(text.to_string()),
        None => libsql::Value::Null,
    }
}

pub(super) fn opt_text_owned(value: Option<String>) -> libsql::Value {
    match value {
        Some(text) => libsql::Value::Text(text),
        None => libsql::Value::Null,
    }
}

pub(super) fn opt_i64(value: Option<i64>) -> libsql::Value {
    match value {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

pub(super) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a stored timestamp. Rows written by this backend always carry the
/// canonical format, but rows mirrored back from the remote normalizer may
/// have passed through other widths, so a couple of fallbacks are accepted.
pub(super) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|n| Utc.from_utc_datetime(&n))
}

pub(super) fn parse_dt_opt(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    match raw {
        Some(value) => parse_timestamp(&value)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

fn json_param(value: &serde_json::Value) -> libsql::Value {
    match value {
        serde_json::Value::Null => libsql::Value::Null,
        serde_json::Value::Bool(b) => libsql::Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => libsql::Value::Integer(i),
            None => libsql::Value::Real(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => libsql::Value::Text(s.clone()),
        other => libsql::Value::Text(other.to_string()),
    }
}

fn value_to_json(value: libsql::Value) -> serde_json::Value {
    match value {
        libsql::Value::Null => serde_json::Value::Null,
        libsql::Value::Integer(i) => serde_json::Value::from(i),
        libsql::Value::Real(f) => serde_json::Value::from(f),
        libsql::Value::Text(s) => serde_json::Value::String(s),
        // No blob columns in this schema; decode lossily rather than fail.
        libsql::Value::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}
