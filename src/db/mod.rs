//! Storage abstraction for the archive.
//!
//! Two backends sit behind one trait surface: the embedded libSQL engine
//! (pooled, retried on contention) and the remote REST store (reached through
//! the query translator). [`connect_from_config`] resolves the configured
//! storage mode into an [`router::ArchiveDb`] that routes every operation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ArchiveConfig, ConfigError};
use crate::error::DatabaseError;

pub mod libsql;
pub mod pool;
pub mod remote;
pub mod router;

pub use router::ArchiveDb;

/// One result row from the raw query surface: column name to value, in the
/// embedded engine's value encoding (timestamps and JSON collections as text).
pub type ResultRow = serde_json::Map<String, serde_json::Value>;

/// Outcome of translating relational query text into REST calls.
///
/// `NotTranslatable` is deliberately distinct from an empty row set: a
/// recognized shape that matches nothing returns `Rows(vec![])`, while an
/// unrecognized shape returns `NotTranslatable` and the router decides
/// whether a fallback path exists.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Rows(Vec<ResultRow>),
    NotTranslatable(&'static str),
}

/// Build the archive store the resolved configuration asks for.
///
/// Fatal configuration problems (a remote mode without credentials) surface
/// here, never at call time.
pub async fn connect_from_config(config: &ArchiveConfig) -> Result<Arc<ArchiveDb>, DatabaseError> {
    let embedded = if config.mode.uses_embedded() {
        Some(Arc::new(
            libsql::LibSqlBackend::open(&config.db_path, config.pool.clone()).await?,
        ))
    } else {
        None
    };

    let remote = if config.mode.uses_remote() {
        let remote_cfg = config.remote.as_ref().ok_or(DatabaseError::Config(
            ConfigError::MissingVar {
                key: crate::config::REMOTE_STORE_URL,
            },
        ))?;
        Some(Arc::new(remote::RestBackend::new(remote_cfg)?))
    } else {
        None
    };

    info!("archive store connected in {} mode", config.mode.as_str());
    Ok(Arc::new(ArchiveDb::new(config.mode, embedded, remote)))
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One uploaded file on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
}

/// An archived chat message. JSON collections keep their decoded form here;
/// both backends serialize them to text/JSON at their own boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: i64,
    pub channel_id: i64,
    pub author_id: i64,
    /// Denormalized display name, resolved at write time.
    pub author_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    /// Raw embed payloads, kept opaque.
    pub embeds: serde_json::Value,
    pub reaction_count: i64,
    /// Ids of members who reacted at least once.
    pub reactors: Vec<i64>,
    pub reference_id: Option<i64>,
    pub thread_id: Option<i64>,
    pub is_pinned: bool,
    pub message_type: Option<String>,
    pub flags: i64,
    pub is_deleted: bool,
}

impl MessageRecord {
    /// Reaction count as written: when a reactor list is present it wins, so
    /// the stored count always equals the list's cardinality.
    pub fn effective_reaction_count(&self) -> i64 {
        if self.reactors.is_empty() {
            self.reaction_count
        } else {
            self.reactors.len() as i64
        }
    }
}

/// A guild member as the archive tracks them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: i64,
    pub username: String,
    pub global_name: Option<String>,
    pub server_nick: Option<String>,
    pub avatar_url: Option<String>,
    pub bot: bool,
    pub role_ids: Vec<String>,
    pub twitter_handle: Option<String>,
    pub instagram_handle: Option<String>,
    pub youtube_handle: Option<String>,
    pub website: Option<String>,
    pub sharing_consent: bool,
    pub dm_preference: bool,
    pub guild_join_date: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MemberRecord {
    /// Display-name precedence: server nickname, then global name, then
    /// username.
    pub fn display_name(&self) -> &str {
        self.server_nick
            .as_deref()
            .or(self.global_name.as_deref())
            .unwrap_or(&self.username)
    }
}

/// A channel (or category) in the guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: i64,
    pub channel_name: String,
    /// Parent category's channel id, when the channel lives inside one.
    pub category_id: Option<i64>,
    pub description: Option<String>,
    pub nsfw: bool,
    pub enriched: bool,
    pub setup_complete: bool,
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MessageStore {
    /// Upsert a batch; returns the number of rows written.
    async fn store_messages(&self, messages: &[MessageRecord]) -> Result<usize, DatabaseError>;

    /// Highest message id seen in a channel.
    async fn get_last_message_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError>;

    async fn message_exists(&self, message_id: i64) -> Result<bool, DatabaseError>;

    async fn get_all_message_ids(&self, channel_id: i64) -> Result<Vec<i64>, DatabaseError>;

    /// Oldest and newest message timestamps in a channel.
    async fn get_message_date_range(
        &self,
        channel_id: i64,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), DatabaseError>;

    async fn get_messages_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    async fn get_messages_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    async fn get_messages_by_authors_in_range(
        &self,
        author_ids: &[i64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    async fn get_messages_by_ids(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    /// Distinct `YYYY-MM-DD` dates with at least one message, ascending.
    async fn get_message_dates(&self, channel_id: i64) -> Result<Vec<String>, DatabaseError>;

    /// Full-text search over message content.
    async fn search_messages(
        &self,
        query: &str,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;
}

#[async_trait]
pub trait MemberStore {
    async fn upsert_members(&self, members: &[MemberRecord]) -> Result<usize, DatabaseError>;

    async fn get_member(&self, member_id: i64) -> Result<Option<MemberRecord>, DatabaseError>;
}

#[async_trait]
pub trait ChannelStore {
    async fn upsert_channels(&self, channels: &[ChannelRecord]) -> Result<usize, DatabaseError>;

    async fn get_channel(&self, channel_id: i64) -> Result<Option<ChannelRecord>, DatabaseError>;

    async fn get_channels(&self) -> Result<Vec<ChannelRecord>, DatabaseError>;
}

#[async_trait]
pub trait SummaryStore {
    /// Latest summary thread recorded for a channel.
    async fn get_summary_thread_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError>;

    /// Record (or clear, with `None`) the summary thread for a channel.
    async fn update_summary_thread(
        &self,
        channel_id: i64,
        thread_id: Option<i64>,
    ) -> Result<(), DatabaseError>;
}

/// Catch-all accessor for callers that already hold relational query text
/// written against the embedded schema.
#[async_trait]
pub trait QuerySurface {
    async fn execute_query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<ResultRow>, DatabaseError>;
}

/// The full operation surface the rest of the bot programs against.
pub trait ArchiveStore:
    MessageStore + MemberStore + ChannelStore + SummaryStore + QuerySurface + Send + Sync
{
}

impl<T> ArchiveStore for T where
    T: MessageStore + MemberStore + ChannelStore + SummaryStore + QuerySurface + Send + Sync
{
}
