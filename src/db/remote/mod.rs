//! Remote REST storage backend.
//!
//! The remote store exposes per-table REST resources rather than a query
//! engine, so this backend has two faces: the typed store operations map
//! straight onto table requests, and the raw query surface goes through
//! [`translate`], which rebuilds relational semantics out of filtered
//! fetches and in-memory post-processing.

mod client;
mod normalize;
mod translate;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::warn;

use crate::config::RemoteConfig;
use crate::db::libsql::fmt_ts;
use crate::db::{
    ChannelRecord, ChannelStore, MemberRecord, MemberStore, MessageRecord, MessageStore,
    QuerySurface, ResultRow, SummaryStore, Translation,
};
use crate::error::DatabaseError;

use client::{RestClient, TableQuery};
use normalize::{
    channel_record_from_remote, member_record_from_remote, message_record_from_remote, value_as_i64,
};

pub(crate) const MESSAGES_TABLE: &str = "discord_messages";
pub(crate) const MEMBERS_TABLE: &str = "discord_members";
pub(crate) const CHANNELS_TABLE: &str = "discord_channels";
pub(crate) const SUMMARY_TABLE: &str = "channel_summary";

/// Rows sent per upsert round trip.
const WRITE_BATCH: usize = 100;

/// Store backend over the remote REST surface.
pub struct RestBackend {
    client: RestClient,
    page_size: usize,
}

impl RestBackend {
    pub fn new(config: &RemoteConfig) -> Result<Self, DatabaseError> {
        Ok(Self {
            client: RestClient::new(config)?,
            page_size: config.page_size,
        })
    }

    /// Translate relational query text and run it. The router calls this
    /// directly so an untranslatable shape stays distinguishable from a
    /// query that matched nothing.
    pub(crate) async fn translate_query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Translation, DatabaseError> {
        translate::execute(&self.client, self.page_size, sql, params).await
    }

    async fn fetch_messages(
        &self,
        query: TableQuery,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let rows = translate::fetch_paged(
            &self.client,
            MESSAGES_TABLE,
            &query,
            "message_id",
            self.page_size,
        )
        .await?;
        let mut records = rows
            .iter()
            .map(message_record_from_remote)
            .collect::<Result<Vec<_>, _>>()?;
        self.fill_author_names(&mut records).await?;
        Ok(records)
    }

    /// The remote message table has no denormalized author column, so the
    /// typed reads resolve display names from the member table afterwards.
    async fn fill_author_names(
        &self,
        records: &mut [MessageRecord],
    ) -> Result<(), DatabaseError> {
        let mut author_ids: Vec<i64> = records.iter().map(|m| m.author_id).collect();
        author_ids.sort_unstable();
        author_ids.dedup();
        if author_ids.is_empty() {
            return Ok(());
        }
        let names = translate::fetch_member_names(&self.client, &author_ids).await?;
        for record in records {
            record.author_name = names.get(&record.author_id).cloned();
        }
        Ok(())
    }

    /// Oldest (or newest, with `newest`) message timestamp in a channel.
    async fn edge_timestamp(
        &self,
        channel_id: i64,
        newest: bool,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let query = TableQuery::new()
            .select("created_at")
            .eq("channel_id", channel_id)
            .order("created_at", newest)
            .limit(1);
        let rows = self.client.select(MESSAGES_TABLE, &query).await?;
        rows.first()
            .and_then(|row| row.get("created_at"))
            .and_then(Value::as_str)
            .map(parse_remote_timestamp)
            .transpose()
    }
}

fn parse_remote_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    normalize::parse_flexible(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("unparseable timestamp '{raw}'")))
}

fn message_to_remote_row(message: &MessageRecord) -> Value {
    // No author_name field: the remote table stores identities only and
    // readers re-resolve display names from the member table.
    json!({
        "message_id": message.message_id,
        "channel_id": message.channel_id,
        "author_id": message.author_id,
        "content": message.content,
        "created_at": fmt_ts(&message.created_at),
        "edited_at": message.edited_at.as_ref().map(fmt_ts),
        "attachments": message.attachments,
        "embeds": message.embeds,
        "reaction_count": message.effective_reaction_count(),
        "reactors": message.reactors,
        "reference_id": message.reference_id,
        "thread_id": message.thread_id,
        "is_pinned": message.is_pinned,
        "message_type": message.message_type,
        "flags": message.flags,
        "is_deleted": message.is_deleted,
    })
}

fn member_to_remote_row(member: &MemberRecord) -> Value {
    json!({
        "member_id": member.member_id,
        "username": member.username,
        "global_name": member.global_name,
        "server_nick": member.server_nick,
        "avatar_url": member.avatar_url,
        "bot": member.bot,
        "role_ids": member.role_ids,
        "twitter_handle": member.twitter_handle,
        "instagram_handle": member.instagram_handle,
        "youtube_handle": member.youtube_handle,
        "website": member.website,
        "sharing_consent": member.sharing_consent,
        "dm_preference": member.dm_preference,
        "guild_join_date": member.guild_join_date.as_ref().map(fmt_ts),
        "created_at": member.created_at.as_ref().map(fmt_ts),
        "updated_at": member.updated_at.as_ref().map(fmt_ts),
    })
}

fn channel_to_remote_row(channel: &ChannelRecord) -> Value {
    json!({
        "channel_id": channel.channel_id,
        "channel_name": channel.channel_name,
        "category_id": channel.category_id,
        "description": channel.description,
        "nsfw": channel.nsfw,
        "enriched": channel.enriched,
        "setup_complete": channel.setup_complete,
    })
}

/// Distinct `YYYY-MM-DD` prefixes of the rows' timestamps, ascending.
fn distinct_day_prefixes(rows: &[Value]) -> Vec<String> {
    let mut days: Vec<String> = rows
        .iter()
        .filter_map(|row| row.get("created_at").and_then(Value::as_str))
        .map(|ts| ts.chars().take(10).collect())
        .collect();
    days.sort();
    days.dedup();
    days
}

#[async_trait::async_trait]
impl MessageStore for RestBackend {
    async fn store_messages(&self, messages: &[MessageRecord]) -> Result<usize, DatabaseError> {
        if messages.is_empty() {
            return Ok(0);
        }
        for chunk in messages.chunks(WRITE_BATCH) {
            let rows: Vec<Value> = chunk.iter().map(message_to_remote_row).collect();
            self.client
                .upsert(MESSAGES_TABLE, "message_id", &Value::Array(rows))
                .await?;
        }
        Ok(messages.len())
    }

    async fn get_last_message_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError> {
        let query = TableQuery::new()
            .select("message_id")
            .eq("channel_id", channel_id)
            .order("message_id", true)
            .limit(1);
        let rows = self.client.select(MESSAGES_TABLE, &query).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("message_id"))
            .and_then(value_as_i64))
    }

    async fn message_exists(&self, message_id: i64) -> Result<bool, DatabaseError> {
        let query = TableQuery::new()
            .select("message_id")
            .eq("message_id", message_id)
            .limit(1);
        let rows = self.client.select(MESSAGES_TABLE, &query).await?;
        Ok(!rows.is_empty())
    }

    async fn get_all_message_ids(&self, channel_id: i64) -> Result<Vec<i64>, DatabaseError> {
        let query = TableQuery::new()
            .select("message_id")
            .eq("channel_id", channel_id)
            .order("message_id", false);
        let rows = translate::fetch_paged(
            &self.client,
            MESSAGES_TABLE,
            &query,
            "message_id",
            self.page_size,
        )
        .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("message_id").and_then(value_as_i64))
            .collect())
    }

    async fn get_message_date_range(
        &self,
        channel_id: i64,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), DatabaseError> {
        let first = self.edge_timestamp(channel_id, false).await?;
        let last = self.edge_timestamp(channel_id, true).await?;
        Ok((first, last))
    }

    async fn get_messages_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let query = TableQuery::new()
            .gt("created_at", &fmt_ts(&after))
            .eq("is_deleted", false)
            .order("created_at", false);
        let mut records = self.fetch_messages(query).await?;
        records.sort_by_key(|m| m.created_at);
        Ok(records)
    }

    async fn get_messages_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut query = TableQuery::new()
            .gte("created_at", &fmt_ts(&start))
            .lte("created_at", &fmt_ts(&end))
            .eq("is_deleted", false)
            .order("created_at", false);
        if let Some(channel_id) = channel_id {
            query = query.eq("channel_id", channel_id);
        }
        let mut records = self.fetch_messages(query).await?;
        records.sort_by_key(|m| m.created_at);
        Ok(records)
    }

    async fn get_messages_by_authors_in_range(
        &self,
        author_ids: &[i64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        if author_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = TableQuery::new()
            .in_list("author_id", author_ids)
            .gte("created_at", &fmt_ts(&start))
            .lte("created_at", &fmt_ts(&end))
            .eq("is_deleted", false)
            .order("created_at", false);
        let mut records = self.fetch_messages(query).await?;
        records.sort_by_key(|m| m.created_at);
        Ok(records)
    }

    async fn get_messages_by_ids(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = TableQuery::new()
            .in_list("message_id", message_ids)
            .order("created_at", false);
        let mut records = self.fetch_messages(query).await?;
        records.sort_by_key(|m| m.created_at);
        Ok(records)
    }

    async fn get_message_dates(&self, channel_id: i64) -> Result<Vec<String>, DatabaseError> {
        let query = TableQuery::new()
            .select("message_id,created_at")
            .eq("channel_id", channel_id)
            .order("created_at", false);
        let rows = translate::fetch_paged(
            &self.client,
            MESSAGES_TABLE,
            &query,
            "message_id",
            self.page_size,
        )
        .await?;
        Ok(distinct_day_prefixes(&rows))
    }

    async fn search_messages(
        &self,
        query: &str,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        // No text index on the remote side; a case-insensitive substring
        // match is the closest the REST surface offers.
        let mut table_query = TableQuery::new()
            .ilike("content", &format!("%{query}%"))
            .eq("is_deleted", false);
        if let Some(channel_id) = channel_id {
            table_query = table_query.eq("channel_id", channel_id);
        }
        let mut records = self.fetch_messages(table_query).await?;
        records.sort_by_key(|m| std::cmp::Reverse(m.created_at));
        Ok(records)
    }
}

#[async_trait::async_trait]
impl MemberStore for RestBackend {
    async fn upsert_members(&self, members: &[MemberRecord]) -> Result<usize, DatabaseError> {
        if members.is_empty() {
            return Ok(0);
        }
        for chunk in members.chunks(WRITE_BATCH) {
            let rows: Vec<Value> = chunk.iter().map(member_to_remote_row).collect();
            self.client
                .upsert(MEMBERS_TABLE, "member_id", &Value::Array(rows))
                .await?;
        }
        Ok(members.len())
    }

    async fn get_member(&self, member_id: i64) -> Result<Option<MemberRecord>, DatabaseError> {
        let query = TableQuery::new().eq("member_id", member_id).limit(1);
        let rows = self.client.select(MEMBERS_TABLE, &query).await?;
        rows.first().map(member_record_from_remote).transpose()
    }
}

#[async_trait::async_trait]
impl ChannelStore for RestBackend {
    async fn upsert_channels(&self, channels: &[ChannelRecord]) -> Result<usize, DatabaseError> {
        if channels.is_empty() {
            return Ok(0);
        }
        for chunk in channels.chunks(WRITE_BATCH) {
            let rows: Vec<Value> = chunk.iter().map(channel_to_remote_row).collect();
            self.client
                .upsert(CHANNELS_TABLE, "channel_id", &Value::Array(rows))
                .await?;
        }
        Ok(channels.len())
    }

    async fn get_channel(&self, channel_id: i64) -> Result<Option<ChannelRecord>, DatabaseError> {
        let query = TableQuery::new().eq("channel_id", channel_id).limit(1);
        let rows = self.client.select(CHANNELS_TABLE, &query).await?;
        rows.first().map(channel_record_from_remote).transpose()
    }

    async fn get_channels(&self) -> Result<Vec<ChannelRecord>, DatabaseError> {
        let query = TableQuery::new().order("channel_id", false);
        let rows = translate::fetch_paged(
            &self.client,
            CHANNELS_TABLE,
            &query,
            "channel_id",
            self.page_size,
        )
        .await?;
        let mut channels = rows
            .iter()
            .map(channel_record_from_remote)
            .collect::<Result<Vec<_>, _>>()?;
        channels.sort_by_key(|c| c.channel_id);
        Ok(channels)
    }
}

#[async_trait::async_trait]
impl SummaryStore for RestBackend {
    async fn get_summary_thread_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError> {
        let query = TableQuery::new()
            .select("summary_thread_id")
            .eq("channel_id", channel_id)
            .limit(1);
        let rows = self.client.select(SUMMARY_TABLE, &query).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("summary_thread_id"))
            .and_then(value_as_i64))
    }

    async fn update_summary_thread(
        &self,
        channel_id: i64,
        thread_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let row = json!([{
            "channel_id": channel_id,
            "summary_thread_id": thread_id,
            "updated_at": fmt_ts(&Utc::now()),
        }]);
        self.client.upsert(SUMMARY_TABLE, "channel_id", &row).await
    }
}

#[async_trait::async_trait]
impl QuerySurface for RestBackend {
    async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<ResultRow>, DatabaseError> {
        match self.translate_query(sql, params).await? {
            Translation::Rows(rows) => Ok(rows),
            Translation::NotTranslatable(reason) => {
                // Standalone remote mode has nowhere to fall back to.
                warn!(reason, "query has no remote translation, returning no rows");
                Ok(Vec::new())
            }
        }
    }
}
