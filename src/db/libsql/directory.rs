use chrono::Utc;
use libsql::params;

use crate::db::{ChannelRecord, ChannelStore, MemberRecord, MemberStore, SummaryStore};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_i64, get_opt_text, get_text, opt_i64, opt_text,
    opt_text_owned, parse_dt_opt,
};

const MEMBER_COLUMNS: &str = "member_id, username, global_name, server_nick, avatar_url, bot, \
     role_ids, twitter_handle, instagram_handle, youtube_handle, website, sharing_consent, \
     dm_preference, guild_join_date, created_at, updated_at";

const UPSERT_MEMBER: &str = "INSERT INTO members \
     (member_id, username, global_name, server_nick, avatar_url, bot, role_ids, \
      twitter_handle, instagram_handle, youtube_handle, website, sharing_consent, \
      dm_preference, guild_join_date, created_at, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
     ON CONFLICT(member_id) DO UPDATE SET \
     username = excluded.username, global_name = excluded.global_name, \
     server_nick = excluded.server_nick, avatar_url = excluded.avatar_url, \
     bot = excluded.bot, role_ids = excluded.role_ids, \
     twitter_handle = excluded.twitter_handle, instagram_handle = excluded.instagram_handle, \
     youtube_handle = excluded.youtube_handle, website = excluded.website, \
     sharing_consent = excluded.sharing_consent, dm_preference = excluded.dm_preference, \
     guild_join_date = excluded.guild_join_date, created_at = excluded.created_at, \
     updated_at = excluded.updated_at";

const CHANNEL_COLUMNS: &str =
    "channel_id, channel_name, category_id, description, nsfw, enriched, setup_complete";

const UPSERT_CHANNEL: &str = "INSERT INTO channels \
     (channel_id, channel_name, category_id, description, nsfw, enriched, setup_complete) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
     ON CONFLICT(channel_id) DO UPDATE SET \
     channel_name = excluded.channel_name, category_id = excluded.category_id, \
     description = excluded.description, nsfw = excluded.nsfw, \
     enriched = excluded.enriched, setup_complete = excluded.setup_complete";

fn parse_string_array(raw: &str) -> Result<Vec<String>, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(parsed
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| entry.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default())
}

fn row_to_member_record(row: &libsql::Row) -> Result<MemberRecord, DatabaseError> {
    Ok(MemberRecord {
        member_id: get_i64(row, 0),
        username: get_text(row, 1),
        global_name: get_opt_text(row, 2),
        server_nick: get_opt_text(row, 3),
        avatar_url: get_opt_text(row, 4),
        bot: get_i64(row, 5) != 0,
        role_ids: parse_string_array(&get_text(row, 6))?,
        twitter_handle: get_opt_text(row, 7),
        instagram_handle: get_opt_text(row, 8),
        youtube_handle: get_opt_text(row, 9),
        website: get_opt_text(row, 10),
        sharing_consent: get_i64(row, 11) != 0,
        dm_preference: get_i64(row, 12) != 0,
        guild_join_date: parse_dt_opt(get_opt_text(row, 13))?,
        created_at: parse_dt_opt(get_opt_text(row, 14))?,
        updated_at: parse_dt_opt(get_opt_text(row, 15))?,
    })
}

fn row_to_channel_record(row: &libsql::Row) -> ChannelRecord {
    ChannelRecord {
        channel_id: get_i64(row, 0),
        channel_name: get_text(row, 1),
        category_id: get_opt_i64(row, 2),
        description: get_opt_text(row, 3),
        nsfw: get_i64(row, 4) != 0,
        enriched: get_i64(row, 5) != 0,
        setup_complete: get_i64(row, 6) != 0,
    }
}

#[async_trait::async_trait]
impl MemberStore for LibSqlBackend {
    async fn upsert_members(&self, members: &[MemberRecord]) -> Result<usize, DatabaseError> {
        if members.is_empty() {
            return Ok(0);
        }
        self.pool()
            .execute_with_retry(|conn| async move {
                conn.execute("BEGIN", ()).await?;
                let write_result = async {
                    for member in members {
                        let role_ids = serde_json::to_string(&member.role_ids)?;
                        conn.execute(
                            UPSERT_MEMBER,
                            params![
                                member.member_id,
                                member.username.as_str(),
                                opt_text(member.global_name.as_deref()),
                                opt_text(member.server_nick.as_deref()),
                                opt_text(member.avatar_url.as_deref()),
                                i64::from(member.bot),
                                role_ids,
                                opt_text(member.twitter_handle.as_deref()),
                                opt_text(member.instagram_handle.as_deref()),
                                opt_text(member.youtube_handle.as_deref()),
                                opt_text(member.website.as_deref()),
                                i64::from(member.sharing_consent),
                                i64::from(member.dm_preference),
                                opt_text_owned(member.guild_join_date.as_ref().map(fmt_ts)),
                                opt_text_owned(member.created_at.as_ref().map(fmt_ts)),
                                opt_text_owned(member.updated_at.as_ref().map(fmt_ts)),
                            ],
                        )
                        .await?;
                    }
                    Ok(members.len())
                }
                .await;

                match write_result {
                    Ok(count) => {
                        conn.execute("COMMIT", ()).await?;
                        Ok(count)
                    }
                    Err(err) => {
                        let _ = conn.execute("ROLLBACK", ()).await;
                        Err(err)
                    }
                }
            })
            .await
    }

    async fn get_member(&self, member_id: i64) -> Result<Option<MemberRecord>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        &format!(
                            "SELECT {MEMBER_COLUMNS} FROM members WHERE member_id = ?1 LIMIT 1"
                        ),
                        params![member_id],
                    )
                    .await?;
                match rows.next().await? {
                    Some(row) => Ok(Some(row_to_member_record(&row)?)),
                    None => Ok(None),
                }
            })
            .await
    }
}

#[async_trait::async_trait]
impl ChannelStore for LibSqlBackend {
    async fn upsert_channels(&self, channels: &[ChannelRecord]) -> Result<usize, DatabaseError> {
        if channels.is_empty() {
            return Ok(0);
        }
        self.pool()
            .execute_with_retry(|conn| async move {
                conn.execute("BEGIN", ()).await?;
                let write_result = async {
                    for channel in channels {
                        conn.execute(
                            UPSERT_CHANNEL,
                            params![
                                channel.channel_id,
                                channel.channel_name.as_str(),
                                opt_i64(channel.category_id),
                                opt_text(channel.description.as_deref()),
                                i64::from(channel.nsfw),
                                i64::from(channel.enriched),
                                i64::from(channel.setup_complete),
                            ],
                        )
                        .await?;
                    }
                    Ok(channels.len())
                }
                .await;

                match write_result {
                    Ok(count) => {
                        conn.execute("COMMIT", ()).await?;
                        Ok(count)
                    }
                    Err(err) => {
                        let _ = conn.execute("ROLLBACK", ()).await;
                        Err(err)
                    }
                }
            })
            .await
    }

    async fn get_channel(&self, channel_id: i64) -> Result<Option<ChannelRecord>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        &format!(
                            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE channel_id = ?1 LIMIT 1"
                        ),
                        params![channel_id],
                    )
                    .await?;
                Ok(rows.next().await?.map(|row| row_to_channel_record(&row)))
            })
            .await
    }

    async fn get_channels(&self) -> Result<Vec<ChannelRecord>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        &format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY channel_id ASC"),
                        (),
                    )
                    .await?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().await? {
                    out.push(row_to_channel_record(&row));
                }
                Ok(out)
            })
            .await
    }
}

#[async_trait::async_trait]
impl SummaryStore for LibSqlBackend {
    async fn get_summary_thread_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        "SELECT summary_thread_id FROM channel_summary \
                         WHERE channel_id = ?1 LIMIT 1",
                        params![channel_id],
                    )
                    .await?;
                match rows.next().await? {
                    Some(row) => Ok(get_opt_i64(&row, 0)),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn update_summary_thread(
        &self,
        channel_id: i64,
        thread_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                conn.execute(
                    "INSERT INTO channel_summary (channel_id, summary_thread_id, updated_at) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT(channel_id) DO UPDATE SET \
                     summary_thread_id = excluded.summary_thread_id, \
                     updated_at = excluded.updated_at",
                    params![channel_id, opt_i64(thread_id), fmt_ts(&Utc::now())],
                )
                .await?;
                Ok(())
            })
            .await
    }
}
