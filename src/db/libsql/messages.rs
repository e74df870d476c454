use libsql::params;

use crate::db::{Attachment, MessageRecord, MessageStore};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_i64, get_opt_text, get_text, opt_i64, opt_text,
    opt_text_owned, parse_dt_opt, parse_timestamp,
};

const MESSAGE_COLUMNS: &str = "message_id, channel_id, author_id, author_name, content, \
     created_at, edited_at, attachments, embeds, reaction_count, reactors, reference_id, \
     thread_id, is_pinned, message_type, flags, is_deleted";

const MESSAGE_COLUMNS_M: &str = "m.message_id, m.channel_id, m.author_id, m.author_name, \
     m.content, m.created_at, m.edited_at, m.attachments, m.embeds, m.reaction_count, \
     m.reactors, m.reference_id, m.thread_id, m.is_pinned, m.message_type, m.flags, \
     m.is_deleted";

const UPSERT_MESSAGE: &str = "INSERT INTO messages \
     (message_id, channel_id, author_id, author_name, content, created_at, edited_at, \
      attachments, embeds, reaction_count, reactors, reference_id, thread_id, is_pinned, \
      message_type, flags, is_deleted) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
     ON CONFLICT(message_id) DO UPDATE SET \
     channel_id = excluded.channel_id, author_id = excluded.author_id, \
     author_name = excluded.author_name, content = excluded.content, \
     created_at = excluded.created_at, edited_at = excluded.edited_at, \
     attachments = excluded.attachments, embeds = excluded.embeds, \
     reaction_count = excluded.reaction_count, reactors = excluded.reactors, \
     reference_id = excluded.reference_id, thread_id = excluded.thread_id, \
     is_pinned = excluded.is_pinned, message_type = excluded.message_type, \
     flags = excluded.flags, is_deleted = excluded.is_deleted";

fn parse_attachments(raw: &str) -> Result<Vec<Attachment>, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_id_array(raw: &str) -> Result<Vec<i64>, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(parsed
        .as_array()
        .map(|arr| arr.iter().filter_map(|entry| entry.as_i64()).collect())
        .unwrap_or_default())
}

fn parse_json_collection(raw: &str) -> Result<serde_json::Value, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!([]));
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    if value.is_object() || value.is_array() {
        Ok(value)
    } else {
        Ok(serde_json::json!([]))
    }
}

fn row_to_message_record(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    Ok(MessageRecord {
        message_id: get_i64(row, 0),
        channel_id: get_i64(row, 1),
        author_id: get_i64(row, 2),
        author_name: get_opt_text(row, 3),
        content: get_text(row, 4),
        created_at: parse_timestamp(&get_text(row, 5))
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        edited_at: parse_dt_opt(get_opt_text(row, 6))?,
        attachments: parse_attachments(&get_text(row, 7))?,
        embeds: parse_json_collection(&get_text(row, 8))?,
        reaction_count: get_i64(row, 9),
        reactors: parse_id_array(&get_text(row, 10))?,
        reference_id: get_opt_i64(row, 11),
        thread_id: get_opt_i64(row, 12),
        is_pinned: get_i64(row, 13) != 0,
        message_type: get_opt_text(row, 14),
        flags: get_i64(row, 15),
        is_deleted: get_i64(row, 16) != 0,
    })
}

fn in_list_marks(len: usize) -> String {
    vec!["?"; len].join(", ")
}

impl LibSqlBackend {
    async fn query_messages(
        &self,
        sql: &str,
        args: Vec<libsql::Value>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| {
                let args = args.clone();
                async move {
                    let mut rows = conn.query(sql, args).await?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next().await? {
                        out.push(row_to_message_record(&row)?);
                    }
                    Ok(out)
                }
            })
            .await
    }
}

#[async_trait::async_trait]
impl MessageStore for LibSqlBackend {
    async fn store_messages(&self, messages: &[MessageRecord]) -> Result<usize, DatabaseError> {
        if messages.is_empty() {
            return Ok(0);
        }
        self.pool()
            .execute_with_retry(|conn| async move {
                conn.execute("BEGIN", ()).await?;
                let write_result = async {
                    for message in messages {
                        let attachments = serde_json::to_string(&message.attachments)?;
                        let embeds = serde_json::to_string(&message.embeds)?;
                        let reactors = serde_json::to_string(&message.reactors)?;
                        conn.execute(
                            UPSERT_MESSAGE,
                            params![
                                message.message_id,
                                message.channel_id,
                                message.author_id,
                                opt_text(message.author_name.as_deref()),
                                message.content.as_str(),
                                fmt_ts(&message.created_at),
                                opt_text_owned(message.edited_at.as_ref().map(fmt_ts)),
                                attachments,
                                embeds,
                                message.effective_reaction_count(),
                                reactors,
                                opt_i64(message.reference_id),
                                opt_i64(message.thread_id),
                                i64::from(message.is_pinned),
                                opt_text(message.message_type.as_deref()),
                                message.flags,
                                i64::from(message.is_deleted),
                            ],
                        )
                        .await?;
                    }
                    Ok(messages.len())
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

    async fn get_last_message_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        "SELECT MAX(message_id) FROM messages WHERE channel_id = ?1",
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

    async fn message_exists(&self, message_id: i64) -> Result<bool, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        "SELECT 1 FROM messages WHERE message_id = ?1 LIMIT 1",
                        params![message_id],
                    )
                    .await?;
                Ok(rows.next().await?.is_some())
            })
            .await
    }

    async fn get_all_message_ids(&self, channel_id: i64) -> Result<Vec<i64>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        "SELECT message_id FROM messages WHERE channel_id = ?1 \
                         ORDER BY message_id ASC",
                        params![channel_id],
                    )
                    .await?;
                let mut ids = Vec::new();
                while let Some(row) = rows.next().await? {
                    ids.push(get_i64(&row, 0));
                }
                Ok(ids)
            })
            .await
    }

    async fn get_message_date_range(
        &self,
        channel_id: i64,
    ) -> Result<(Option<chrono::DateTime<chrono::Utc>>, Option<chrono::DateTime<chrono::Utc>>), DatabaseError>
    {
        self.pool()
            .execute_with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        "SELECT MIN(created_at), MAX(created_at) FROM messages \
                         WHERE channel_id = ?1",
                        params![channel_id],
                    )
                    .await?;
                match rows.next().await? {
                    Some(row) => Ok((
                        parse_dt_opt(get_opt_text(&row, 0))?,
                        parse_dt_opt(get_opt_text(&row, 1))?,
                    )),
                    None => Ok((None, None)),
                }
            })
            .await
    }

    async fn get_messages_after(
        &self,
        after: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE created_at > ? AND is_deleted = 0 ORDER BY created_at ASC"
        );
        self.query_messages(&sql, vec![libsql::Value::Text(fmt_ts(&after))])
            .await
    }

    async fn get_messages_in_range(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE created_at >= ? AND created_at <= ? AND is_deleted = 0"
        );
        let mut args = vec![
            libsql::Value::Text(fmt_ts(&start)),
            libsql::Value::Text(fmt_ts(&end)),
        ];
        if let Some(id) = channel_id {
            sql.push_str(" AND channel_id = ?");
            args.push(libsql::Value::Integer(id));
        }
        sql.push_str(" ORDER BY created_at ASC");
        self.query_messages(&sql, args).await
    }

    async fn get_messages_by_authors_in_range(
        &self,
        author_ids: &[i64],
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        if author_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE author_id IN ({}) AND created_at >= ? AND created_at <= ? \
             AND is_deleted = 0 ORDER BY created_at ASC",
            in_list_marks(author_ids.len())
        );
        let mut args: Vec<libsql::Value> = author_ids
            .iter()
            .map(|id| libsql::Value::Integer(*id))
            .collect();
        args.push(libsql::Value::Text(fmt_ts(&start)));
        args.push(libsql::Value::Text(fmt_ts(&end)));
        self.query_messages(&sql, args).await
    }

    async fn get_messages_by_ids(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id IN ({}) \
             ORDER BY created_at ASC",
            in_list_marks(message_ids.len())
        );
        let args: Vec<libsql::Value> = message_ids
            .iter()
            .map(|id| libsql::Value::Integer(*id))
            .collect();
        self.query_messages(&sql, args).await
    }

    async fn get_message_dates(&self, channel_id: i64) -> Result<Vec<String>, DatabaseError> {
        self.pool()
            .execute_with_retry(|conn| async move {
                // Canonical timestamps start with the date, so a prefix slice
                // is equivalent to DATE() here.
                let mut rows = conn
                    .query(
                        "SELECT DISTINCT substr(created_at, 1, 10) AS day FROM messages \
                         WHERE channel_id = ?1 ORDER BY day ASC",
                        params![channel_id],
                    )
                    .await?;
                let mut days = Vec::new();
                while let Some(row) = rows.next().await? {
                    days.push(get_text(&row, 0));
                }
                Ok(days)
            })
            .await
    }

    async fn search_messages(
        &self,
        query: &str,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        // Phrase-quote the input so user text can never be parsed as FTS
        // query syntax.
        let phrase = format!("\"{}\"", query.replace('"', "\"\""));
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS_M} FROM messages_fts f \
             JOIN messages m ON m.message_id = f.rowid \
             WHERE messages_fts MATCH ? AND m.is_deleted = 0"
        );
        let mut args = vec![libsql::Value::Text(phrase)];
        if let Some(id) = channel_id {
            sql.push_str(" AND m.channel_id = ?");
            args.push(libsql::Value::Integer(id));
        }
        sql.push_str(" ORDER BY rank");
        self.query_messages(&sql, args).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use crate::config::PoolConfig;

    use super::*;

    async fn test_backend() -> (tempfile::TempDir, LibSqlBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PoolConfig {
            size: 2,
            acquire_timeout: Duration::from_millis(500),
        };
        let backend = LibSqlBackend::open(&dir.path().join("archive.db"), config)
            .await
            .expect("backend opens");
        (dir, backend)
    }

    fn sample_message(message_id: i64, channel_id: i64, minute: u32) -> MessageRecord {
        MessageRecord {
            message_id,
            channel_id,
            author_id: 9000 + message_id,
            author_name: Some(format!("author-{message_id}")),
            content: format!("message {message_id} content"),
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 12, minute, 0).unwrap(),
            edited_at: None,
            attachments: Vec::new(),
            embeds: serde_json::json!([]),
            reaction_count: 0,
            reactors: Vec::new(),
            reference_id: None,
            thread_id: None,
            is_pinned: false,
            message_type: Some("default".to_string()),
            flags: 0,
            is_deleted: false,
        }
    }

    fn day_range() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 23, 59, 59).unwrap(),
        )
    }

    #[tokio::test]
    async fn store_and_read_back_round_trip() {
        let (_dir, backend) = test_backend().await;

        let mut first = sample_message(101, 7, 0);
        first.attachments = vec![Attachment {
            url: "https://cdn.example/a.png".to_string(),
            filename: "a.png".to_string(),
        }];
        first.reactors = vec![1, 2, 3];
        first.reaction_count = 3;
        first.edited_at = Some(Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap());
        let second = sample_message(102, 7, 5);

        let written = backend
            .store_messages(&[first.clone(), second.clone()])
            .await
            .expect("store");
        assert_eq!(written, 2);

        let (start, end) = day_range();
        let fetched = backend
            .get_messages_in_range(start, end, Some(7))
            .await
            .expect("fetch");
        assert_eq!(fetched, vec![first, second]);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let (_dir, backend) = test_backend().await;

        let mut message = sample_message(201, 7, 0);
        backend
            .store_messages(std::slice::from_ref(&message))
            .await
            .expect("first store");

        message.content = "edited body".to_string();
        message.reactors = vec![11, 12];
        message.reaction_count = 2;
        backend
            .store_messages(std::slice::from_ref(&message))
            .await
            .expect("second store");

        let fetched = backend
            .get_messages_by_ids(&[201])
            .await
            .expect("fetch by id");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].content, "edited body");
        assert_eq!(fetched[0].reaction_count, 2);
    }

    #[tokio::test]
    async fn reactor_list_wins_over_stale_count() {
        let (_dir, backend) = test_backend().await;

        let mut message = sample_message(202, 7, 0);
        message.reactors = vec![5, 6, 7, 8];
        message.reaction_count = 1; // stale value from the gateway payload
        backend
            .store_messages(std::slice::from_ref(&message))
            .await
            .expect("store");

        let fetched = backend.get_messages_by_ids(&[202]).await.expect("fetch");
        assert_eq!(fetched[0].reaction_count, 4);
    }

    #[tokio::test]
    async fn last_message_id_is_per_channel() {
        let (_dir, backend) = test_backend().await;
        backend
            .store_messages(&[
                sample_message(301, 7, 0),
                sample_message(305, 7, 1),
                sample_message(999, 8, 2),
            ])
            .await
            .expect("store");

        assert_eq!(
            backend.get_last_message_id(7).await.expect("channel 7"),
            Some(305)
        );
        assert_eq!(
            backend.get_last_message_id(8).await.expect("channel 8"),
            Some(999)
        );
        assert_eq!(backend.get_last_message_id(9).await.expect("empty"), None);
    }

    #[tokio::test]
    async fn existence_and_id_listing() {
        let (_dir, backend) = test_backend().await;
        backend
            .store_messages(&[sample_message(402, 7, 1), sample_message(401, 7, 0)])
            .await
            .expect("store");

        assert!(backend.message_exists(401).await.expect("exists"));
        assert!(!backend.message_exists(555).await.expect("missing"));
        assert_eq!(
            backend.get_all_message_ids(7).await.expect("ids"),
            vec![401, 402]
        );
    }

    #[tokio::test]
    async fn date_range_and_distinct_dates() {
        let (_dir, backend) = test_backend().await;
        let mut late = sample_message(502, 7, 0);
        late.created_at = Utc.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap();
        backend
            .store_messages(&[sample_message(501, 7, 15), sample_message(503, 7, 45), late])
            .await
            .expect("store");

        let (oldest, newest) = backend.get_message_date_range(7).await.expect("range");
        assert_eq!(oldest, Some(Utc.with_ymd_and_hms(2024, 3, 5, 12, 15, 0).unwrap()));
        assert_eq!(newest, Some(Utc.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap()));

        assert_eq!(
            backend.get_message_dates(7).await.expect("dates"),
            vec!["2024-03-05".to_string(), "2024-03-06".to_string()]
        );
    }

    #[tokio::test]
    async fn range_and_author_filters() {
        let (_dir, backend) = test_backend().await;
        backend
            .store_messages(&[
                sample_message(601, 7, 0),
                sample_message(602, 7, 20),
                sample_message(603, 8, 10),
            ])
            .await
            .expect("store");

        let (start, _) = day_range();
        let until = Utc.with_ymd_and_hms(2024, 3, 5, 12, 10, 0).unwrap();
        let early = backend
            .get_messages_in_range(start, until, None)
            .await
            .expect("early");
        assert_eq!(
            early.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![601, 603]
        );

        let (start, end) = day_range();
        let by_author = backend
            .get_messages_by_authors_in_range(&[9601, 9603], start, end)
            .await
            .expect("authors");
        assert_eq!(
            by_author.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![601, 603]
        );

        let after = backend
            .get_messages_after(Utc.with_ymd_and_hms(2024, 3, 5, 12, 5, 0).unwrap())
            .await
            .expect("after");
        assert_eq!(
            after.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![603, 602]
        );
    }

    #[tokio::test]
    async fn soft_deleted_rows_hidden_from_content_reads() {
        let (_dir, backend) = test_backend().await;
        let mut gone = sample_message(701, 7, 5);
        gone.is_deleted = true;
        backend
            .store_messages(&[sample_message(700, 7, 0), gone])
            .await
            .expect("store");

        let (start, end) = day_range();
        let visible = backend
            .get_messages_in_range(start, end, Some(7))
            .await
            .expect("fetch");
        assert_eq!(
            visible.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![700]
        );

        // Coverage accessors still see the row.
        assert!(backend.message_exists(701).await.expect("exists"));
        assert_eq!(
            backend.get_all_message_ids(7).await.expect("ids"),
            vec![700, 701]
        );
    }

    #[tokio::test]
    async fn search_matches_content_and_respects_channel() {
        let (_dir, backend) = test_backend().await;
        let mut hit = sample_message(801, 7, 0);
        hit.content = "the heron photography contest starts today".to_string();
        let mut other_channel = sample_message(802, 8, 1);
        other_channel.content = "heron sightings welcome".to_string();
        let mut miss = sample_message(803, 7, 2);
        miss.content = "completely unrelated".to_string();
        backend
            .store_messages(&[hit, other_channel, miss])
            .await
            .expect("store");

        let all = backend.search_messages("heron", None).await.expect("search");
        let mut ids: Vec<i64> = all.iter().map(|m| m.message_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![801, 802]);

        let scoped = backend
            .search_messages("heron", Some(7))
            .await
            .expect("scoped search");
        assert_eq!(
            scoped.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![801]
        );

        // Embedded quotes must not break the match expression.
        let quoted = backend
            .search_messages("\"heron\"", None)
            .await
            .expect("quoted search");
        assert_eq!(quoted.len(), 2);
    }

    #[tokio::test]
    async fn empty_batches_are_no_ops() {
        let (_dir, backend) = test_backend().await;
        assert_eq!(backend.store_messages(&[]).await.expect("store"), 0);
        assert!(backend.get_messages_by_ids(&[]).await.expect("ids").is_empty());
        let (start, end) = day_range();
        assert!(
            backend
                .get_messages_by_authors_in_range(&[], start, end)
                .await
                .expect("authors")
                .is_empty()
        );
    }
}
