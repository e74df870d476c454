//! Mode-driven routing between the embedded and remote backends.
//!
//! The storage mode is resolved into a [`DispatchPlan`] exactly once, at
//! construction. Reads prefer the remote store and fall back to the embedded
//! engine on any remote failure; writes fan out to every active backend and
//! a partial failure is logged, never rolled back.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, warn};

use crate::config::StorageMode;
use crate::db::libsql::LibSqlBackend;
use crate::db::remote::RestBackend;
use crate::db::{
    ChannelRecord, ChannelStore, MemberRecord, MemberStore, MessageRecord, MessageStore,
    QuerySurface, ResultRow, SummaryStore, Translation,
};
use crate::error::DatabaseError;

/// Which backends take part in each operation. Fixed for the lifetime of
/// the router; no per-call mode decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchPlan {
    EmbeddedOnly,
    RemoteOnly,
    RemoteFirst,
}

/// The routing facade the rest of the bot holds.
pub struct ArchiveDb {
    plan: DispatchPlan,
    embedded: Option<Arc<LibSqlBackend>>,
    remote: Option<Arc<RestBackend>>,
}

impl ArchiveDb {
    pub fn new(
        mode: StorageMode,
        embedded: Option<Arc<LibSqlBackend>>,
        remote: Option<Arc<RestBackend>>,
    ) -> Self {
        let plan = match mode {
            StorageMode::Embedded => DispatchPlan::EmbeddedOnly,
            StorageMode::Remote => DispatchPlan::RemoteOnly,
            StorageMode::Both => DispatchPlan::RemoteFirst,
        };
        Self {
            plan,
            embedded,
            remote,
        }
    }

    fn embedded_arc(&self) -> Result<Arc<LibSqlBackend>, DatabaseError> {
        self.embedded
            .clone()
            .ok_or_else(|| DatabaseError::Pool("embedded store not configured".to_string()))
    }

    fn remote_arc(&self) -> Result<Arc<RestBackend>, DatabaseError> {
        self.remote
            .clone()
            .ok_or_else(|| DatabaseError::Remote("remote store not configured".to_string()))
    }

    /// Route one read. Remote-first plans fall back to the embedded engine
    /// whenever the remote side errors.
    async fn read<T, RF, EF, RFut, EFut>(
        &self,
        op: &'static str,
        remote_op: RF,
        embedded_op: EF,
    ) -> Result<T, DatabaseError>
    where
        RF: FnOnce(Arc<RestBackend>) -> RFut,
        EF: FnOnce(Arc<LibSqlBackend>) -> EFut,
        RFut: Future<Output = Result<T, DatabaseError>>,
        EFut: Future<Output = Result<T, DatabaseError>>,
    {
        match self.plan {
            DispatchPlan::EmbeddedOnly => embedded_op(self.embedded_arc()?).await,
            DispatchPlan::RemoteOnly => remote_op(self.remote_arc()?).await,
            DispatchPlan::RemoteFirst => match self.remote.clone() {
                Some(remote) => match remote_op(remote).await {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        warn!(op, error = %err, "remote read failed, falling back to embedded");
                        embedded_op(self.embedded_arc()?).await
                    }
                },
                None => embedded_op(self.embedded_arc()?).await,
            },
        }
    }

    /// Route one write. Fan-out plans run both sides; one success carries
    /// the call, and losing one side is logged rather than rolled back.
    async fn write<T, RF, EF, RFut, EFut>(
        &self,
        op: &'static str,
        remote_op: RF,
        embedded_op: EF,
    ) -> Result<T, DatabaseError>
    where
        RF: FnOnce(Arc<RestBackend>) -> RFut,
        EF: FnOnce(Arc<LibSqlBackend>) -> EFut,
        RFut: Future<Output = Result<T, DatabaseError>>,
        EFut: Future<Output = Result<T, DatabaseError>>,
    {
        match self.plan {
            DispatchPlan::EmbeddedOnly => embedded_op(self.embedded_arc()?).await,
            DispatchPlan::RemoteOnly => remote_op(self.remote_arc()?).await,
            DispatchPlan::RemoteFirst => {
                let embedded_result = match self.embedded_arc() {
                    Ok(embedded) => embedded_op(embedded).await,
                    Err(err) => Err(err),
                };
                let remote_result = match self.remote_arc() {
                    Ok(remote) => remote_op(remote).await,
                    Err(err) => Err(err),
                };
                match (embedded_result, remote_result) {
                    (Ok(value), Ok(_)) => Ok(value),
                    (Ok(value), Err(err)) => {
                        warn!(op, error = %err, "remote write failed, kept embedded write");
                        Ok(value)
                    }
                    (Err(err), Ok(value)) => {
                        warn!(op, error = %err, "embedded write failed, kept remote write");
                        Ok(value)
                    }
                    (Err(embedded_err), Err(remote_err)) => {
                        error!(
                            op,
                            embedded = %embedded_err,
                            remote = %remote_err,
                            "write failed on every backend"
                        );
                        Err(embedded_err)
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageStore for ArchiveDb {
    async fn store_messages(&self, messages: &[MessageRecord]) -> Result<usize, DatabaseError> {
        self.write(
            "store_messages",
            |remote| async move { remote.store_messages(messages).await },
            |embedded| async move { embedded.store_messages(messages).await },
        )
        .await
    }

    async fn get_last_message_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError> {
        self.read(
            "get_last_message_id",
            |remote| async move { remote.get_last_message_id(channel_id).await },
            |embedded| async move { embedded.get_last_message_id(channel_id).await },
        )
        .await
    }

    async fn message_exists(&self, message_id: i64) -> Result<bool, DatabaseError> {
        self.read(
            "message_exists",
            |remote| async move { remote.message_exists(message_id).await },
            |embedded| async move { embedded.message_exists(message_id).await },
        )
        .await
    }

    async fn get_all_message_ids(&self, channel_id: i64) -> Result<Vec<i64>, DatabaseError> {
        self.read(
            "get_all_message_ids",
            |remote| async move { remote.get_all_message_ids(channel_id).await },
            |embedded| async move { embedded.get_all_message_ids(channel_id).await },
        )
        .await
    }

    async fn get_message_date_range(
        &self,
        channel_id: i64,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), DatabaseError> {
        self.read(
            "get_message_date_range",
            |remote| async move { remote.get_message_date_range(channel_id).await },
            |embedded| async move { embedded.get_message_date_range(channel_id).await },
        )
        .await
    }

    async fn get_messages_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.read(
            "get_messages_after",
            |remote| async move { remote.get_messages_after(after).await },
            |embedded| async move { embedded.get_messages_after(after).await },
        )
        .await
    }

    async fn get_messages_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.read(
            "get_messages_in_range",
            |remote| async move { remote.get_messages_in_range(start, end, channel_id).await },
            |embedded| async move { embedded.get_messages_in_range(start, end, channel_id).await },
        )
        .await
    }

    async fn get_messages_by_authors_in_range(
        &self,
        author_ids: &[i64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.read(
            "get_messages_by_authors_in_range",
            |remote| async move {
                remote
                    .get_messages_by_authors_in_range(author_ids, start, end)
                    .await
            },
            |embedded| async move {
                embedded
                    .get_messages_by_authors_in_range(author_ids, start, end)
                    .await
            },
        )
        .await
    }

    async fn get_messages_by_ids(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.read(
            "get_messages_by_ids",
            |remote| async move { remote.get_messages_by_ids(message_ids).await },
            |embedded| async move { embedded.get_messages_by_ids(message_ids).await },
        )
        .await
    }

    async fn get_message_dates(&self, channel_id: i64) -> Result<Vec<String>, DatabaseError> {
        self.read(
            "get_message_dates",
            |remote| async move { remote.get_message_dates(channel_id).await },
            |embedded| async move { embedded.get_message_dates(channel_id).await },
        )
        .await
    }

    async fn search_messages(
        &self,
        query: &str,
        channel_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.read(
            "search_messages",
            |remote| async move { remote.search_messages(query, channel_id).await },
            |embedded| async move { embedded.search_messages(query, channel_id).await },
        )
        .await
    }
}

#[async_trait::async_trait]
impl MemberStore for ArchiveDb {
    async fn upsert_members(&self, members: &[MemberRecord]) -> Result<usize, DatabaseError> {
        self.write(
            "upsert_members",
            |remote| async move { remote.upsert_members(members).await },
            |embedded| async move { embedded.upsert_members(members).await },
        )
        .await
    }

    async fn get_member(&self, member_id: i64) -> Result<Option<MemberRecord>, DatabaseError> {
        self.read(
            "get_member",
            |remote| async move { remote.get_member(member_id).await },
            |embedded| async move { embedded.get_member(member_id).await },
        )
        .await
    }
}

#[async_trait::async_trait]
impl ChannelStore for ArchiveDb {
    async fn upsert_channels(&self, channels: &[ChannelRecord]) -> Result<usize, DatabaseError> {
        self.write(
            "upsert_channels",
            |remote| async move { remote.upsert_channels(channels).await },
            |embedded| async move { embedded.upsert_channels(channels).await },
        )
        .await
    }

    async fn get_channel(&self, channel_id: i64) -> Result<Option<ChannelRecord>, DatabaseError> {
        self.read(
            "get_channel",
            |remote| async move { remote.get_channel(channel_id).await },
            |embedded| async move { embedded.get_channel(channel_id).await },
        )
        .await
    }

    async fn get_channels(&self) -> Result<Vec<ChannelRecord>, DatabaseError> {
        self.read(
            "get_channels",
            |remote| async move { remote.get_channels().await },
            |embedded| async move { embedded.get_channels().await },
        )
        .await
    }
}

#[async_trait::async_trait]
impl SummaryStore for ArchiveDb {
    async fn get_summary_thread_id(&self, channel_id: i64) -> Result<Option<i64>, DatabaseError> {
        self.read(
            "get_summary_thread_id",
            |remote| async move { remote.get_summary_thread_id(channel_id).await },
            |embedded| async move { embedded.get_summary_thread_id(channel_id).await },
        )
        .await
    }

    async fn update_summary_thread(
        &self,
        channel_id: i64,
        thread_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        self.write(
            "update_summary_thread",
            |remote| async move { remote.update_summary_thread(channel_id, thread_id).await },
            |embedded| async move { embedded.update_summary_thread(channel_id, thread_id).await },
        )
        .await
    }
}

#[async_trait::async_trait]
impl QuerySurface for ArchiveDb {
    async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<ResultRow>, DatabaseError> {
        match self.plan {
            DispatchPlan::EmbeddedOnly => self.embedded_arc()?.execute_query(sql, params).await,
            DispatchPlan::RemoteOnly => self.remote_arc()?.execute_query(sql, params).await,
            DispatchPlan::RemoteFirst => {
                let remote = match self.remote.clone() {
                    Some(remote) => remote,
                    None => return self.embedded_arc()?.execute_query(sql, params).await,
                };
                match remote.translate_query(sql, params).await {
                    Ok(Translation::Rows(rows)) => Ok(rows),
                    Ok(Translation::NotTranslatable(reason)) => {
                        warn!(reason, "query has no remote translation, using embedded engine");
                        self.embedded_arc()?.execute_query(sql, params).await
                    }
                    Err(err) => {
                        warn!(error = %err, "remote query failed, falling back to embedded engine");
                        self.embedded_arc()?.execute_query(sql, params).await
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone as _;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;
    use serde_json::json;
    use url::Url;

    use crate::config::{PoolConfig, RemoteConfig};

    use super::*;

    async fn embedded_backend(dir: &tempfile::TempDir) -> Arc<LibSqlBackend> {
        let path = dir.path().join("router.db");
        Arc::new(
            LibSqlBackend::open(&path, PoolConfig::default())
                .await
                .expect("open embedded backend"),
        )
    }

    /// A remote backend pointed at a port nothing listens on; every call
    /// errors fast with a connect failure.
    fn unreachable_remote() -> Arc<RestBackend> {
        let config = RemoteConfig {
            url: Url::parse("http://127.0.0.1:9/").expect("static url"),
            service_key: SecretString::from("test-key".to_string()),
            request_timeout: Duration::from_millis(500),
            page_size: 50,
        };
        Arc::new(RestBackend::new(&config).expect("build remote backend"))
    }

    fn sample_message(id: i64) -> MessageRecord {
        MessageRecord {
            message_id: id,
            channel_id: 42,
            author_id: 7,
            author_name: Some("Echo".to_string()),
            content: format!("message {id}"),
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
            edited_at: None,
            attachments: Vec::new(),
            embeds: json!([]),
            reaction_count: 0,
            reactors: Vec::new(),
            reference_id: None,
            thread_id: None,
            is_pinned: false,
            message_type: None,
            flags: 0,
            is_deleted: false,
        }
    }

    #[test]
    fn mode_resolves_to_a_fixed_plan() {
        let dispatch = |mode| ArchiveDb::new(mode, None, None).plan;
        assert_eq!(dispatch(StorageMode::Embedded), DispatchPlan::EmbeddedOnly);
        assert_eq!(dispatch(StorageMode::Remote), DispatchPlan::RemoteOnly);
        assert_eq!(dispatch(StorageMode::Both), DispatchPlan::RemoteFirst);
    }

    #[tokio::test]
    async fn embedded_only_round_trips_through_the_router() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = ArchiveDb::new(
            StorageMode::Embedded,
            Some(embedded_backend(&dir).await),
            None,
        );

        let written = db.store_messages(&[sample_message(1)]).await.expect("write");
        assert_eq!(written, 1);
        assert_eq!(db.get_last_message_id(42).await.expect("read"), Some(1));

        let rows = db
            .execute_query("SELECT COUNT(*) AS n FROM messages", &[])
            .await
            .expect("raw query");
        assert_eq!(rows[0]["n"], json!(1));
    }

    #[tokio::test]
    async fn remote_first_reads_fall_back_when_remote_is_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let embedded = embedded_backend(&dir).await;
        embedded
            .store_messages(&[sample_message(5)])
            .await
            .expect("seed embedded");

        let db = ArchiveDb::new(StorageMode::Both, Some(embedded), Some(unreachable_remote()));
        let records = db.get_messages_by_ids(&[5]).await.expect("fallback read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_id, 5);
    }

    #[tokio::test]
    async fn remote_first_writes_survive_a_failing_side() {
        let dir = tempfile::tempdir().expect("tempdir");
        let embedded = embedded_backend(&dir).await;
        let db = ArchiveDb::new(
            StorageMode::Both,
            Some(embedded.clone()),
            Some(unreachable_remote()),
        );

        let written = db.store_messages(&[sample_message(9)]).await.expect("write");
        assert_eq!(written, 1);
        assert!(embedded.message_exists(9).await.expect("check embedded"));
    }

    #[tokio::test]
    async fn remote_only_surfaces_remote_errors() {
        let db = ArchiveDb::new(StorageMode::Remote, None, Some(unreachable_remote()));
        let err = db.get_member(1).await.expect_err("remote is down");
        assert!(matches!(err, DatabaseError::Remote(_)));
    }

    #[tokio::test]
    async fn untranslatable_query_uses_embedded_without_touching_remote() {
        let dir = tempfile::tempdir().expect("tempdir");
        let embedded = embedded_backend(&dir).await;
        let db = ArchiveDb::new(
            StorageMode::Both,
            Some(embedded),
            Some(unreachable_remote()),
        );
        db.update_summary_thread(77, Some(555)).await.expect("write");

        // Shape classification rejects this text outright, so the router
        // goes straight to the embedded engine; no remote round trip, no
        // fallback error.
        let rows = db
            .execute_query(
                "SELECT summary_thread_id FROM channel_summary WHERE channel_id = 77",
                &[],
            )
            .await
            .expect("fallback query");
        assert_eq!(rows[0]["summary_thread_id"], json!(555));
    }
}
