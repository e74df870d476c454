//! Thin REST client for the remote store.
//!
//! The remote store speaks a resource-per-table protocol: filters, ordering
//! and range selection ride in the query string, authentication in headers.
//! [`TableQuery`] builds the filter pairs so the encoding stays testable
//! without a live endpoint.

use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::config::RemoteConfig;
use crate::error::DatabaseError;

/// How much of an error body is kept in the error message.
const ERROR_BODY_LIMIT: usize = 200;

pub(crate) struct RestClient {
    http: reqwest::Client,
    base: Url,
    service_key: SecretString,
}

impl RestClient {
    pub(crate) fn new(config: &RemoteConfig) -> Result<Self, DatabaseError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let base = config
            .url
            .join("rest/v1/")
            .map_err(|e| DatabaseError::Remote(format!("invalid remote url: {e}")))?;
        Ok(Self {
            http,
            base,
            service_key: config.service_key.clone(),
        })
    }

    fn endpoint(&self, table: &str) -> Result<Url, DatabaseError> {
        self.base
            .join(table)
            .map_err(|e| DatabaseError::Remote(format!("invalid table '{table}': {e}")))
    }

    /// Fetch rows from one table. Returns the decoded JSON row objects.
    pub(crate) async fn select(
        &self,
        table: &str,
        query: &TableQuery,
    ) -> Result<Vec<serde_json::Value>, DatabaseError> {
        let response = self
            .http
            .get(self.endpoint(table)?)
            .header("apikey", self.service_key.expose_secret())
            .bearer_auth(self.service_key.expose_secret())
            .query(query.pairs())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DatabaseError::Remote(format!(
                "select {table} failed: {status}: {}",
                truncate(&body)
            )));
        }
        Ok(response.json().await?)
    }

    /// Upsert `rows` (a JSON array) keyed on `on_conflict`.
    pub(crate) async fn upsert(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let response = self
            .http
            .post(self.endpoint(table)?)
            .header("apikey", self.service_key.expose_secret())
            .bearer_auth(self.service_key.expose_secret())
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", on_conflict)])
            .json(rows)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DatabaseError::Remote(format!(
                "upsert {table} failed: {status}: {}",
                truncate(&body)
            )));
        }
        Ok(())
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Query-string builder for one table request.
#[derive(Debug, Clone, Default)]
pub(crate) struct TableQuery {
    pairs: Vec<(String, String)>,
}

impl TableQuery {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn select(mut self, columns: &str) -> Self {
        self.pairs.push(("select".to_string(), columns.to_string()));
        self
    }

    pub(crate) fn eq(mut self, column: &str, value: impl ToString) -> Self {
        let value = value.to_string();
        self.pairs
            .push((column.to_string(), format!("eq.{value}")));
        self
    }

    pub(crate) fn gte(mut self, column: &str, value: &str) -> Self {
        self.pairs
            .push((column.to_string(), format!("gte.{value}")));
        self
    }

    pub(crate) fn gt(mut self, column: &str, value: &str) -> Self {
        self.pairs.push((column.to_string(), format!("gt.{value}")));
        self
    }

    pub(crate) fn lte(mut self, column: &str, value: &str) -> Self {
        self.pairs
            .push((column.to_string(), format!("lte.{value}")));
        self
    }

    pub(crate) fn in_list(mut self, column: &str, ids: &[i64]) -> Self {
        let list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.pairs
            .push((column.to_string(), format!("in.({list})")));
        self
    }

    /// Case-insensitive LIKE; the relational `%` wildcard becomes `*`.
    pub(crate) fn ilike(mut self, column: &str, pattern: &str) -> Self {
        self.pairs.push((
            column.to_string(),
            format!("ilike.{}", pattern.replace('%', "*")),
        ));
        self
    }

    /// Negated case-insensitive LIKE.
    pub(crate) fn not_ilike(mut self, column: &str, pattern: &str) -> Self {
        self.pairs.push((
            column.to_string(),
            format!("not.ilike.{}", pattern.replace('%', "*")),
        ));
        self
    }

    pub(crate) fn order(mut self, column: &str, descending: bool) -> Self {
        let direction = if descending { "desc" } else { "asc" };
        self.pairs
            .push(("order".to_string(), format!("{column}.{direction}")));
        self
    }

    pub(crate) fn limit(mut self, limit: usize) -> Self {
        self.pairs.push(("limit".to_string(), limit.to_string()));
        self
    }

    /// Page window: `offset` rows in, `limit` rows long.
    pub(crate) fn range(mut self, offset: usize, limit: usize) -> Self {
        self.pairs.push(("limit".to_string(), limit.to_string()));
        self.pairs.push(("offset".to_string(), offset.to_string()));
        self
    }

    pub(crate) fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}
