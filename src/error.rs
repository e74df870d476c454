//! Error types shared across the archive store.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the storage layer.
///
/// The variants mirror the recovery policy: `Busy` is retried locally by the
/// connection pool with backoff, `Remote` makes the router fall back to the
/// embedded engine when the storage mode allows it, and `Config` is fatal at
/// construction.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The embedded engine reported the transient busy/locked class.
    #[error("database busy: {0}")]
    Busy(String),

    /// Pool startup or checkout failure.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Non-transient embedded engine failure.
    #[error("query failed: {0}")]
    Query(String),

    /// Remote REST transport failure or non-success response.
    #[error("remote store error: {0}")]
    Remote(String),

    /// Row or JSON decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DatabaseError {
    /// True for the contention class that `execute_with_retry` backs off on.
    pub fn is_busy(&self) -> bool {
        matches!(self, DatabaseError::Busy(_))
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: i32) -> bool {
    matches!(code & 0xff, 5 | 6)
}

impl From<libsql::Error> for DatabaseError {
    fn from(err: libsql::Error) -> Self {
        match &err {
            libsql::Error::SqliteFailure(code, message)
                if is_busy_code(*code) || message.contains("locked") =>
            {
                DatabaseError::Busy(err.to_string())
            }
            _ => {
                let text = err.to_string();
                if text.contains("database is locked") {
                    DatabaseError::Busy(text)
                } else {
                    DatabaseError::Query(text)
                }
            }
        }
    }
}

impl From<reqwest::Error> for DatabaseError {
    fn from(err: reqwest::Error) -> Self {
        DatabaseError::Remote(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_codes_cover_extended_variants() {
        assert!(is_busy_code(5));
        assert!(is_busy_code(6));
        // SQLITE_BUSY_SNAPSHOT is 5 | (2 << 8).
        assert!(is_busy_code(5 | (2 << 8)));
        assert!(!is_busy_code(1));
        assert!(!is_busy_code(14));
    }

    #[test]
    fn busy_classification_reaches_is_busy() {
        let err = DatabaseError::from(libsql::Error::SqliteFailure(5, "database is locked".into()));
        assert!(err.is_busy());

        let err = DatabaseError::from(libsql::Error::SqliteFailure(1, "syntax error".into()));
        assert!(!err.is_busy());
    }
}
