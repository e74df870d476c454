//! Fixed-size connection pool for the embedded engine.
//!
//! Connections are opened once at startup and handed out one checkout at a
//! time. `acquire` waits a bounded interval for a free connection and, rather
//! than failing under load, opens a supernumerary connection that is closed
//! instead of pooled when its guard drops. Checkin happens in the guard's
//! `Drop`, so a connection is returned on every path, error paths included.

use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libsql::Builder;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::DatabaseError;

/// Attempts `execute_with_retry` makes before surfacing the busy error.
const RETRY_ATTEMPTS: u32 = 5;

/// First backoff delay; doubled after every busy attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

struct PoolShared {
    db: libsql::Database,
    idle: Mutex<Vec<libsql::Connection>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    size: usize,
}

/// Pool of pre-opened connections to one local database file.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Open the database file and fill the pool to the configured size.
    pub async fn open(path: &Path, config: PoolConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::Pool(format!("create {}: {e}", parent.display())))?;
        }

        let db = Builder::new_local(path).build().await?;
        let mut idle = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            let conn = db.connect()?;
            init_session(&conn).await?;
            idle.push(conn);
        }
        debug!(
            size = config.size,
            path = %path.display(),
            "connection pool ready"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                db,
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(config.size)),
                acquire_timeout: config.acquire_timeout,
                size: config.size,
            }),
        })
    }

    /// Check out a connection, waiting up to the acquire timeout.
    ///
    /// When the pool stays exhausted past the timeout this opens an extra
    /// connection outside the pool and logs a warning; the extra connection
    /// is closed, not pooled, when its guard drops.
    pub async fn acquire(&self) -> Result<PooledConnection, DatabaseError> {
        let waited = self.shared.acquire_timeout;
        let permits = Arc::clone(&self.shared.permits);
        match tokio::time::timeout(waited, permits.acquire_owned()).await {
            Ok(Ok(permit)) => {
                let conn = self
                    .shared
                    .idle
                    .lock()
                    .ok()
                    .and_then(|mut idle| idle.pop());
                let conn = match conn {
                    Some(conn) => conn,
                    // Permit held but no idle connection (a guard failed to
                    // check one back in); mint a replacement so the pool
                    // recovers its size.
                    None => {
                        let conn = self.shared.db.connect()?;
                        init_session(&conn).await?;
                        conn
                    }
                };
                Ok(PooledConnection {
                    conn: Some(conn),
                    shared: Arc::clone(&self.shared),
                    permit: Some(permit),
                })
            }
            Ok(Err(_)) => Err(DatabaseError::Pool("connection pool closed".into())),
            Err(_) => {
                warn!(
                    pool_size = self.shared.size,
                    waited_ms = waited.as_millis() as u64,
                    "connection pool exhausted, opening supernumerary connection"
                );
                let conn = self.shared.db.connect()?;
                init_session(&conn).await?;
                Ok(PooledConnection {
                    conn: Some(conn),
                    shared: Arc::clone(&self.shared),
                    permit: None,
                })
            }
        }
    }

    /// Run `op` with a checked-out connection, retrying the busy/locked
    /// class with exponential backoff. Any other error is returned on the
    /// first occurrence, and the busy error itself once attempts run out.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, DatabaseError>
    where
        F: FnMut(PooledConnection) -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            let conn = self.acquire().await?;
            match op(conn).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() && attempt < RETRY_ATTEMPTS => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "embedded engine busy, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Configured pool size.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Connections currently checked in.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// Per-connection settings. The busy timeout keeps the engine itself waiting
/// on short lock contention before it reports the busy class we retry on.
async fn init_session(conn: &libsql::Connection) -> Result<(), DatabaseError> {
    conn.execute_batch("PRAGMA busy_timeout = 5000;").await?;
    Ok(())
}

/// Checked-out connection. Dereferences to [`libsql::Connection`]; dropping
/// it checks the connection back in (or closes it, for supernumeraries).
pub struct PooledConnection {
    conn: Option<libsql::Connection>,
    shared: Arc<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Deref for PooledConnection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken only in Drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Only pooled checkouts (holding a permit) go back; the permit
            // is released after the connection is visible in the idle set.
            if self.permit.is_some()
                && let Ok(mut idle) = self.shared.idle.lock()
            {
                idle.push(conn);
            }
        }
    }
}
