// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable resume positions and the single-replicator lease.
//!
//! Stores the last fully replicated source `t` for each source/destination
//! pair in SQLite, next to the replicator rather than inside either store.
//!
//! # Write-Through Positions
//!
//! `record()` writes to disk after every successful destination commit. There
//! is no debouncing.
//!
//! The only window left is between a commit succeeding and its position being
//! written. A crash there re-applies one transaction on restart, which
//! identity resolution turns into a no-op.
//!
//! ```text
//! commit t=1042 → record 1042
//!                 (crash here = replay 1042, entity-idempotent)
//! ```
//!
//! # Lease
//!
//! Two replicators writing the same destination from the same source would
//! interleave commits. `acquire_lease()` claims the pair for a holder until
//! `expires_at`; another holder can only take it once it has expired. The
//! controller renews it every third of its TTL.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. We handle this with:
//! - Automatic retry with exponential backoff
//! - Configurable max retries (default 5)

use crate::error::{MirrorError, Result};
use crate::model::TxId;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            // Fallback to message matching
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::resume_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn to_sql_t(t: TxId) -> Result<i64> {
    i64::try_from(t.0).map_err(|_| MirrorError::Internal(format!("t={} does not fit in SQLite INTEGER", t)))
}

/// Identity of this process as a lease holder.
pub fn holder_id() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("pid-{}-{}", std::process::id(), nanos)
}

/// Persistent resume positions and leases backed by SQLite.
pub struct ResumeStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Positions known to this process, kept in step with disk
    cache: Arc<RwLock<HashMap<String, TxId>>>,
    /// Path to database file
    path: String,
}

impl ResumeStore {
    /// Open (or create) a resume store at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing resume store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // Low concurrency needed
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resume_positions (
                pair_key TEXT PRIMARY KEY,
                source_t INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                pair_key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT pair_key, source_t FROM resume_positions")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (pair_key, source_t) in rows {
            let Ok(t) = u64::try_from(source_t) else {
                warn!(pair = %pair_key, source_t, "Ignoring negative stored position");
                continue;
            };
            debug!(pair = %pair_key, t, "Loaded resume position from disk");
            cache.insert(pair_key, TxId(t));
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored resume positions from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
        })
    }

    /// Last replicated `t` for a pair, if any.
    pub async fn get(&self, pair: &str) -> Option<TxId> {
        self.cache.read().await.get(pair).copied()
    }

    /// Persist the last replicated `t` for a pair.
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    pub async fn record(&self, pair: &str, t: TxId) -> Result<()> {
        let source_t = to_sql_t(t)?;
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        execute_with_retry("position_record", || async {
            sqlx::query(
                r#"
                INSERT INTO resume_positions (pair_key, source_t, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(pair_key) DO UPDATE SET
                    source_t = excluded.source_t,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(pair)
            .bind(source_t)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        self.cache.write().await.insert(pair.to_string(), t);
        debug!(pair = %pair, t = %t, "Resume position recorded");
        Ok(())
    }

    /// Forget the position for a pair.
    pub async fn delete(&self, pair: &str) -> Result<()> {
        self.cache.write().await.remove(pair);

        let pool = &self.pool;
        execute_with_retry("position_delete", || async {
            sqlx::query("DELETE FROM resume_positions WHERE pair_key = ?")
                .bind(pair)
                .execute(pool)
                .await
        })
        .await?;

        info!(pair = %pair, "Deleted resume position");
        Ok(())
    }

    /// Claim or renew the lease for `pair`.
    ///
    /// Returns `false` if another holder has an unexpired lease.
    pub async fn acquire_lease(&self, pair: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);
        let pool = &self.pool;

        let result = execute_with_retry("lease_acquire", || async {
            sqlx::query(
                r#"
                INSERT INTO leases (pair_key, holder, expires_at)
                VALUES (?, ?, ?)
                ON CONFLICT(pair_key) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
                WHERE leases.holder = excluded.holder OR leases.expires_at < ?
                "#,
            )
            .bind(pair)
            .bind(holder)
            .bind(expires_at)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Current holder of the lease for `pair`, if unexpired.
    pub async fn lease_holder(&self, pair: &str) -> Result<Option<String>> {
        let now = chrono::Utc::now().timestamp_millis();
        let row: Option<(String,)> =
            sqlx::query_as("SELECT holder FROM leases WHERE pair_key = ? AND expires_at >= ?")
                .bind(pair)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(holder,)| holder))
    }

    /// Give up the lease if we still hold it.
    pub async fn release_lease(&self, pair: &str, holder: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("lease_release", || async {
            sqlx::query("DELETE FROM leases WHERE pair_key = ? AND holder = ?")
                .bind(pair)
                .bind(holder)
                .execute(pool)
                .await
        })
        .await?;
        debug!(pair = %pair, "Lease released");
        Ok(())
    }

    /// Get all positions (for metrics/debugging).
    pub async fn get_all(&self) -> HashMap<String, TxId> {
        self.cache.read().await.clone()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("position_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the connection pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Resume store closed");
    }
}
