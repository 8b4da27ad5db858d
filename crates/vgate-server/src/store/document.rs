//! SQLite-backed token store.
//!
//! Tokens are rows with an explicit `expires_at` column (unix millis). The
//! database never deletes them on its own: every read compares `expires_at`
//! against the clock, and only [`TokenStore::sweep`] removes stale rows.

use super::{StoreError, StoreResult, TokenStore, MAX_ISSUE_ATTEMPTS};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use vgate_core::{token_prefix, unix_millis, Token};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS tokens (
    value      TEXT PRIMARY KEY NOT NULL,
    target_id  TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tokens_expires_at ON tokens (expires_at);
";

pub struct SqliteTokenStore {
    pool: Pool<Sqlite>,
    ttl: Duration,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(format!("sqlite: {e}"))
    }
}

fn to_db_millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl SqliteTokenStore {
    /// Open (or create) the token database at `path`.
    pub async fn open(path: &Path, ttl: Duration) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "token database opened");
        Self::with_pool(pool, ttl).await
    }

    /// In-memory database (for testing).
    pub async fn open_in_memory(ttl: Duration) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, ttl).await
    }

    async fn with_pool(pool: Pool<Sqlite>, ttl: Duration) -> StoreResult<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, ttl })
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn issue(&self, target_id: &str) -> StoreResult<Token> {
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let token = Token::issue(target_id, self.ttl);
            let inserted = sqlx::query(
                "INSERT INTO tokens (value, target_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&token.value)
            .bind(&token.target_id)
            .bind(to_db_millis(token.created_at))
            .bind(to_db_millis(token.expires_at))
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    info!(target_id, token = token_prefix(&token.value), "token issued");
                    return Ok(token);
                }
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Exhausted(MAX_ISSUE_ATTEMPTS))
    }

    async fn validate(&self, token: &str) -> StoreResult<Option<String>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT target_id, expires_at FROM tokens WHERE value = ?1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        let now = to_db_millis(unix_millis());
        Ok(row.and_then(|(target_id, expires_at)| (now < expires_at).then_some(target_id)))
    }

    async fn revoke(&self, token: &str) -> StoreResult<bool> {
        let row: Option<(String, i64)> =
            sqlx::query_as("DELETE FROM tokens WHERE value = ?1 RETURNING target_id, expires_at")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((target_id, expires_at)) => {
                info!(target_id = %target_id, token = token_prefix(token), "token revoked");
                Ok(to_db_millis(unix_millis()) < expires_at)
            }
            None => Ok(false),
        }
    }

    async fn sweep(&self) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires_at <= ?1")
            .bind(to_db_millis(unix_millis()))
            .execute(&self.pool)
            .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
