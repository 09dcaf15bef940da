//! Refresh session storage.
//!
//! Exactly one row per user binds them to their current refresh token. Access
//! tokens are stateless and never touch this table.
//!
//! Every call runs on its own task under a timeout. When the timeout fires the
//! caller gets [`StoreError::Timeout`] but the statement keeps running, so a
//! write that was already issued is never half-applied.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::SqlitePool;
use tracing::warn;

/// A persisted refresh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub id: i64,
    pub user_id: String,
    pub token: String,
    pub token_type: String,
    pub valid: bool,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    user_id: String,
    token: String,
    token_type: String,
    valid: i64,
    expires_at: i64,
    created_at: i64,
}

impl From<SessionRow> for SessionToken {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            token: row.token,
            token_type: row.token_type,
            valid: row.valid != 0,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

/// Errors from session store calls.
#[derive(Debug)]
pub enum StoreError {
    /// The database rejected or failed the statement
    Database(sqlx::Error),
    /// The call did not finish within the configured bound
    Timeout(Duration),
    /// The task running the statement panicked or was cancelled
    Task(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Timeout(d) => write!(f, "Session store timed out after {:?}", d),
            StoreError::Task(e) => write!(f, "Session store task failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

const SELECT_COLUMNS: &str =
    "SELECT id, user_id, token, token_type, valid, expires_at, created_at FROM session_tokens";

/// Store for refresh sessions, keyed by user.
#[derive(Clone)]
pub struct TokenStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl TokenStore {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Run a statement on its own task, bounded by the store timeout.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(fut);
        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result.map_err(StoreError::Database),
            Ok(Err(e)) => Err(StoreError::Task(e.to_string())),
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Session store call timed out, statement left to complete"
                );
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    /// Create or overwrite the session for a user in a single statement.
    /// The row is marked valid and its creation time reset.
    pub async fn upsert_session(
        &self,
        user_id: &str,
        token: &str,
        expires_at: u64,
    ) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();
        let token = token.to_string();
        let expires_at = to_sql_timestamp(expires_at);

        self.bounded("upsert_session", async move {
            sqlx::query(
                "INSERT INTO session_tokens (user_id, token, token_type, valid, expires_at, created_at)
                 VALUES (?, ?, 'refresh', 1, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    token = excluded.token,
                    valid = 1,
                    expires_at = excluded.expires_at,
                    created_at = excluded.created_at",
            )
            .bind(&user_id)
            .bind(&token)
            .bind(expires_at)
            .bind(unix_now())
            .execute(&pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Find the session only if the token and user both match, it is valid,
    /// and it has not expired. Every other case is indistinguishable `None`.
    pub async fn find_active_session(
        &self,
        token: &str,
        user_id: &str,
    ) -> Result<Option<SessionToken>, StoreError> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();
        let token = token.to_string();

        self.bounded("find_active_session", async move {
            let row: Option<SessionRow> = sqlx::query_as(sqlx::AssertSqlSafe(format!(
                "{} WHERE token = ? AND user_id = ? AND valid = 1 AND expires_at > ?",
                SELECT_COLUMNS
            )))
            .bind(&token)
            .bind(&user_id)
            .bind(unix_now())
            .fetch_optional(&pool)
            .await?;
            Ok(row.map(SessionToken::from))
        })
        .await
    }

    /// Get the session row for a user regardless of its state.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Option<SessionToken>, StoreError> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();

        self.bounded("get_by_user", async move {
            let row: Option<SessionRow> =
                sqlx::query_as(sqlx::AssertSqlSafe(format!("{} WHERE user_id = ?", SELECT_COLUMNS)))
                    .bind(&user_id)
                    .fetch_optional(&pool)
                    .await?;
            Ok(row.map(SessionToken::from))
        })
        .await
    }

    /// Mark every session for a user invalid without deleting it.
    pub async fn invalidate_all(&self, user_id: &str) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();

        self.bounded("invalidate_all", async move {
            let result = sqlx::query("UPDATE session_tokens SET valid = 0 WHERE user_id = ?")
                .bind(&user_id)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Delete every session for a user (logout, account deletion).
    pub async fn delete_all(&self, user_id: &str) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();

        self.bounded("delete_all", async move {
            let result = sqlx::query("DELETE FROM session_tokens WHERE user_id = ?")
                .bind(&user_id)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Delete sessions that have expired or were invalidated.
    pub async fn delete_expired_or_invalid(&self) -> Result<u64, StoreError> {
        let pool = self.pool.clone();

        self.bounded("delete_expired_or_invalid", async move {
            let result =
                sqlx::query("DELETE FROM session_tokens WHERE expires_at <= ? OR valid = 0")
                    .bind(unix_now())
                    .execute(&pool)
                    .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Delete sessions created more than `retention` ago, valid or not.
    pub async fn delete_older_than(&self, retention: Duration) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        let cutoff = unix_now().saturating_sub(to_sql_timestamp(retention.as_secs()));

        self.bounded("delete_older_than", async move {
            let result = sqlx::query("DELETE FROM session_tokens WHERE created_at < ?")
                .bind(cutoff)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Count sessions that would currently pass `find_active_session`.
    pub async fn count_active(&self) -> Result<i64, StoreError> {
        let pool = self.pool.clone();

        self.bounded("count_active", async move {
            let count: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM session_tokens WHERE valid = 1 AND expires_at > ?",
            )
            .bind(unix_now())
            .fetch_one(&pool)
            .await?;
            Ok(count.0)
        })
        .await
    }

    /// Creation time of the oldest valid session, if any.
    pub async fn oldest_active_created_at(&self) -> Result<Option<i64>, StoreError> {
        let pool = self.pool.clone();

        self.bounded("oldest_active_created_at", async move {
            let oldest: (Option<i64>,) =
                sqlx::query_as("SELECT MIN(created_at) FROM session_tokens WHERE valid = 1")
                    .fetch_one(&pool)
                    .await?;
            Ok(oldest.0)
        })
        .await
    }
}

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| to_sql_timestamp(d.as_secs()))
        .unwrap_or_default()
}

fn to_sql_timestamp(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}
