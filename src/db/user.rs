use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use crate::identity::{Identity, IdentityError, IdentityRecord, IdentitySource};

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    password_hash: String,
}

impl From<UserRow> for IdentityRecord {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
        }
    }
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user. Returns the user ID.
    pub async fn create(
        &self,
        id: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<String, sqlx::Error> {
        sqlx::query("INSERT INTO users (id, email, password_hash) VALUES (?, ?, ?)")
            .bind(id)
            .bind(email)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(id.to_string())
    }

    /// Get a user by email.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<IdentityRecord>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, email, password_hash FROM users WHERE email = ?")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(IdentityRecord::from))
    }

    /// Get a user by ID.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<IdentityRecord>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, email, password_hash FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(IdentityRecord::from))
    }

    /// Delete a user by ID. Their session row goes with them.
    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn unavailable(e: sqlx::Error) -> IdentityError {
    IdentityError::Unavailable(e.to_string())
}

#[async_trait]
impl IdentitySource for UserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<IdentityRecord>, IdentityError> {
        self.get_by_email(email).await.map_err(unavailable)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError> {
        let record = self.get_by_id(id).await.map_err(unavailable)?;
        Ok(record.map(|r| r.identity()))
    }

    async fn create(&self, email: &str, password_hash: &str) -> Result<Identity, IdentityError> {
        let id = uuid::Uuid::new_v4().to_string();
        match UserStore::create(self, &id, email, password_hash).await {
            Ok(id) => Ok(Identity {
                id,
                email: email.to_string(),
            }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(IdentityError::Conflict)
            }
            Err(e) => Err(unavailable(e)),
        }
    }
}
