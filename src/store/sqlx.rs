use async_trait::async_trait;
use sqlx::{Database, Pool, Row};
use tokio_stream::StreamExt;

use crate::{
    Message,
    store::{Collection, Record},
};

/// Type alias for the Postgres collection.
pub type PgSqlxCollection = SqlxCollection<sqlx::Postgres>;

/// SQLx-based collection storing one row per queued message.
pub struct SqlxCollection<DB>
where
    DB: Database,
{
    pool: Pool<DB>,
}

impl<DB> Clone for SqlxCollection<DB>
where
    DB: Database,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<DB> SqlxCollection<DB>
where
    DB: Database,
{
    /// Creates a collection without checking that its table exists.
    pub fn new_uninitialized(pool: Pool<DB>) -> Self {
        Self { pool }
    }
}

impl SqlxCollection<sqlx::Postgres> {
    /// Creates a Postgres collection and ensures its table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl Collection for SqlxCollection<sqlx::Postgres> {
    type Error = Error;

    #[tracing::instrument(skip_all)]
    async fn load(&self) -> Result<Vec<Record>, Self::Error> {
        let mut rows =
            sqlx::query("SELECT storage_id, message FROM courier_messages ORDER BY storage_id")
                .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let storage_id: i64 = row.try_get("storage_id")?;
            let message: serde_json::Value = row.try_get("message")?;
            out.push(Record {
                storage_id: storage_id.to_string(),
                message: serde_json::from_value(message)?,
            });
        }
        Ok(out)
    }

    #[tracing::instrument(skip_all, fields(id = message.id()))]
    async fn add(&self, message: &Message) -> Result<String, Self::Error> {
        let json = serde_json::to_value(message)?;
        let storage_id: i64 = sqlx::query_scalar(
            "INSERT INTO courier_messages (message_id, message) VALUES ($1, $2) RETURNING storage_id",
        )
        .bind(message.id())
        .bind(json)
        .fetch_one(&self.pool)
        .await?;
        Ok(storage_id.to_string())
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, storage_id: &str) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM courier_messages WHERE storage_id = $1")
            .bind(parse(storage_id)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, message))]
    async fn update(&self, storage_id: &str, message: &Message) -> Result<(), Self::Error> {
        let json = serde_json::to_value(message)?;
        sqlx::query(
            "UPDATE courier_messages SET message = $2, updated_at = NOW() WHERE storage_id = $1",
        )
        .bind(parse(storage_id)?)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse(storage_id: &str) -> Result<i64, Error> {
    storage_id.parse().map_err(|_| Error {
        context: tracing_error::SpanTrace::capture(),
        kind: SqlxDriverErrorKind::InvalidStorageId(storage_id.to_owned()),
    })
}

/// Ensures the message table exists.
async fn create_table(pool: &sqlx::PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS courier_messages (
            storage_id BIGSERIAL PRIMARY KEY,
            message_id TEXT NOT NULL,
            message JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Sqlx collection errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

/// Kinds of SQLx collection errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
    /// The storage id was not issued by this collection.
    InvalidStorageId(String),
}

impl Error {
    pub fn kind(&self) -> &SqlxDriverErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxDriverErrorKind::Serde(err) => writeln!(f, "Serde error: {}", err),
            SqlxDriverErrorKind::InvalidStorageId(id) => writeln!(f, "Invalid storage id: {id}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Serde(err) => Some(err),
            SqlxDriverErrorKind::InvalidStorageId(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Serde(err),
        }
    }
}
