//! Message storage backends.
//!
//! The hub only sees `Arc<dyn MessageStore>`; this module picks the backend
//! from configuration and implements the SQLite one.

use crate::config::{StorageBackend, StorageConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parlor_core::{
    now_millis, CanonicalRecord, Identity, MemoryStore, MessageStore, NewMessage,
    PersistenceError,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace};
use uuid::Uuid;

const CREATE_MESSAGES: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        display_name TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
"#;

/// Open the configured message store.
///
/// # Errors
///
/// Returns an error if the SQLite database cannot be opened or migrated.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn MessageStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            let store = SqliteStore::connect(&config.url)
                .await
                .with_context(|| format!("Failed to open message store at {}", config.url))?;
            info!(url = %config.url, "SQLite message store ready");
            Ok(Arc::new(store))
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    room_id: String,
    user_id: String,
    display_name: String,
    content: String,
    created_at: i64,
}

impl From<MessageRow> for CanonicalRecord {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            room_id: row.room_id,
            sender: Identity::new(row.user_id, row.display_name),
            content: row.content,
            created_at: u64::try_from(row.created_at).unwrap_or_default(),
        }
    }
}

/// SQLite-backed message log.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url` and create the `messages` table if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Every connection to an in-memory database is a separate database.
        let in_memory = url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(5));
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        sqlx::query(CREATE_MESSAGES).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn persistence_error(e: sqlx::Error) -> PersistenceError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PersistenceError::Unavailable(e.to_string())
        }
        other => PersistenceError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: NewMessage) -> Result<CanonicalRecord, PersistenceError> {
        let id = Uuid::now_v7().to_string();
        let now =
            i64::try_from(now_millis()).map_err(|e| PersistenceError::Rejected(e.to_string()))?;

        // Never earlier than the newest stored row, so history order matches
        // broadcast order when the wall clock steps back.
        let created_at: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages (id, room_id, user_id, display_name, content, created_at)
            VALUES (?, ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(created_at) FROM messages), 0)))
            RETURNING created_at
            "#,
        )
        .bind(&id)
        .bind(&message.room_id)
        .bind(&message.sender.user_id)
        .bind(&message.sender.display_name)
        .bind(&message.content)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(persistence_error)?;

        let record =
            CanonicalRecord::from_new(id, u64::try_from(created_at).unwrap_or_default(), message);
        trace!(id = %record.id, room = %record.room_id, "Message stored in sqlite");
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<CanonicalRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, room_id, user_id, display_name, content, created_at \
             FROM messages ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(persistence_error)?;

        Ok(rows.into_iter().map(CanonicalRecord::from).collect())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
