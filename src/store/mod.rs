//! Message store for Parley.
//!
//! Manages the local SQLite database holding chat sessions, the ordered
//! message log, and attached query results. The log is append-only: messages
//! are never reordered or rewritten, only annotated with results after the
//! fact.

mod messages;
mod migrations;
mod sessions;

pub use messages::{MessageRole, NewMessage, StoredMessage};
pub use sessions::Session;

pub mod message_log {
    pub use super::messages::{
        append_message, attach_results, attach_visualization, count_messages, get_message,
        list_messages,
    };
}

pub mod session_log {
    pub use super::sessions::{create_session, delete_session, get_session, list_sessions};
}

use crate::error::{ParleyError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 100;

/// Main persistence interface for the chat database.
pub struct ChatStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl ChatStore {
    /// Opens or creates the chat database at the default platform path.
    ///
    /// - Linux/macOS: `~/.config/db-parley/chat.db`
    /// - Windows: `%APPDATA%\db-parley\chat.db`
    pub async fn open_default() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open(&path).await
    }

    /// Opens or creates the chat database at the specified path.
    pub async fn open(path: &PathBuf) -> Result<Self> {
        Self::ensure_parent_dirs(path)?;

        match Self::try_open(path).await {
            Ok(db) => Ok(db),
            Err(e) => {
                warn!("Failed to open chat database: {e}. Attempting recovery...");
                Self::attempt_recovery(path).await
            }
        }
    }

    /// Opens an in-memory store, for tests and throwaway sessions.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| ParleyError::store(format!("Failed to open in-memory store: {e}")))?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .map_err(|e| ParleyError::store(format!("Failed to enable foreign keys: {e}")))?;

        migrations::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Returns the default chat database path for the current platform.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ParleyError::store("Could not determine config directory"))?;
        Ok(config_dir.join("db-parley").join("chat.db"))
    }

    /// Attempts to open the database with retries for lock contention.
    async fn try_open(path: &PathBuf) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * 2u64.pow(attempt)))
                    .await;
            }

            match Self::connect(path).await {
                Ok(pool) => {
                    migrations::run_migrations(&pool).await?;
                    info!("Chat database opened at {}", path.display());
                    return Ok(Self {
                        pool,
                        db_path: path.clone(),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ParleyError::store("Failed to open database after retries")))
    }

    /// Creates a connection pool to the SQLite database.
    async fn connect(path: &PathBuf) -> Result<SqlitePool> {
        let conn_str = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| ParleyError::store(format!("Invalid database path: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| ParleyError::store(format!("Failed to connect to chat database: {e}")))
    }

    /// Ensures parent directories exist for the database path.
    fn ensure_parent_dirs(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ParleyError::store(format!(
                    "Failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Attempts to recover from a corrupted database by backing up and recreating.
    async fn attempt_recovery(path: &PathBuf) -> Result<Self> {
        let backup_path = path.with_extension("db.bak");

        if path.exists() {
            std::fs::rename(path, &backup_path).map_err(|e| {
                ParleyError::store(format!(
                    "Failed to backup corrupted database to {}: {e}",
                    backup_path.display()
                ))
            })?;
            warn!("Backed up corrupted database to {}", backup_path.display());
        }

        Self::try_open(path)
            .await
            .map_err(|e| ParleyError::store(format!("Failed to recreate database after backup: {e}")))
    }

    /// Returns the path to the chat database.
    pub fn path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
