//! Chat session persistence.
//!
//! Sessions group messages; deleting one cascades to its messages and their
//! attached results.

use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

/// A chat session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: i64,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Creates a new session and returns it.
pub async fn create_session(
    pool: &SqlitePool,
    user_id: &str,
    title: Option<&str>,
) -> Result<Session> {
    let result = sqlx::query("INSERT INTO sessions (user_id, title) VALUES (?, ?)")
        .bind(user_id)
        .bind(title)
        .execute(pool)
        .await
        .map_err(|e| ParleyError::store(format!("Failed to create session: {e}")))?;

    let id = result.last_insert_rowid();

    get_session(pool, id)
        .await?
        .ok_or_else(|| ParleyError::store("Session vanished immediately after creation"))
}

/// Gets a session by id.
pub async fn get_session(pool: &SqlitePool, id: i64) -> Result<Option<Session>> {
    sqlx::query_as(
        r#"
        SELECT id, user_id, title, created_at, updated_at
        FROM sessions
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| ParleyError::store(format!("Failed to get session: {e}")))
}

/// Lists all sessions for a user, most recently updated first.
pub async fn list_sessions(pool: &SqlitePool, user_id: &str) -> Result<Vec<Session>> {
    sqlx::query_as(
        r#"
        SELECT id, user_id, title, created_at, updated_at
        FROM sessions
        WHERE user_id = ?
        ORDER BY updated_at DESC, id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::store(format!("Failed to list sessions: {e}")))
}

/// Deletes a session; messages and results cascade.
///
/// Returns true if a session was deleted.
pub async fn delete_session(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| ParleyError::store(format!("Failed to delete session: {e}")))?;

    Ok(result.rows_affected() > 0)
}

/// Bumps a session's updated_at timestamp.
pub(crate) async fn touch_session(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE sessions SET updated_at = datetime('now') WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| ParleyError::store(format!("Failed to touch session: {e}")))?;
    Ok(())
}
