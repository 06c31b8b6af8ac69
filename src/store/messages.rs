//! Message log persistence.
//!
//! Appends chat messages, reads them back in creation order with their
//! attached results, and attaches results idempotently after execution.

use crate::backend::ResultSet;
use crate::backend::VisualizationRecommendation;
use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

use super::sessions::touch_session;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::User,
        }
    }
}

/// A persisted chat message with its attached results, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub sql: Option<String>,
    /// Id of the originating user message, linking a regeneration chain.
    pub query_group_id: Option<i64>,
    /// 1-based attempt number within the chain.
    pub attempt: Option<i64>,
    pub created_at: String,
    pub results: Option<ResultSet>,
    pub visualization: Option<VisualizationRecommendation>,
}

impl StoredMessage {
    /// True for assistant messages carrying SQL to execute.
    pub fn has_sql(&self) -> bool {
        self.role == MessageRole::Assistant && self.sql.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Fields for a message about to be appended.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub role: Option<MessageRole>,
    pub content: String,
    pub sql: Option<String>,
    pub query_group_id: Option<i64>,
    pub attempt: Option<i64>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Some(MessageRole::User),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Some(MessageRole::Assistant),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Some(MessageRole::System),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_group(mut self, query_group_id: i64, attempt: i64) -> Self {
        self.query_group_id = Some(query_group_id);
        self.attempt = Some(attempt);
        self
    }
}

/// Raw database row for a message joined with its results.
#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    session_id: i64,
    role: String,
    content: String,
    sql: Option<String>,
    query_group_id: Option<i64>,
    attempt: Option<i64>,
    created_at: String,
    result_columns: Option<String>,
    result_rows: Option<String>,
    visualization: Option<String>,
}

impl MessageRow {
    fn into_message(self) -> StoredMessage {
        let results = match (self.result_columns, self.result_rows) {
            (Some(columns), Some(rows)) => {
                let columns = serde_json::from_str(&columns).unwrap_or_default();
                let rows = serde_json::from_str(&rows).unwrap_or_default();
                Some(ResultSet { columns, rows })
            }
            _ => None,
        };

        let visualization = self
            .visualization
            .and_then(|v| serde_json::from_str(&v).ok());

        StoredMessage {
            id: self.id,
            session_id: self.session_id,
            role: MessageRole::from_str(&self.role),
            content: self.content,
            sql: self.sql,
            query_group_id: self.query_group_id,
            attempt: self.attempt,
            created_at: self.created_at,
            results,
            visualization,
        }
    }
}

const MESSAGE_SELECT: &str = r#"
    SELECT m.id, m.session_id, m.role, m.content, m.sql,
           m.query_group_id, m.attempt, m.created_at,
           r.columns AS result_columns, r.rows AS result_rows, r.visualization
    FROM messages m
    LEFT JOIN query_results r ON r.message_id = m.id
"#;

/// Appends a message to a session and returns the stored row.
///
/// Fails with a store error if the session no longer exists (foreign key);
/// the caller treats that as fatal for the turn, not retryable.
pub async fn append_message(
    pool: &SqlitePool,
    session_id: i64,
    message: NewMessage,
) -> Result<StoredMessage> {
    let role = message
        .role
        .ok_or_else(|| ParleyError::internal("NewMessage missing role"))?;

    let result = sqlx::query(
        r#"
        INSERT INTO messages (session_id, role, content, sql, query_group_id, attempt)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(role.as_str())
    .bind(&message.content)
    .bind(&message.sql)
    .bind(message.query_group_id)
    .bind(message.attempt)
    .execute(pool)
    .await
    .map_err(|e| ParleyError::store(format!("Failed to append message: {e}")))?;

    let id = result.last_insert_rowid();

    touch_session(pool, session_id).await?;

    get_message(pool, id)
        .await?
        .ok_or_else(|| ParleyError::store("Message vanished immediately after insert"))
}

/// Gets a single message by id.
pub async fn get_message(pool: &SqlitePool, id: i64) -> Result<Option<StoredMessage>> {
    let row: Option<MessageRow> = sqlx::query_as(&format!("{MESSAGE_SELECT} WHERE m.id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| ParleyError::store(format!("Failed to get message: {e}")))?;

    Ok(row.map(MessageRow::into_message))
}

/// Lists a session's messages ascending by creation order.
pub async fn list_messages(pool: &SqlitePool, session_id: i64) -> Result<Vec<StoredMessage>> {
    let rows: Vec<MessageRow> = sqlx::query_as(&format!(
        "{MESSAGE_SELECT} WHERE m.session_id = ? ORDER BY m.created_at ASC, m.id ASC"
    ))
    .bind(session_id)
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::store(format!("Failed to list messages: {e}")))?;

    Ok(rows.into_iter().map(MessageRow::into_message).collect())
}

/// Returns the number of messages in a session.
pub async fn count_messages(pool: &SqlitePool, session_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
        .bind(session_id)
        .fetch_one(pool)
        .await
        .map_err(|e| ParleyError::store(format!("Failed to count messages: {e}")))?;

    Ok(count)
}

/// Attaches a result set to a message.
///
/// Idempotent: a second attach for the same message is a no-op, so a repeated
/// call after a partial failure cannot duplicate or reorder anything.
pub async fn attach_results(pool: &SqlitePool, message_id: i64, results: &ResultSet) -> Result<()> {
    let columns = serde_json::to_string(&results.columns)
        .map_err(|e| ParleyError::store(format!("Failed to encode columns: {e}")))?;
    let rows = serde_json::to_string(&results.rows)
        .map_err(|e| ParleyError::store(format!("Failed to encode rows: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO query_results (message_id, columns, rows)
        VALUES (?, ?, ?)
        ON CONFLICT(message_id) DO NOTHING
        "#,
    )
    .bind(message_id)
    .bind(columns)
    .bind(rows)
    .execute(pool)
    .await
    .map_err(|e| ParleyError::store(format!("Failed to attach results: {e}")))?;

    Ok(())
}

/// Stores a visualization recommendation alongside a message's results.
pub async fn attach_visualization(
    pool: &SqlitePool,
    message_id: i64,
    recommendation: &VisualizationRecommendation,
) -> Result<()> {
    let encoded = serde_json::to_string(recommendation)
        .map_err(|e| ParleyError::store(format!("Failed to encode visualization: {e}")))?;

    let result = sqlx::query("UPDATE query_results SET visualization = ? WHERE message_id = ?")
        .bind(encoded)
        .bind(message_id)
        .execute(pool)
        .await
        .map_err(|e| ParleyError::store(format!("Failed to attach visualization: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(ParleyError::store(format!(
            "No results attached to message {message_id}"
        )));
    }

    Ok(())
}
