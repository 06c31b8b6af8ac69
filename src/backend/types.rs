//! Wire types for the backend service API.
//!
//! Mirrors the JSON request/response shapes of the NL→SQL backend: database
//! connection descriptors, generation requests, columnar result sets, and
//! visualization recommendations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ParleyError, Result};

/// Supported database engines on the backend side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Postgres,
    Mysql,
    Mssql,
    Sqlite,
}

impl DatabaseKind {
    /// Returns the kind as the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Returns the conventional default port, or None for file-backed engines.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::Mysql => Some(3306),
            Self::Mssql => Some(1433),
            Self::Sqlite => None,
        }
    }
}

impl FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mssql" | "sqlserver" => Ok(Self::Mssql),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(format!("Unknown database type: {s}")),
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Database connection descriptor sent with every backend call.
///
/// Host, user, and password are omitted for sqlite databases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConnection {
    pub db_type: DatabaseKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_port: Option<u16>,
    pub db_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_password: Option<String>,
}

impl DbConnection {
    /// Validates that the descriptor is complete enough to send.
    pub fn validate(&self) -> Result<()> {
        if self.db_name.trim().is_empty() {
            return Err(ParleyError::validation("db_name is required"));
        }
        if self.db_type != DatabaseKind::Sqlite
            && self.db_host.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err(ParleyError::validation(format!(
                "db_host is required for {} connections",
                self.db_type
            )));
        }
        Ok(())
    }

    /// Returns a display-safe string (no password) for UI purposes.
    pub fn display_string(&self) -> String {
        match self.db_type {
            DatabaseKind::Sqlite => format!("{} ({})", self.db_name, self.db_type),
            _ => {
                let host = self.db_host.as_deref().unwrap_or("localhost");
                let port = self
                    .db_port
                    .or_else(|| self.db_type.default_port())
                    .unwrap_or(0);
                format!("{} @ {host}:{port}", self.db_name)
            }
        }
    }
}

/// LLM provider selection for the backend service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Ollama,
    OpenAi,
    Custom,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for ModelProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Unknown model provider: {s}")),
        }
    }
}

/// Model descriptor sent with generation and visualization calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: ModelProvider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl LlmConfig {
    /// Validates provider-specific requirements.
    pub fn validate(&self) -> Result<()> {
        match self.provider {
            ModelProvider::OpenAi if self.api_key.as_deref().unwrap_or("").is_empty() => Err(
                ParleyError::validation("an API key is required for the openai provider"),
            ),
            ModelProvider::Custom if self.url.as_deref().unwrap_or("").is_empty() => Err(
                ParleyError::validation("a model URL is required for the custom provider"),
            ),
            _ => Ok(()),
        }
    }
}

/// One entry of the bounded history window sent to the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Request body for `/generate_sql`.
///
/// `failed_sql` and `error_message` are present only on regeneration, giving
/// the model corrective context about the attempt that failed.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateSqlRequest {
    pub user_prompt: String,
    pub message_history: Vec<HistoryMessage>,
    pub db_connection: DbConnection,
    pub llm_config: LlmConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Response body for `/generate_sql`.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlResponse {
    pub sql: String,
}

/// Columnar result set returned by `/execute_sql`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Error body the backend returns for a rejected SQL statement.
///
/// The detail is either a structured `{error}` object or a bare string.
#[derive(Debug, Deserialize)]
pub struct SqlErrorResponse {
    pub detail: SqlErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SqlErrorDetail {
    Structured { error: String },
    Plain(String),
}

impl SqlErrorDetail {
    pub fn message(&self) -> &str {
        match self {
            Self::Structured { error } => error,
            Self::Plain(s) => s,
        }
    }
}

/// Response body for `/test_db_connection`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionTestResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Database schema as reported by `/get_db_schema`.
///
/// Tables map to column strings encoded as `"name (type)"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbSchema(pub BTreeMap<String, Vec<String>>);

impl DbSchema {
    /// Splits a `"name (type)"` column string into its parts.
    ///
    /// Columns without a type annotation come back with an empty type.
    pub fn parse_column(column: &str) -> (String, String) {
        match column.split_once(" (") {
            Some((name, rest)) => (
                name.trim().to_string(),
                rest.trim_end_matches(')').trim().to_string(),
            ),
            None => (column.trim().to_string(), String::new()),
        }
    }

    /// Formats the schema for terminal display.
    pub fn format_for_display(&self) -> String {
        if self.0.is_empty() {
            return "No tables found.".to_string();
        }

        let mut out = String::from("Database schema:\n");
        for (table, columns) in &self.0 {
            out.push_str(&format!("\n  {table}\n"));
            for column in columns {
                let (name, ty) = Self::parse_column(column);
                if ty.is_empty() {
                    out.push_str(&format!("    {name}\n"));
                } else {
                    out.push_str(&format!("    {name}: {ty}\n"));
                }
            }
        }
        out
    }

    pub fn table_count(&self) -> usize {
        self.0.len()
    }
}

/// Response body for `/get_db_schema`.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaResponse {
    pub success: bool,
    #[serde(default)]
    pub schema: Option<DbSchema>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Request body for `/probe_llm`.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRequest {
    pub provider: ModelProvider,
    pub url: String,
}

/// Request body for `/recommend_visualization`.
#[derive(Debug, Clone, Serialize)]
pub struct VisualizationRequest {
    pub question: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub llm_config: LlmConfig,
}

/// Response body for `/recommend_visualization`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualizationRecommendation {
    pub visualization: bool,
    #[serde(rename = "chartType", default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(rename = "xAxis", default, skip_serializing_if = "Option::is_none")]
    pub x_axis: Option<String>,
    #[serde(rename = "yAxis", default, skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl VisualizationRecommendation {
    /// Renders the recommendation as a chat-facing summary line.
    pub fn summary(&self) -> String {
        if self.visualization {
            let chart = self.chart_type.as_deref().unwrap_or("suitable");
            let x = self.x_axis.as_deref().unwrap_or("?");
            let y = self.y_axis.as_deref().unwrap_or("?");
            let mut text = format!(
                "Based on this data, I recommend a {chart} chart with \"{x}\" on the X-axis and \"{y}\" on the Y-axis."
            );
            if let Some(explanation) = &self.explanation {
                text.push(' ');
                text.push_str(explanation);
            }
            text
        } else {
            let mut text = String::from("This data doesn't seem suitable for visualization.");
            if let Some(explanation) = &self.explanation {
                text.push(' ');
                text.push_str(explanation);
            }
            text
        }
    }
}
