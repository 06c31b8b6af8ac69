//! Configuration management for Parley.
//!
//! Handles loading configuration from TOML files and environment variables,
//! with support for named database connection profiles and model settings.

use crate::backend::{DatabaseKind, DbConnection, LlmConfig as LlmWireConfig, ModelProvider};
use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for Parley.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend service settings.
    #[serde(default)]
    pub backend: BackendSettings,

    /// Model provider settings.
    #[serde(default)]
    pub llm: LlmSettings,

    /// Named database connection profiles.
    #[serde(default)]
    pub connections: HashMap<String, ConnectionProfile>,
}

/// Backend service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL of the backend service.
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Model provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Provider: "ollama", "openai", or "custom".
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model name (e.g., "llama3.2").
    #[serde(default = "default_model")]
    pub model: String,

    /// Model URL for the custom provider.
    pub url: Option<String>,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            url: None,
        }
    }
}

impl LlmSettings {
    /// Builds the wire descriptor sent to the backend.
    ///
    /// API keys never live in the config file; they come from the
    /// environment (`PARLEY_API_KEY`, falling back to `OPENAI_API_KEY`).
    pub fn to_wire_config(&self) -> Result<LlmWireConfig> {
        let provider: ModelProvider = self
            .provider
            .parse()
            .map_err(ParleyError::config)?;

        let api_key = match provider {
            ModelProvider::OpenAi => std::env::var("PARLEY_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            _ => None,
        };

        Ok(LlmWireConfig {
            provider,
            model: match provider {
                ModelProvider::Ollama => Some(self.model.clone()),
                _ => None,
            },
            url: match provider {
                ModelProvider::Custom => self.url.clone(),
                _ => None,
            },
            api_key,
        })
    }
}

/// A named database connection profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectionProfile {
    /// Database type: "postgres", "mysql", "mssql", or "sqlite".
    #[serde(default)]
    pub db_type: String,

    /// Database host.
    pub host: Option<String>,

    /// Database port.
    pub port: Option<u16>,

    /// Database name (file path for sqlite).
    pub database: Option<String>,

    /// Database user.
    pub user: Option<String>,

    /// Database password (not recommended to store in config).
    pub password: Option<String>,
}

impl ConnectionProfile {
    /// Builds the wire descriptor sent to the backend.
    pub fn to_db_connection(&self) -> Result<DbConnection> {
        let db_type: DatabaseKind = if self.db_type.is_empty() {
            DatabaseKind::default()
        } else {
            self.db_type.parse().map_err(ParleyError::config)?
        };

        let database = self
            .database
            .clone()
            .ok_or_else(|| ParleyError::config("Connection profile is missing 'database'"))?;

        let mut conn = DbConnection {
            db_type,
            db_name: database,
            ..Default::default()
        };

        if db_type != DatabaseKind::Sqlite {
            conn.db_host = self.host.clone();
            conn.db_port = self.port.or_else(|| db_type.default_port());
            conn.db_user = self.user.clone();
            conn.db_password = self.password.clone();
        }

        Ok(conn)
    }

    /// Applies environment variables (PGHOST, PGPORT, etc.) as defaults.
    pub fn apply_env_defaults(&mut self) {
        if self.host.is_none() {
            self.host = std::env::var("PGHOST").ok();
        }
        if self.port.is_none() {
            if let Ok(port_str) = std::env::var("PGPORT") {
                self.port = port_str.parse().ok();
            }
        }
        if self.database.is_none() {
            self.database = std::env::var("PGDATABASE").ok();
        }
        if self.user.is_none() {
            self.user = std::env::var("PGUSER").ok();
        }
        if self.password.is_none() {
            self.password = std::env::var("PGPASSWORD").ok();
        }
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("db-parley")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ParleyError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ParleyError::config(format!("Configuration error in {}:\n  {}", path.display(), e))
        })
    }

    /// Gets a named connection profile, or the default profile if name is None.
    pub fn get_connection(&self, name: Option<&str>) -> Option<&ConnectionProfile> {
        let key = name.unwrap_or("default");
        self.connections.get(key)
    }
}
