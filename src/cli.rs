//! Command-line argument parsing for Parley.

use crate::backend::{DatabaseKind, DbConnection};
use crate::config::Config;
use crate::error::{ParleyError, Result};
use clap::Parser;
use std::path::PathBuf;

/// A natural-language chat client for your database.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Backend service URL
    #[arg(long, value_name = "URL", env = "PARLEY_BACKEND_URL")]
    pub backend: Option<String>,

    /// Database type (postgres, mysql, mssql, sqlite)
    #[arg(short = 't', long, value_name = "TYPE")]
    pub db_type: Option<String>,

    /// Database host
    #[arg(short = 'H', long, value_name = "HOST")]
    pub host: Option<String>,

    /// Database port
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Database name (file path for sqlite)
    #[arg(short = 'd', long, value_name = "DATABASE")]
    pub database: Option<String>,

    /// Database user
    #[arg(short = 'U', long, value_name = "USER")]
    pub user: Option<String>,

    /// Use named connection profile from config
    #[arg(short = 'c', long, value_name = "NAME")]
    pub connection: Option<String>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Chat database path override
    #[arg(long, value_name = "PATH")]
    pub store: Option<PathBuf>,

    /// Resume an existing chat session by id
    #[arg(short = 's', long, value_name = "ID")]
    pub session: Option<i64>,

    /// Model provider override (ollama, openai, custom)
    #[arg(long, value_name = "PROVIDER")]
    pub llm: Option<String>,

    /// Model name override (for ollama)
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Use a mock backend (no network, for trying the REPL out)
    #[arg(long)]
    pub mock: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Converts CLI arguments to a connection descriptor, if any were given.
    pub fn to_db_connection(&self) -> Result<Option<DbConnection>> {
        if self.db_type.is_none()
            && self.host.is_none()
            && self.database.is_none()
            && self.user.is_none()
        {
            return Ok(None);
        }

        let db_type: DatabaseKind = match &self.db_type {
            Some(s) => s.parse().map_err(ParleyError::config)?,
            None => DatabaseKind::default(),
        };

        let database = self
            .database
            .clone()
            .ok_or_else(|| ParleyError::config("--database is required with connection flags"))?;

        let mut conn = DbConnection {
            db_type,
            db_name: database,
            ..Default::default()
        };

        if db_type != DatabaseKind::Sqlite {
            conn.db_host = self.host.clone();
            conn.db_port = self.port.or_else(|| db_type.default_port());
            conn.db_user = self.user.clone();
            // Password comes from the environment, never argv.
            conn.db_password = std::env::var("PARLEY_DB_PASSWORD")
                .or_else(|_| std::env::var("PGPASSWORD"))
                .ok();
        }

        Ok(Some(conn))
    }

    /// Returns the config file path to use.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Returns the named connection profile to use, if specified.
    pub fn connection_name(&self) -> Option<&str> {
        self.connection.as_deref()
    }
}
