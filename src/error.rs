//! Error types for Parley.
//!
//! Defines the main error enum used throughout the application.

use thiserror::Error;

/// Main error type for Parley operations.
#[derive(Error, Debug)]
pub enum ParleyError {
    /// Input rejected before any store write or network call
    /// (empty prompt, incomplete session context, busy session).
    #[error("Validation error: {0}")]
    Validation(String),

    /// SQL generation call failed (network, parse, timeout).
    #[error("Generation error: {0}")]
    Generation(String),

    /// The backend rejected the SQL itself (distinguished status with
    /// structured detail, e.g. a syntax error).
    #[error("SQL rejected: {0}")]
    SqlRejected(String),

    /// Network/parse failure unrelated to SQL validity.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message store failures (insert, attach, migration).
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParleyError {
    /// Creates a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates a generation error with the given message.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Creates a SQL-rejected error with the given backend detail.
    pub fn sql_rejected(msg: impl Into<String>) -> Self {
        Self::SqlRejected(msg.into())
    }

    /// Creates a transport error with the given message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a store error with the given message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if a failed turn step may be answered with a
    /// regeneration attempt (budget permitting).
    ///
    /// Store, validation, and configuration failures are never retried.
    pub fn is_regenerable(&self) -> bool {
        matches!(
            self,
            Self::Generation(_) | Self::SqlRejected(_) | Self::Transport(_)
        )
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Validation Error",
            Self::Generation(_) => "Generation Error",
            Self::SqlRejected(_) => "SQL Error",
            Self::Transport(_) => "Transport Error",
            Self::Store(_) => "Store Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using ParleyError.
pub type Result<T> = std::result::Result<T, ParleyError>;
