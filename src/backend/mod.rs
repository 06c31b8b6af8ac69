//! Clients for the NL→SQL backend service.
//!
//! The backend owns the hard parts: prompt construction, model calls, SQL
//! execution and sandboxing, schema introspection. This module provides the
//! HTTP clients for its endpoints and the traits the orchestrator consumes,
//! so tests can substitute a scripted mock.

mod http;
mod mock;
mod types;

pub use http::{BackendConfig, HttpBackend};
pub use mock::{ExecStep, GenStep, MockBackend};
pub use types::{
    ConnectionTestResponse, DatabaseKind, DbConnection, DbSchema, GenerateSqlRequest,
    HistoryMessage, LlmConfig, ModelProvider, ProbeRequest, ResultSet, SchemaResponse,
    SqlErrorDetail, SqlErrorResponse, SqlResponse, VisualizationRecommendation,
    VisualizationRequest,
};

use crate::error::Result;
use async_trait::async_trait;

/// Translates a natural-language prompt (plus context) into a SQL statement.
///
/// Stateless request/response; regeneration context travels in the request.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, request: &GenerateSqlRequest) -> Result<String>;
}

/// Executes a SQL statement against the connected database.
///
/// A rejected statement (backend-side SQL error) comes back as
/// `ParleyError::SqlRejected`; anything else network-shaped as
/// `ParleyError::Transport`.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute_sql(&self, sql: &str, db: &DbConnection) -> Result<ResultSet>;
}

/// Recommends a chart for a result set. Optional enrichment, never on the
/// critical path of a turn.
#[async_trait]
pub trait VisualizationAdvisor: Send + Sync {
    async fn recommend_visualization(
        &self,
        request: &VisualizationRequest,
    ) -> Result<VisualizationRecommendation>;
}
