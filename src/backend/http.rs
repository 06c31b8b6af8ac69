//! HTTP client for the backend service.
//!
//! Thin JSON-over-POST wrappers around the backend endpoints. Error mapping
//! is the interesting part: a 422 from `/execute_sql` means the SQL itself
//! was rejected and carries a structured detail the orchestrator feeds back
//! into regeneration; every other failure is a transport error.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::backend::types::{
    ConnectionTestResponse, DbConnection, DbSchema, GenerateSqlRequest, ProbeRequest, ResultSet,
    SchemaResponse, SqlErrorResponse, SqlResponse, VisualizationRecommendation,
    VisualizationRequest,
};
use crate::backend::{SqlExecutor, SqlGenerator, VisualizationAdvisor};
use crate::error::{ParleyError, Result};
use async_trait::async_trait;

/// Default timeout for backend requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default backend base URL.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Backend client configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the backend service.
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl BackendConfig {
    /// Creates a config for the given base URL with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// HTTP client for the backend service.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: Url,
    client: Client,
}

impl HttpBackend {
    /// Creates a new client with the given configuration.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ParleyError::config(format!("Invalid backend URL: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ParleyError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { base_url, client })
    }

    /// Resolves an endpoint path against the base URL.
    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ParleyError::internal(format!("Invalid endpoint path {path}: {e}")))
    }

    /// Maps a reqwest error to the transport category with a readable message.
    fn map_request_error(e: reqwest::Error) -> ParleyError {
        if e.is_timeout() {
            ParleyError::transport("Request timed out")
        } else if e.is_connect() {
            ParleyError::transport("Failed to connect to backend service")
        } else {
            ParleyError::transport(format!("Request failed: {e}"))
        }
    }

    /// POSTs a JSON body and decodes a JSON response.
    ///
    /// Non-2xx statuses are reported as transport errors carrying the body.
    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!(endpoint = path, "Backend request");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ParleyError::transport(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(ParleyError::transport(format!(
                "Backend returned {status}: {text}"
            )));
        }

        serde_json::from_str(&text)
            .map_err(|e| ParleyError::transport(format!("Failed to parse response: {e}")))
    }

    /// Tests the database connection via the backend.
    pub async fn test_connection(&self, db: &DbConnection) -> Result<ConnectionTestResponse> {
        self.post_json("/test_db_connection", db).await
    }

    /// Fetches the database schema via the backend.
    pub async fn fetch_schema(&self, db: &DbConnection) -> Result<DbSchema> {
        let response: SchemaResponse = self.post_json("/get_db_schema", db).await?;
        if response.success {
            response
                .schema
                .ok_or_else(|| ParleyError::transport("Schema response missing schema"))
        } else {
            Err(ParleyError::transport(format!(
                "Schema fetch failed: {}",
                response.message.unwrap_or_else(|| "unknown error".into())
            )))
        }
    }

    /// Probes a model provider for liveness. Succeeds on any 2xx.
    pub async fn probe_model(&self, request: &ProbeRequest) -> Result<()> {
        let url = self.endpoint("/probe_llm")?;
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ParleyError::transport(format!(
                "Model probe returned {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl SqlGenerator for HttpBackend {
    async fn generate_sql(&self, request: &GenerateSqlRequest) -> Result<String> {
        let response: SqlResponse = self
            .post_json("/generate_sql", request)
            .await
            .map_err(|e| ParleyError::generation(e.to_string()))?;

        debug!(sql_len = response.sql.len(), "SQL generated");
        Ok(response.sql)
    }
}

#[async_trait]
impl SqlExecutor for HttpBackend {
    async fn execute_sql(&self, sql: &str, db: &DbConnection) -> Result<ResultSet> {
        let url = self.endpoint("/execute_sql")?;
        let body = serde_json::json!({ "sql": sql, "db_connection": db });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ParleyError::transport(format!("Failed to read response: {e}")))?;

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            // SQL-level rejection with a structured detail.
            let detail = serde_json::from_str::<SqlErrorResponse>(&text)
                .map(|e| e.detail.message().to_string())
                .unwrap_or_else(|_| "SQL error".to_string());
            return Err(ParleyError::sql_rejected(detail));
        }

        if !status.is_success() {
            return Err(ParleyError::transport(format!(
                "Backend returned {status}: {text}"
            )));
        }

        serde_json::from_str(&text)
            .map_err(|e| ParleyError::transport(format!("Failed to parse results: {e}")))
    }
}

#[async_trait]
impl VisualizationAdvisor for HttpBackend {
    async fn recommend_visualization(
        &self,
        request: &VisualizationRequest,
    ) -> Result<VisualizationRecommendation> {
        self.post_json("/recommend_visualization", request).await
    }
}
