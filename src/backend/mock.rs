//! Mock backend for testing.
//!
//! Scripted generation/execution outcomes with call counters, so orchestrator
//! tests can assert exactly how many backend calls a turn made without any
//! network. With no script, generation falls back to simple pattern matching
//! on the prompt and execution returns an empty result set.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::types::{
    DbConnection, GenerateSqlRequest, ResultSet, VisualizationRecommendation, VisualizationRequest,
};
use crate::backend::{SqlExecutor, SqlGenerator, VisualizationAdvisor};
use crate::error::{ParleyError, Result};
use async_trait::async_trait;

/// One scripted outcome for a generation call.
#[derive(Debug, Clone)]
pub enum GenStep {
    /// Return this SQL.
    Sql(String),
    /// Fail with a generation transport error.
    Fail(String),
}

/// One scripted outcome for an execution call.
#[derive(Debug, Clone)]
pub enum ExecStep {
    /// Return this result set.
    Rows(ResultSet),
    /// Fail with a SQL-level rejection (backend 422).
    SqlError(String),
    /// Fail with a transport error.
    Fail(String),
}

/// Scriptable mock implementing all backend traits.
#[derive(Debug, Default)]
pub struct MockBackend {
    gen_script: Mutex<VecDeque<GenStep>>,
    exec_script: Mutex<VecDeque<ExecStep>>,
    gen_calls: AtomicUsize,
    exec_calls: AtomicUsize,
    /// Artificial latency per execution call, for concurrency tests.
    exec_delay: Option<Duration>,
    /// Captured generation requests, newest last.
    gen_requests: Mutex<Vec<GenerateSqlRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful generation returning the given SQL.
    pub fn with_generated_sql(self, sql: impl Into<String>) -> Self {
        self.gen_script
            .lock()
            .unwrap()
            .push_back(GenStep::Sql(sql.into()));
        self
    }

    /// Queues a failing generation call.
    pub fn with_generation_failure(self, message: impl Into<String>) -> Self {
        self.gen_script
            .lock()
            .unwrap()
            .push_back(GenStep::Fail(message.into()));
        self
    }

    /// Queues a successful execution returning the given result set.
    pub fn with_execution_rows(self, result: ResultSet) -> Self {
        self.exec_script
            .lock()
            .unwrap()
            .push_back(ExecStep::Rows(result));
        self
    }

    /// Queues an execution rejected by the backend (SQL-level error).
    pub fn with_sql_error(self, detail: impl Into<String>) -> Self {
        self.exec_script
            .lock()
            .unwrap()
            .push_back(ExecStep::SqlError(detail.into()));
        self
    }

    /// Queues an execution failing at the transport level.
    pub fn with_execution_failure(self, message: impl Into<String>) -> Self {
        self.exec_script
            .lock()
            .unwrap()
            .push_back(ExecStep::Fail(message.into()));
        self
    }

    /// Adds artificial latency to every execution call.
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Number of generation calls made so far.
    pub fn generation_calls(&self) -> usize {
        self.gen_calls.load(Ordering::SeqCst)
    }

    /// Number of execution calls made so far.
    pub fn execution_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    /// Clones the generation requests seen so far, oldest first.
    pub fn generation_requests(&self) -> Vec<GenerateSqlRequest> {
        self.gen_requests.lock().unwrap().clone()
    }

    /// Default generation when no script is queued.
    fn pattern_response(prompt: &str) -> String {
        let prompt = prompt.to_lowercase();

        if prompt.contains("customers") && prompt.contains("top") {
            return "SELECT * FROM customers ORDER BY total_value DESC LIMIT 5".to_string();
        }
        if prompt.contains("count") && prompt.contains("orders") {
            return "SELECT COUNT(*) FROM orders".to_string();
        }
        if prompt.contains("users") {
            return "SELECT * FROM users".to_string();
        }

        "SELECT 1".to_string()
    }
}

#[async_trait]
impl SqlGenerator for MockBackend {
    async fn generate_sql(&self, request: &GenerateSqlRequest) -> Result<String> {
        self.gen_calls.fetch_add(1, Ordering::SeqCst);
        self.gen_requests.lock().unwrap().push(request.clone());

        let step = self.gen_script.lock().unwrap().pop_front();
        match step {
            Some(GenStep::Sql(sql)) => Ok(sql),
            Some(GenStep::Fail(message)) => Err(ParleyError::generation(message)),
            None => Ok(Self::pattern_response(&request.user_prompt)),
        }
    }
}

#[async_trait]
impl SqlExecutor for MockBackend {
    async fn execute_sql(&self, sql: &str, _db: &DbConnection) -> Result<ResultSet> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }

        let step = self.exec_script.lock().unwrap().pop_front();
        match step {
            Some(ExecStep::Rows(result)) => Ok(result),
            Some(ExecStep::SqlError(detail)) => Err(ParleyError::sql_rejected(detail)),
            Some(ExecStep::Fail(message)) => Err(ParleyError::transport(message)),
            None => {
                let _ = sql;
                Ok(ResultSet::default())
            }
        }
    }
}

#[async_trait]
impl VisualizationAdvisor for MockBackend {
    async fn recommend_visualization(
        &self,
        _request: &VisualizationRequest,
    ) -> Result<VisualizationRecommendation> {
        Ok(VisualizationRecommendation {
            visualization: true,
            chart_type: Some("bar".to_string()),
            x_axis: Some("x".to_string()),
            y_axis: Some("y".to_string()),
            title: None,
            explanation: None,
        })
    }
}
