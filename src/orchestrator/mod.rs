//! Chat turn orchestration.
//!
//! Converts one user prompt into a persisted, bounded sequence of
//! generate → execute → (maybe regenerate) steps. The orchestrator owns all
//! transient turn state (the per-session state machine, the per-message
//! in-flight execution set, and the shared attempt budget) as explicit
//! fields, so independent sessions run turns without cross-talk and nothing
//! leaks into globals.
//!
//! Outcomes are observed through the message log: every failure the user
//! should see becomes a chat message, never an unhandled error.

mod actor;
pub mod policy;
mod view;

pub use actor::{OrchestratorActor, OrchestratorCommand, OrchestratorHandle, OrchestratorResponse, TurnId};
pub use policy::{TurnState, ASSISTANT_NARRATIVE, FALLBACK_MESSAGE, MAX_ATTEMPTS};
pub use view::rendered_view;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{
    DbConnection, GenerateSqlRequest, HistoryMessage, LlmConfig, SqlExecutor, SqlGenerator,
    VisualizationAdvisor, VisualizationRequest,
};
use crate::error::{ParleyError, Result};
use crate::store::{message_log, ChatStore, MessageRole, NewMessage, StoredMessage};
use policy::{
    result_summary, FailureContext, RetryBudget, EXECUTION_TIMEOUT, GENERATION_TIMEOUT,
    HISTORY_WINDOW,
};

/// Everything a turn needs besides the prompt.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: i64,
    pub db: DbConnection,
    pub llm: LlmConfig,
}

impl SessionContext {
    /// Validates the context before any store write or network call.
    pub fn validate(&self) -> Result<()> {
        if self.session_id <= 0 {
            return Err(ParleyError::validation("A valid session id is required"));
        }
        self.db.validate()?;
        self.llm.validate()?;
        Ok(())
    }
}

/// How a completed turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Execution succeeded; the result message id and its row count.
    Succeeded { message_id: i64, row_count: usize },
    /// The attempt budget was consumed; the fallback message was persisted.
    Exhausted,
}

/// The chat turn orchestrator.
pub struct TurnOrchestrator {
    store: Arc<ChatStore>,
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn SqlExecutor>,
    advisor: Arc<dyn VisualizationAdvisor>,
    /// Per-session turn state. Keyed by session id so sessions are independent.
    turn_states: Mutex<HashMap<i64, TurnState>>,
    /// Message ids with an execution call outstanding, mapped to their session.
    in_flight: Mutex<HashMap<i64, i64>>,
    generation_timeout: Duration,
    execution_timeout: Duration,
}

impl TurnOrchestrator {
    /// Creates a new orchestrator over the given store and backend clients.
    pub fn new(
        store: Arc<ChatStore>,
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn SqlExecutor>,
        advisor: Arc<dyn VisualizationAdvisor>,
    ) -> Self {
        Self {
            store,
            generator,
            executor,
            advisor,
            turn_states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            generation_timeout: GENERATION_TIMEOUT,
            execution_timeout: EXECUTION_TIMEOUT,
        }
    }

    /// Overrides the backend call timeouts (shorter in tests).
    pub fn with_timeouts(mut self, generation: Duration, execution: Duration) -> Self {
        self.generation_timeout = generation;
        self.execution_timeout = execution;
        self
    }

    /// Returns the turn state for a session.
    pub fn state_of(&self, session_id: i64) -> TurnState {
        self.turn_states
            .lock()
            .unwrap()
            .get(&session_id)
            .copied()
            .unwrap_or_default()
    }

    /// True while an execution call is outstanding for the message.
    ///
    /// This is the transient `executing` flag the presentation layer reads;
    /// it is never persisted.
    pub fn is_executing(&self, message_id: i64) -> bool {
        self.in_flight.lock().unwrap().contains_key(&message_id)
    }

    fn set_state(&self, session_id: i64, state: TurnState) {
        self.turn_states.lock().unwrap().insert(session_id, state);
    }

    /// Releases a session after its turn future was dropped (cancellation).
    ///
    /// Resets the turn state to idle and clears any in-flight execution flags
    /// the abandoned turn left behind.
    pub fn reset_session(&self, session_id: i64) {
        self.set_state(session_id, TurnState::Idle);
        self.in_flight
            .lock()
            .unwrap()
            .retain(|_, owner| *owner != session_id);
    }

    /// Submits a user prompt and drives the full turn to its terminal
    /// message.
    ///
    /// Rejected with a validation error, before any store write, when the
    /// prompt is empty, the context is incomplete, or the session already has
    /// an active turn.
    pub async fn submit_prompt(&self, prompt: &str, ctx: &SessionContext) -> Result<TurnOutcome> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ParleyError::validation("Prompt must not be empty"));
        }
        ctx.validate()?;

        // Claim the session; concurrent submits for the same session are
        // rejected, not queued.
        {
            let mut states = self.turn_states.lock().unwrap();
            let state = states.entry(ctx.session_id).or_default();
            if state.is_active() {
                return Err(ParleyError::validation(
                    "A turn is already in progress for this session",
                ));
            }
            *state = TurnState::Generating;
        }

        let outcome = self.run_turn(prompt, ctx).await;
        self.set_state(ctx.session_id, TurnState::Idle);
        outcome
    }

    /// The generate → execute → regenerate loop for one prompt.
    async fn run_turn(&self, prompt: &str, ctx: &SessionContext) -> Result<TurnOutcome> {
        let pool = self.store.pool();
        let session_id = ctx.session_id;

        // History window from before this prompt, then exactly one user
        // message ahead of any backend call.
        let history = message_log::list_messages(pool, session_id).await?;
        let window = history_window(&history);
        let user = message_log::append_message(pool, session_id, NewMessage::user(prompt)).await?;

        info!(session_id, user_message_id = user.id, "Turn started");

        let mut budget = RetryBudget::default();
        let mut corrective: Option<FailureContext> = None;

        loop {
            let Some(attempt) = budget.start_attempt() else {
                return self.finish_exhausted(ctx, user.id).await;
            };

            self.set_state(session_id, TurnState::Generating);

            let request = GenerateSqlRequest {
                user_prompt: prompt.to_string(),
                message_history: window.clone(),
                db_connection: ctx.db.clone(),
                llm_config: ctx.llm.clone(),
                failed_sql: corrective.as_ref().map(|c| c.failed_sql.clone()),
                error_message: corrective.take().map(|c| c.error_message),
            };

            let sql = match self.call_generator(&request).await {
                Ok(sql) => sql,
                Err(e) if e.is_regenerable() => {
                    warn!(session_id, attempt, error = %e, "Generation failed");
                    self.set_state(session_id, TurnState::Regenerating);
                    continue;
                }
                Err(e) => return Err(e),
            };

            debug!(session_id, attempt, sql_len = sql.len(), "SQL generated");

            let assistant = message_log::append_message(
                pool,
                session_id,
                NewMessage::assistant(ASSISTANT_NARRATIVE)
                    .with_sql(&sql)
                    .with_group(user.id, attempt as i64),
            )
            .await?;

            // Generation chains directly into execution; there is no separate
            // user-triggered step.
            self.set_state(session_id, TurnState::Executing);

            match self.execute_sql(&sql, assistant.id, ctx).await {
                Ok(Some((message_id, row_count))) => {
                    self.set_state(session_id, TurnState::Succeeded);
                    info!(session_id, attempt, row_count, "Turn succeeded");
                    return Ok(TurnOutcome::Succeeded {
                        message_id,
                        row_count,
                    });
                }
                Ok(None) => {
                    // A fresh message id cannot already be in flight.
                    return Err(ParleyError::internal(
                        "Execution de-duplicated a brand-new message",
                    ));
                }
                Err(e) if e.is_regenerable() => {
                    warn!(session_id, attempt, error = %e, "Execution failed");
                    corrective = Some(FailureContext {
                        failed_sql: sql,
                        error_message: error_detail(&e),
                    });
                    self.set_state(session_id, TurnState::Regenerating);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persists the terminal fallback message once the budget is spent.
    async fn finish_exhausted(&self, ctx: &SessionContext, group_id: i64) -> Result<TurnOutcome> {
        self.set_state(ctx.session_id, TurnState::Exhausted);
        info!(session_id = ctx.session_id, "Attempt budget exhausted");

        let fallback = NewMessage {
            role: Some(MessageRole::Assistant),
            content: FALLBACK_MESSAGE.to_string(),
            sql: None,
            query_group_id: Some(group_id),
            attempt: None,
        };
        message_log::append_message(self.store.pool(), ctx.session_id, fallback).await?;

        Ok(TurnOutcome::Exhausted)
    }

    /// Calls the generation client under its timeout.
    async fn call_generator(&self, request: &GenerateSqlRequest) -> Result<String> {
        match tokio::time::timeout(self.generation_timeout, self.generator.generate_sql(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ParleyError::transport("Generation timed out")),
        }
    }

    /// Executes SQL for a message, guarded by the per-message in-flight flag.
    ///
    /// Returns `Ok(None)` when the message is already executing; the
    /// duplicate trigger makes no backend call. On success, returns the
    /// result message id and row count.
    pub async fn execute_sql(
        &self,
        sql: &str,
        message_id: i64,
        ctx: &SessionContext,
    ) -> Result<Option<(i64, usize)>> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.contains_key(&message_id) {
                debug!(message_id, "Execution already in flight, skipping");
                return Ok(None);
            }
            in_flight.insert(message_id, ctx.session_id);
        }

        let result = self.run_execution(sql, message_id, ctx).await;

        // Finally-equivalent: the flag clears on every outcome.
        self.in_flight.lock().unwrap().remove(&message_id);

        result.map(Some)
    }

    async fn run_execution(
        &self,
        sql: &str,
        message_id: i64,
        ctx: &SessionContext,
    ) -> Result<(i64, usize)> {
        debug!(message_id, "Executing SQL");

        let results = match tokio::time::timeout(
            self.execution_timeout,
            self.executor.execute_sql(sql, &ctx.db),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ParleyError::transport("Execution timed out")),
        };

        let row_count = results.row_count();

        // Two separate writes: the narrative message, then the results. A
        // failure attaching results leaves the message visible and is not
        // retried.
        let message = message_log::append_message(
            self.store.pool(),
            ctx.session_id,
            NewMessage::system(result_summary(row_count)).with_sql(sql),
        )
        .await?;

        if let Err(e) = message_log::attach_results(self.store.pool(), message.id, &results).await
        {
            warn!(message_id = message.id, error = %e, "Failed to attach results");
        }

        Ok((message.id, row_count))
    }

    /// Asks the backend for a chart recommendation for a result message and
    /// appends the outcome as a system message.
    ///
    /// Off the critical path: a failure becomes a chat message, never an
    /// error surfaced to the caller.
    pub async fn request_visualization(&self, message_id: i64, ctx: &SessionContext) -> Result<()> {
        let pool = self.store.pool();

        let message = message_log::get_message(pool, message_id)
            .await?
            .ok_or_else(|| ParleyError::validation(format!("No message with id {message_id}")))?;
        let Some(results) = message.results else {
            return Err(ParleyError::validation(
                "Message has no results to visualize",
            ));
        };

        let history = message_log::list_messages(pool, ctx.session_id).await?;
        let question = history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let request = VisualizationRequest {
            question,
            columns: results.columns.clone(),
            rows: results.rows.clone(),
            llm_config: ctx.llm.clone(),
        };

        let content = match self.advisor.recommend_visualization(&request).await {
            Ok(recommendation) => {
                if let Err(e) =
                    message_log::attach_visualization(pool, message_id, &recommendation).await
                {
                    warn!(message_id, error = %e, "Failed to store visualization");
                }
                recommendation.summary()
            }
            Err(e) => {
                warn!(message_id, error = %e, "Visualization recommendation failed");
                format!("Could not generate visualization: {e}")
            }
        };

        message_log::append_message(pool, ctx.session_id, NewMessage::system(content)).await?;
        Ok(())
    }
}

/// Maps the last few stored messages into the generation request's history.
fn history_window(messages: &[StoredMessage]) -> Vec<HistoryMessage> {
    messages
        .iter()
        .rev()
        .take(HISTORY_WINDOW)
        .rev()
        .map(|m| HistoryMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        })
        .collect()
}

/// Extracts the corrective error text carried into regeneration.
fn error_detail(error: &ParleyError) -> String {
    match error {
        ParleyError::SqlRejected(detail) => detail.clone(),
        other => other.to_string(),
    }
}
