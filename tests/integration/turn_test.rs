//! Integration tests for the chat turn orchestrator.
//!
//! Each test drives full turns through a scripted mock backend and asserts
//! against the persisted message log and the mock's call counters.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use db_parley::backend::{
    DatabaseKind, DbConnection, LlmConfig, MockBackend, ResultSet, SqlExecutor, SqlGenerator,
    VisualizationAdvisor,
};
use db_parley::error::ParleyError;
use db_parley::orchestrator::{
    rendered_view, SessionContext, TurnOrchestrator, TurnOutcome, ASSISTANT_NARRATIVE,
    FALLBACK_MESSAGE,
};
use db_parley::store::{message_log, session_log, ChatStore, MessageRole, NewMessage};

async fn setup(
    mock: MockBackend,
) -> (
    Arc<TurnOrchestrator>,
    Arc<MockBackend>,
    Arc<ChatStore>,
    SessionContext,
) {
    let store = Arc::new(ChatStore::open_in_memory().await.unwrap());
    let session = session_log::create_session(store.pool(), "local", None)
        .await
        .unwrap();

    let mock = Arc::new(mock);
    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&mock) as Arc<dyn SqlGenerator>,
        Arc::clone(&mock) as Arc<dyn SqlExecutor>,
        Arc::clone(&mock) as Arc<dyn VisualizationAdvisor>,
    ));

    let ctx = SessionContext {
        session_id: session.id,
        db: DbConnection {
            db_type: DatabaseKind::Postgres,
            db_host: Some("localhost".to_string()),
            db_port: Some(5432),
            db_name: "shop".to_string(),
            db_user: Some("reader".to_string()),
            db_password: None,
        },
        llm: LlmConfig::default(),
    };

    (orchestrator, mock, store, ctx)
}

fn five_customer_rows() -> ResultSet {
    ResultSet {
        columns: vec![
            "name".to_string(),
            "orders".to_string(),
            "total_value".to_string(),
        ],
        rows: (0..5)
            .map(|i| {
                vec![
                    serde_json::json!(format!("customer-{i}")),
                    serde_json::json!(10 - i),
                    serde_json::json!(1000 - i * 100),
                ]
            })
            .collect(),
    }
}

// Property 1: exactly one user message is appended, before any backend call,
// and it survives even when every generation attempt fails.
#[tokio::test]
async fn user_message_persisted_once_even_when_generation_fails() {
    let mock = MockBackend::new()
        .with_generation_failure("connection refused")
        .with_generation_failure("connection refused")
        .with_generation_failure("connection refused");
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    let outcome = orchestrator
        .submit_prompt("Show me the top 5 customers by order value", &ctx)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Exhausted);

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();
    let user_messages: Vec<_> = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .collect();
    assert_eq!(user_messages.len(), 1);
    assert_eq!(
        user_messages[0].content,
        "Show me the top 5 customers by order value"
    );

    assert_eq!(mock.generation_calls(), 3);
    assert_eq!(mock.execution_calls(), 0);
}

// Property 2: the regeneration chain is bounded at three distinct assistant
// messages and always terminates.
#[tokio::test]
async fn regeneration_chain_is_bounded() {
    let mock = MockBackend::new()
        .with_generated_sql("SELECT a")
        .with_sql_error("column a does not exist")
        .with_generated_sql("SELECT b")
        .with_sql_error("column b does not exist")
        .with_generated_sql("SELECT c")
        .with_sql_error("column c does not exist");
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    let outcome = orchestrator.submit_prompt("impossible", &ctx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Exhausted);

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();
    let with_sql: Vec<_> = messages.iter().filter(|m| m.has_sql()).collect();
    assert_eq!(with_sql.len(), 3);

    let sqls: Vec<_> = with_sql.iter().map(|m| m.sql.as_deref().unwrap()).collect();
    assert_eq!(sqls, vec!["SELECT a", "SELECT b", "SELECT c"]);

    assert_eq!(with_sql[0].attempt, Some(1));
    assert_eq!(with_sql[1].attempt, Some(2));
    assert_eq!(with_sql[2].attempt, Some(3));

    // All three attempts share the originating user message as group.
    let user_id = messages[0].id;
    assert!(with_sql.iter().all(|m| m.query_group_id == Some(user_id)));

    assert_eq!(mock.generation_calls(), 3);
    assert_eq!(mock.execution_calls(), 3);
}

// Property 3: concurrent duplicate execution triggers collapse to a single
// backend call.
#[tokio::test]
async fn concurrent_execution_is_deduplicated() {
    let mock = MockBackend::new().with_execution_delay(Duration::from_millis(100));
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    let assistant = message_log::append_message(
        store.pool(),
        ctx.session_id,
        NewMessage::assistant(ASSISTANT_NARRATIVE).with_sql("SELECT * FROM users"),
    )
    .await
    .unwrap();

    let first = orchestrator.execute_sql("SELECT * FROM users", assistant.id, &ctx);
    let second = orchestrator.execute_sql("SELECT * FROM users", assistant.id, &ctx);
    let (first, second) = tokio::join!(first, second);

    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_none()).count(), 1);

    assert_eq!(mock.execution_calls(), 1);

    // The flag cleared; a later trigger executes again.
    let again = orchestrator
        .execute_sql("SELECT * FROM users", assistant.id, &ctx)
        .await
        .unwrap();
    assert!(again.is_some());
    assert_eq!(mock.execution_calls(), 2);
}

// Property 4: the result message carries the SQL that produced it.
#[tokio::test]
async fn result_message_carries_matching_sql() {
    let mock = MockBackend::new()
        .with_generated_sql("SELECT id FROM orders")
        .with_execution_rows(ResultSet {
            columns: vec!["id".to_string()],
            rows: vec![vec![serde_json::json!(1)]],
        });
    let (orchestrator, _mock, store, ctx) = setup(mock).await;

    orchestrator.submit_prompt("orders", &ctx).await.unwrap();

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();
    let assistant = messages
        .iter()
        .find(|m| m.role == MessageRole::Assistant)
        .unwrap();
    let system = messages
        .iter()
        .find(|m| m.role == MessageRole::System)
        .unwrap();

    assert_eq!(system.sql, assistant.sql);
    assert_eq!(system.sql.as_deref(), Some("SELECT id FROM orders"));
}

// Property 5: the top-5-customers scenario end to end.
#[tokio::test]
async fn top_five_customers_scenario() {
    let mock = MockBackend::new()
        .with_generated_sql("SELECT * FROM customers ORDER BY total_value DESC LIMIT 5")
        .with_execution_rows(five_customer_rows());
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    let outcome = orchestrator
        .submit_prompt("Show me the top 5 customers by order value", &ctx)
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Succeeded { row_count, .. } => assert_eq!(row_count, 5),
        other => panic!("Expected success, got {other:?}"),
    }

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();
    let results_messages: Vec<_> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System && m.content.starts_with("Query returned"))
        .collect();

    assert_eq!(results_messages.len(), 1);
    assert_eq!(results_messages[0].content, "Query returned 5 rows.");

    let results = results_messages[0].results.as_ref().unwrap();
    assert_eq!(results.rows.len(), 5);
    assert_eq!(results.columns.len(), 3);

    assert_eq!(mock.generation_calls(), 1);
    assert_eq!(mock.execution_calls(), 1);
}

// Property 6: a 422 triggers a corrective regeneration; the superseded
// attempt stays in the raw store but leaves the rendered view.
#[tokio::test]
async fn sql_error_regenerates_with_corrective_context() {
    let mock = MockBackend::new()
        .with_generated_sql("SELCT * FROM customers")
        .with_sql_error("syntax error at or near \"SELCT\"")
        .with_generated_sql("SELECT * FROM customers")
        .with_execution_rows(five_customer_rows());
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    let outcome = orchestrator
        .submit_prompt("Show me the top 5 customers by order value", &ctx)
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Succeeded { .. }));

    // The second generation call carried the failed SQL and its error.
    let requests = mock.generation_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].failed_sql.is_none());
    assert!(requests[0].error_message.is_none());
    assert_eq!(requests[1].failed_sql.as_deref(), Some("SELCT * FROM customers"));
    assert!(requests[1]
        .error_message
        .as_deref()
        .unwrap()
        .contains("SELCT"));

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();

    // Exactly one final result message.
    let results_messages: Vec<_> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System && m.content.starts_with("Query returned"))
        .collect();
    assert_eq!(results_messages.len(), 1);

    // Raw store keeps both attempts; the rendered view hides the first.
    let raw_sqls: Vec<_> = messages
        .iter()
        .filter(|m| m.has_sql())
        .map(|m| m.sql.as_deref().unwrap())
        .collect();
    assert_eq!(raw_sqls, vec!["SELCT * FROM customers", "SELECT * FROM customers"]);

    let view = rendered_view(&messages);
    let view_sqls: Vec<_> = view
        .iter()
        .filter(|m| m.has_sql())
        .map(|m| m.sql.as_deref().unwrap())
        .collect();
    assert_eq!(view_sqls, vec!["SELECT * FROM customers"]);
}

// Property 7: three consecutive failures persist the fixed fallback and make
// no fourth generation call.
#[tokio::test]
async fn exhaustion_persists_fallback_message() {
    let mock = MockBackend::new()
        .with_generated_sql("SELECT a")
        .with_sql_error("nope")
        .with_generated_sql("SELECT b")
        .with_execution_failure("connection reset")
        .with_generated_sql("SELECT c")
        .with_sql_error("still nope");
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    let outcome = orchestrator.submit_prompt("anything", &ctx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Exhausted);

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    assert_eq!(last.content, FALLBACK_MESSAGE);
    assert!(last.sql.is_none());

    assert_eq!(mock.generation_calls(), 3);
}

// Generation transport failures and execution failures share one budget.
#[tokio::test]
async fn generation_and_execution_failures_share_the_budget() {
    let mock = MockBackend::new()
        .with_generation_failure("timeout")
        .with_generated_sql("SELECT a")
        .with_sql_error("bad column")
        .with_generated_sql("SELECT b")
        .with_sql_error("bad column again");
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    let outcome = orchestrator.submit_prompt("anything", &ctx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Exhausted);

    // One failed generation + two failed executions = three attempts total.
    assert_eq!(mock.generation_calls(), 3);
    assert_eq!(mock.execution_calls(), 2);

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();
    assert_eq!(messages.last().unwrap().content, FALLBACK_MESSAGE);
}

// A hung execution call is abandoned at the timeout and regenerated.
#[tokio::test]
async fn execution_timeout_counts_as_transport_failure() {
    let mock = MockBackend::new()
        .with_generated_sql("SELECT a")
        .with_generated_sql("SELECT b")
        .with_generated_sql("SELECT c")
        .with_execution_delay(Duration::from_millis(200));
    let (store, session_id) = {
        let store = Arc::new(ChatStore::open_in_memory().await.unwrap());
        let session = session_log::create_session(store.pool(), "local", None)
            .await
            .unwrap();
        (store, session.id)
    };

    let mock = Arc::new(mock);
    let orchestrator = TurnOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&mock) as Arc<dyn SqlGenerator>,
        Arc::clone(&mock) as Arc<dyn SqlExecutor>,
        Arc::clone(&mock) as Arc<dyn VisualizationAdvisor>,
    )
    .with_timeouts(Duration::from_secs(1), Duration::from_millis(20));

    let ctx = SessionContext {
        session_id,
        db: DbConnection {
            db_type: DatabaseKind::Sqlite,
            db_name: "test.db".to_string(),
            ..Default::default()
        },
        llm: LlmConfig::default(),
    };

    let outcome = orchestrator.submit_prompt("anything", &ctx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Exhausted);
    assert_eq!(mock.generation_calls(), 3);
}

// A second submit for the same session is rejected while a turn is active;
// an independent session is unaffected.
#[tokio::test]
async fn concurrent_turns_gate_per_session() {
    let mock = MockBackend::new().with_execution_delay(Duration::from_millis(100));
    let (orchestrator, _mock, store, ctx) = setup(mock).await;

    let other_session = session_log::create_session(store.pool(), "local", None)
        .await
        .unwrap();
    let other_ctx = SessionContext {
        session_id: other_session.id,
        ..ctx.clone()
    };

    let busy = Arc::clone(&orchestrator);
    let busy_ctx = ctx.clone();
    let first = tokio::spawn(async move { busy.submit_prompt("show users", &busy_ctx).await });

    // Give the first turn time to claim the session.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = orchestrator
        .submit_prompt("another question", &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Validation(_)));

    // A different session proceeds normally.
    let outcome = orchestrator
        .submit_prompt("show users", &other_ctx)
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Succeeded { .. }));

    first.await.unwrap().unwrap();
}

// A session deleted mid-turn is fatal for that turn and never retried.
#[tokio::test]
async fn vanished_session_aborts_the_turn() {
    let mock = MockBackend::new();
    let (orchestrator, mock, store, ctx) = setup(mock).await;

    session_log::delete_session(store.pool(), ctx.session_id)
        .await
        .unwrap();

    let err = orchestrator
        .submit_prompt("show users", &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Store(_)));
    assert_eq!(mock.generation_calls(), 0);
}

// The visualization flow attaches the recommendation and appends a summary.
#[tokio::test]
async fn visualization_request_appends_summary() {
    let mock = MockBackend::new()
        .with_generated_sql("SELECT * FROM customers ORDER BY total_value DESC LIMIT 5")
        .with_execution_rows(five_customer_rows());
    let (orchestrator, _mock, store, ctx) = setup(mock).await;

    let outcome = orchestrator
        .submit_prompt("Show me the top 5 customers by order value", &ctx)
        .await
        .unwrap();
    let message_id = match outcome {
        TurnOutcome::Succeeded { message_id, .. } => message_id,
        other => panic!("Expected success, got {other:?}"),
    };

    orchestrator
        .request_visualization(message_id, &ctx)
        .await
        .unwrap();

    let messages = message_log::list_messages(store.pool(), ctx.session_id)
        .await
        .unwrap();

    let result_message = messages.iter().find(|m| m.id == message_id).unwrap();
    assert!(result_message.visualization.is_some());

    let last = messages.last().unwrap();
    assert_eq!(last.role, MessageRole::System);
    assert!(last.content.contains("recommend"));
}

// The executing flag is observable mid-execution and cleared afterwards.
#[tokio::test]
async fn executing_flag_tracks_in_flight_work() {
    let mock = MockBackend::new().with_execution_delay(Duration::from_millis(100));
    let (orchestrator, _mock, store, ctx) = setup(mock).await;

    let assistant = message_log::append_message(
        store.pool(),
        ctx.session_id,
        NewMessage::assistant(ASSISTANT_NARRATIVE).with_sql("SELECT 1"),
    )
    .await
    .unwrap();

    assert!(!orchestrator.is_executing(assistant.id));

    let running = Arc::clone(&orchestrator);
    let running_ctx = ctx.clone();
    let task =
        tokio::spawn(async move { running.execute_sql("SELECT 1", assistant.id, &running_ctx).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(orchestrator.is_executing(assistant.id));

    task.await.unwrap().unwrap();
    assert!(!orchestrator.is_executing(assistant.id));
}
