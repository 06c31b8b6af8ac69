//! Integration tests for the message store.

use db_parley::backend::ResultSet;
use db_parley::store::{message_log, session_log, ChatStore, MessageRole, NewMessage};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn sample_results() -> ResultSet {
    ResultSet {
        columns: vec!["id".to_string(), "name".to_string()],
        rows: vec![
            vec![serde_json::json!(1), serde_json::json!("Alice")],
            vec![serde_json::json!(2), serde_json::json!("Bob")],
        ],
    }
}

#[tokio::test]
async fn store_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chat.db");

    let session_id = {
        let db = ChatStore::open(&path).await.unwrap();
        let session = session_log::create_session(db.pool(), "local", Some("persisted"))
            .await
            .unwrap();
        message_log::append_message(db.pool(), session.id, NewMessage::user("hello"))
            .await
            .unwrap();
        db.close().await;
        session.id
    };

    let db = ChatStore::open(&path).await.unwrap();
    let messages = message_log::list_messages(db.pool(), session_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello");
    db.close().await;
}

// Property 8: attaching identical results twice leaves exactly one results
// object on the message.
#[tokio::test]
async fn attach_results_round_trip_is_idempotent() {
    let db = ChatStore::open_in_memory().await.unwrap();
    let session = session_log::create_session(db.pool(), "local", None)
        .await
        .unwrap();

    let message = message_log::append_message(
        db.pool(),
        session.id,
        NewMessage::system("Query returned 2 rows.").with_sql("SELECT * FROM users"),
    )
    .await
    .unwrap();

    let results = sample_results();
    message_log::attach_results(db.pool(), message.id, &results)
        .await
        .unwrap();
    message_log::attach_results(db.pool(), message.id, &results)
        .await
        .unwrap();

    let messages = message_log::list_messages(db.pool(), session.id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);

    let attached = messages[0].results.as_ref().unwrap();
    assert_eq!(attached, &results);
}

// Read-after-write: results attached after the message was created show up
// on the next list.
#[tokio::test]
async fn list_reflects_late_attached_results() {
    let db = ChatStore::open_in_memory().await.unwrap();
    let session = session_log::create_session(db.pool(), "local", None)
        .await
        .unwrap();

    let message = message_log::append_message(
        db.pool(),
        session.id,
        NewMessage::system("Query returned 2 rows.").with_sql("SELECT 1"),
    )
    .await
    .unwrap();

    let before = message_log::list_messages(db.pool(), session.id)
        .await
        .unwrap();
    assert!(before[0].results.is_none());

    message_log::attach_results(db.pool(), message.id, &sample_results())
        .await
        .unwrap();

    let after = message_log::list_messages(db.pool(), session.id)
        .await
        .unwrap();
    assert!(after[0].results.is_some());
}

#[tokio::test]
async fn messages_keep_insertion_order() {
    let db = ChatStore::open_in_memory().await.unwrap();
    let session = session_log::create_session(db.pool(), "local", None)
        .await
        .unwrap();

    for i in 0..10 {
        message_log::append_message(db.pool(), session.id, NewMessage::user(format!("m{i}")))
            .await
            .unwrap();
    }

    let messages = message_log::list_messages(db.pool(), session.id)
        .await
        .unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    assert_eq!(contents, expected.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn session_delete_cascades_to_messages_and_results() {
    let db = ChatStore::open_in_memory().await.unwrap();
    let session = session_log::create_session(db.pool(), "local", None)
        .await
        .unwrap();
    let keeper = session_log::create_session(db.pool(), "local", None)
        .await
        .unwrap();

    let message = message_log::append_message(
        db.pool(),
        session.id,
        NewMessage::system("Query returned 2 rows.").with_sql("SELECT 1"),
    )
    .await
    .unwrap();
    message_log::attach_results(db.pool(), message.id, &sample_results())
        .await
        .unwrap();

    let kept = message_log::append_message(db.pool(), keeper.id, NewMessage::user("keep me"))
        .await
        .unwrap();

    session_log::delete_session(db.pool(), session.id)
        .await
        .unwrap();

    assert_eq!(
        message_log::count_messages(db.pool(), session.id)
            .await
            .unwrap(),
        0
    );
    // The other session's data is untouched.
    assert!(message_log::get_message(db.pool(), kept.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn appending_bumps_session_updated_at() {
    let db = ChatStore::open_in_memory().await.unwrap();
    let first = session_log::create_session(db.pool(), "local", Some("first"))
        .await
        .unwrap();
    let second = session_log::create_session(db.pool(), "local", Some("second"))
        .await
        .unwrap();

    // Timestamps have second granularity; step past it before touching the
    // older session.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    message_log::append_message(db.pool(), first.id, NewMessage::user("ping"))
        .await
        .unwrap();

    let sessions = session_log::list_sessions(db.pool(), "local").await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, first.id);
    assert_eq!(sessions[1].id, second.id);
}

#[tokio::test]
async fn roles_round_trip_through_storage() {
    let db = ChatStore::open_in_memory().await.unwrap();
    let session = session_log::create_session(db.pool(), "local", None)
        .await
        .unwrap();

    message_log::append_message(db.pool(), session.id, NewMessage::user("u"))
        .await
        .unwrap();
    message_log::append_message(
        db.pool(),
        session.id,
        NewMessage::assistant("a").with_sql("SELECT 1"),
    )
    .await
    .unwrap();
    message_log::append_message(db.pool(), session.id, NewMessage::system("s"))
        .await
        .unwrap();

    let messages = message_log::list_messages(db.pool(), session.id)
        .await
        .unwrap();
    let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![MessageRole::User, MessageRole::Assistant, MessageRole::System]
    );
}
