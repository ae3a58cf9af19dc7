//! Behaviour every `Store` backend must share.
//!
//! Each check runs against both the SQLite and the in-memory backend.

use localapi_core::error::StoreError;
use localapi_core::message::{Role, ThreadId};
use localapi_core::provider::Usage;
use localapi_core::response::ResponseStatus;
use localapi_core::store::{MessageWindow, Store};
use localapi_store::{InMemoryStore, SqliteStore};
use serde_json::json;

async fn backends() -> Vec<Box<dyn Store>> {
    vec![
        Box::new(InMemoryStore::new()),
        Box::new(SqliteStore::new("sqlite::memory:").await.unwrap()),
    ]
}

#[tokio::test]
async fn recent_window_is_chronological_and_bounded() {
    for store in backends().await {
        let thread = store.create_thread().await.unwrap();
        for i in 1..=6 {
            let role = if i % 2 == 1 { Role::User } else { Role::Assistant };
            store.append_message(&thread.id, role, &format!("m{i}")).await.unwrap();
        }

        let recent = store
            .list_recent_messages(&thread.id, MessageWindow::latest(3))
            .await
            .unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["m4", "m5", "m6"], "backend {}", store.name());

        let bounded = store
            .list_recent_messages(&thread.id, MessageWindow::latest(10).after(2).before(6))
            .await
            .unwrap();
        let seqs: Vec<_> = bounded.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, [3, 4, 5], "backend {}", store.name());
        assert_eq!(store.count_messages(&thread.id).await.unwrap(), 6);
    }
}

#[tokio::test]
async fn unknown_thread_reads_empty() {
    for store in backends().await {
        let ghost = ThreadId::from("nope");
        assert!(!store.thread_exists(&ghost).await.unwrap());
        assert!(store
            .list_recent_messages(&ghost, MessageWindow::latest(5))
            .await
            .unwrap()
            .is_empty());
        assert!(store.get_summary(&ghost).await.unwrap().is_none());
        assert_eq!(store.count_messages(&ghost).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn ensure_thread_is_idempotent() {
    for store in backends().await {
        let id = ThreadId::from("client-chosen");
        let first = store.ensure_thread(&id).await.unwrap();
        let second = store.ensure_thread(&id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at, "backend {}", store.name());
        assert!(store.thread_exists(&id).await.unwrap());
    }
}

#[tokio::test]
async fn summary_upsert_replaces_single_row() {
    for store in backends().await {
        let thread = store.create_thread().await.unwrap();
        store.upsert_summary(&thread.id, "first digest", 4).await.unwrap();
        store.upsert_summary(&thread.id, "second digest", 9).await.unwrap();

        let summary = store.get_summary(&thread.id).await.unwrap().unwrap();
        assert_eq!(summary.content, "second digest");
        assert_eq!(summary.folded_through, 9);
    }
}

#[tokio::test]
async fn profile_facts_overwrite_by_key() {
    for store in backends().await {
        store.upsert_profile_fact("name", json!("Ada")).await.unwrap();
        store.upsert_profile_fact("location", json!("London")).await.unwrap();
        let renamed = store.upsert_profile_fact("name", json!("Grace")).await.unwrap();
        assert_eq!(renamed.value, json!("Grace"));

        let facts = store.list_profile_facts().await.unwrap();
        let pairs: Vec<_> = facts.iter().map(|f| (f.key.as_str(), f.display_value())).collect();
        assert_eq!(
            pairs,
            [("location", "London".to_string()), ("name", "Grace".to_string())],
            "backend {}",
            store.name()
        );
    }
}

#[tokio::test]
async fn completed_turn_links_both_messages() {
    for store in backends().await {
        let thread = store.create_thread().await.unwrap();
        let (user, record) = store.begin_turn(&thread.id, "Hello!").await.unwrap();
        assert_eq!(record.status, ResponseStatus::InProgress);
        assert_eq!(record.request_message_id.as_deref(), Some(user.id.as_str()));

        let assistant = store
            .complete_turn(&record.id, "Hi there!", &Usage::new(10, 3))
            .await
            .unwrap();
        assert_eq!(assistant.seq, user.seq + 1);
        assert_eq!(assistant.role, Role::Assistant);

        let stored = store.get_response(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ResponseStatus::Completed);
        assert_eq!(stored.response_message_id.as_deref(), Some(assistant.id.as_str()));
        assert_eq!(stored.usage.total_tokens, 13);

        let detail = store.get_response_detail(&record.id).await.unwrap().unwrap();
        assert_eq!(detail.output_text, "Hi there!");
        assert_eq!(detail.thread_id, thread.id);

        assert_eq!(
            store.thread_for_response(&record.id).await.unwrap(),
            Some(thread.id.clone())
        );
    }
}

#[tokio::test]
async fn failed_turn_keeps_user_message_only() {
    for store in backends().await {
        let thread = store.create_thread().await.unwrap();
        let (_, record) = store.begin_turn(&thread.id, "Hello?").await.unwrap();
        store.fail_turn(&record.id, "backend unavailable").await.unwrap();

        let detail = store.get_response_detail(&record.id).await.unwrap().unwrap();
        assert_eq!(detail.status, ResponseStatus::Failed);
        assert_eq!(detail.output_text, "");
        assert_eq!(detail.error.as_deref(), Some("backend unavailable"));

        let history = store
            .list_recent_messages(&thread.id, MessageWindow::latest(10))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }
}

#[tokio::test]
async fn terminal_responses_reject_transitions() {
    for store in backends().await {
        let thread = store.create_thread().await.unwrap();
        let (_, record) = store.begin_turn(&thread.id, "Hello").await.unwrap();
        store
            .complete_turn(&record.id, "Hi", &Usage::default())
            .await
            .unwrap();

        let err = store.fail_turn(&record.id, "too late").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)), "backend {}", store.name());

        let err = store
            .complete_turn(&record.id, "again", &Usage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        assert_eq!(store.count_messages(&thread.id).await.unwrap(), 2);

        let err = store.fail_turn("missing", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "backend {}", store.name());
    }
}

#[tokio::test]
async fn unknown_response_reads_none() {
    for store in backends().await {
        assert!(store.get_response("missing").await.unwrap().is_none());
        assert!(store.get_response_detail("missing").await.unwrap().is_none());
        assert!(store.thread_for_response("missing").await.unwrap().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_turns_on_a_file_database_all_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let store = std::sync::Arc::new(SqliteStore::new(path.to_str().unwrap()).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..48 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let thread = store.create_thread().await?;
            let (_, record) = store.begin_turn(&thread.id, &format!("question {i}")).await?;
            store.complete_turn(&record.id, "answer", &Usage::new(3, 1)).await?;
            Ok::<_, StoreError>((thread.id, record.id))
        }));
    }

    for task in tasks {
        let (thread_id, response_id) = task.await.unwrap().unwrap();
        assert_eq!(store.count_messages(&thread_id).await.unwrap(), 2);
        let record = store.get_response(&response_id).await.unwrap().unwrap();
        assert_eq!(record.status, ResponseStatus::Completed);
    }
    store.close().await;
}
