//! In-memory store — fast, volatile, for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::Utc;
use localapi_core::error::StoreError;
use localapi_core::message::{Message, Role, ThreadId};
use localapi_core::provider::Usage;
use localapi_core::response::{ResponseDetail, ResponseRecord, ResponseStatus};
use localapi_core::store::{MessageWindow, Store};
use localapi_core::thread::{ProfileFact, Summary, Thread};
use localapi_core::token::estimate_message_tokens;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    threads: HashMap<String, Thread>,
    /// Per-thread history, kept in `seq` order
    messages: HashMap<String, Vec<Message>>,
    responses: HashMap<String, ResponseRecord>,
    summaries: HashMap<String, Summary>,
    profiles: BTreeMap<String, ProfileFact>,
}

impl Inner {
    fn push_message(&mut self, thread_id: &ThreadId, role: Role, content: &str) -> Result<Message, StoreError> {
        if !self.threads.contains_key(thread_id.as_str()) {
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        }

        let history = self.messages.entry(thread_id.0.clone()).or_default();
        let seq = history.last().map(|m| m.seq).unwrap_or(0) + 1;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.clone(),
            seq,
            role,
            content: content.to_string(),
            token_count: estimate_message_tokens(content),
            created_at: Utc::now(),
        };
        history.push(message.clone());
        Ok(message)
    }

    fn message_by_id(&self, thread_id: &ThreadId, id: &str) -> Option<&Message> {
        self.messages
            .get(thread_id.as_str())
            .and_then(|history| history.iter().find(|m| m.id == id))
    }

    fn transition(&mut self, response_id: &str, next: ResponseStatus) -> Result<&mut ResponseRecord, StoreError> {
        let record = self
            .responses
            .get_mut(response_id)
            .ok_or_else(|| StoreError::NotFound(format!("response {response_id}")))?;

        if !record.status.can_transition_to(next) {
            return Err(StoreError::InvalidState(format!(
                "response {response_id} is {}, cannot become {next}",
                record.status
            )));
        }
        Ok(record)
    }
}

/// A volatile store backed by a `tokio::sync::RwLock`.
///
/// Every trait method takes the lock once, so multi-row writes are atomic
/// with respect to other callers.
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_thread(&self) -> Result<Thread, StoreError> {
        let thread = Thread {
            id: ThreadId::new(),
            created_at: Utc::now(),
        };
        let mut inner = self.inner.write().await;
        inner.threads.insert(thread.id.0.clone(), thread.clone());
        Ok(thread)
    }

    async fn ensure_thread(&self, thread_id: &ThreadId) -> Result<Thread, StoreError> {
        let mut inner = self.inner.write().await;
        let thread = inner
            .threads
            .entry(thread_id.0.clone())
            .or_insert_with(|| Thread {
                id: thread_id.clone(),
                created_at: Utc::now(),
            });
        Ok(thread.clone())
    }

    async fn thread_exists(&self, thread_id: &ThreadId) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.threads.contains_key(thread_id.as_str()))
    }

    async fn thread_for_response(&self, response_id: &str) -> Result<Option<ThreadId>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.responses.get(response_id).map(|r| r.thread_id.clone()))
    }

    async fn append_message(&self, thread_id: &ThreadId, role: Role, content: &str) -> Result<Message, StoreError> {
        self.inner.write().await.push_message(thread_id, role, content)
    }

    async fn list_recent_messages(&self, thread_id: &ThreadId, window: MessageWindow) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let Some(history) = inner.messages.get(thread_id.as_str()) else {
            return Ok(Vec::new());
        };

        let mut recent: Vec<Message> = history
            .iter()
            .rev()
            .filter(|m| window.contains(m.seq))
            .take(window.limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn count_messages(&self, thread_id: &ThreadId) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.messages.get(thread_id.as_str()).map_or(0, Vec::len))
    }

    async fn get_summary(&self, thread_id: &ThreadId) -> Result<Option<Summary>, StoreError> {
        Ok(self.inner.read().await.summaries.get(thread_id.as_str()).cloned())
    }

    async fn upsert_summary(&self, thread_id: &ThreadId, content: &str, folded_through: i64) -> Result<Summary, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.threads.contains_key(thread_id.as_str()) {
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        }

        let summary = Summary {
            thread_id: thread_id.clone(),
            content: content.to_string(),
            folded_through,
            created_at: Utc::now(),
        };
        inner.summaries.insert(thread_id.0.clone(), summary.clone());
        Ok(summary)
    }

    async fn upsert_profile_fact(&self, key: &str, value: serde_json::Value) -> Result<ProfileFact, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let fact = inner
            .profiles
            .entry(key.to_string())
            .and_modify(|fact| {
                fact.value = value.clone();
                fact.created_at = now;
            })
            .or_insert_with(|| ProfileFact {
                id: Uuid::new_v4().to_string(),
                key: key.to_string(),
                value: value.clone(),
                created_at: now,
            });
        Ok(fact.clone())
    }

    async fn list_profile_facts(&self) -> Result<Vec<ProfileFact>, StoreError> {
        Ok(self.inner.read().await.profiles.values().cloned().collect())
    }

    async fn begin_turn(&self, thread_id: &ThreadId, user_text: &str) -> Result<(Message, ResponseRecord), StoreError> {
        let mut inner = self.inner.write().await;
        let message = inner.push_message(thread_id, Role::User, user_text)?;

        let record = ResponseRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.clone(),
            request_message_id: Some(message.id.clone()),
            response_message_id: None,
            status: ResponseStatus::InProgress,
            usage: Usage::default(),
            error: None,
            created_at: Utc::now(),
        };
        inner.responses.insert(record.id.clone(), record.clone());
        Ok((message, record))
    }

    async fn complete_turn(&self, response_id: &str, assistant_text: &str, usage: &Usage) -> Result<Message, StoreError> {
        let mut inner = self.inner.write().await;
        let thread_id = inner
            .transition(response_id, ResponseStatus::Completed)?
            .thread_id
            .clone();

        let message = inner.push_message(&thread_id, Role::Assistant, assistant_text)?;

        let record = inner.transition(response_id, ResponseStatus::Completed)?;
        record.status = ResponseStatus::Completed;
        record.response_message_id = Some(message.id.clone());
        record.usage = *usage;
        record.error = None;
        Ok(message)
    }

    async fn update_response_status(
        &self,
        response_id: &str,
        status: ResponseStatus,
        usage: Option<&Usage>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.transition(response_id, status)?;
        record.status = status;
        if let Some(usage) = usage {
            record.usage = *usage;
        }
        record.error = error.map(str::to_string);
        Ok(())
    }

    async fn get_response(&self, response_id: &str) -> Result<Option<ResponseRecord>, StoreError> {
        Ok(self.inner.read().await.responses.get(response_id).cloned())
    }

    async fn get_response_detail(&self, response_id: &str) -> Result<Option<ResponseDetail>, StoreError> {
        let inner = self.inner.read().await;
        let Some(record) = inner.responses.get(response_id) else {
            return Ok(None);
        };

        let output_text = record
            .response_message_id
            .as_deref()
            .and_then(|id| inner.message_by_id(&record.thread_id, id))
            .map(|m| m.content.clone())
            .unwrap_or_default();

        Ok(Some(ResponseDetail {
            response_id: record.id.clone(),
            thread_id: record.thread_id.clone(),
            status: record.status,
            output_text,
            usage: record.usage,
            error: record.error.clone(),
        }))
    }
}
