//! Store trait — the persistence contract the turn engine runs against.
//!
//! The store owns threads, messages, responses, summaries and profile facts.
//! Multi-row writes that belong to one turn (`begin_turn`, `complete_turn`)
//! must be atomic so a failed write never leaves a message without its
//! response record or the other way round.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::{Message, Role, ThreadId};
use crate::provider::Usage;
use crate::response::{ResponseDetail, ResponseRecord, ResponseStatus};
use crate::thread::{ProfileFact, Summary, Thread};

/// Which slice of a thread's history to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageWindow {
    /// Maximum number of messages, newest first before re-ordering
    pub limit: usize,

    /// Only messages with `seq > after_seq`
    pub after_seq: Option<i64>,

    /// Only messages with `seq < before_seq`
    pub before_seq: Option<i64>,
}

impl MessageWindow {
    /// The newest `limit` messages of the thread.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            after_seq: None,
            before_seq: None,
        }
    }

    pub fn after(mut self, seq: i64) -> Self {
        self.after_seq = Some(seq);
        self
    }

    pub fn before(mut self, seq: i64) -> Self {
        self.before_seq = Some(seq);
        self
    }

    /// Whether `seq` falls inside the bounds (the limit is not considered).
    pub fn contains(&self, seq: i64) -> bool {
        self.after_seq.is_none_or(|after| seq > after) && self.before_seq.is_none_or(|before| seq < before)
    }
}

/// Persistence backend for threads and their turns.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Create a thread with a fresh id.
    async fn create_thread(&self) -> Result<Thread, StoreError>;

    /// Return the thread, creating it under the given id if it does not exist.
    async fn ensure_thread(&self, thread_id: &ThreadId) -> Result<Thread, StoreError>;

    /// Whether a thread with this id exists.
    async fn thread_exists(&self, thread_id: &ThreadId) -> Result<bool, StoreError>;

    /// The thread a stored response belongs to.
    async fn thread_for_response(&self, response_id: &str) -> Result<Option<ThreadId>, StoreError>;

    /// Append a message to an existing thread.
    async fn append_message(&self, thread_id: &ThreadId, role: Role, content: &str) -> Result<Message, StoreError>;

    /// Read a window of history in chronological order.
    async fn list_recent_messages(&self, thread_id: &ThreadId, window: MessageWindow) -> Result<Vec<Message>, StoreError>;

    /// Total stored messages for a thread.
    async fn count_messages(&self, thread_id: &ThreadId) -> Result<usize, StoreError>;

    async fn get_summary(&self, thread_id: &ThreadId) -> Result<Option<Summary>, StoreError>;

    /// Replace the thread's summary in a single row write.
    async fn upsert_summary(&self, thread_id: &ThreadId, content: &str, folded_through: i64) -> Result<Summary, StoreError>;

    /// Insert or overwrite the fact stored under `key`.
    async fn upsert_profile_fact(&self, key: &str, value: serde_json::Value) -> Result<ProfileFact, StoreError>;

    /// All profile facts, ordered by key.
    async fn list_profile_facts(&self) -> Result<Vec<ProfileFact>, StoreError>;

    /// Persist the user message and an `in_progress` response in one unit.
    async fn begin_turn(&self, thread_id: &ThreadId, user_text: &str) -> Result<(Message, ResponseRecord), StoreError>;

    /// Persist the assistant message and mark the response `completed` in one unit.
    async fn complete_turn(&self, response_id: &str, assistant_text: &str, usage: &Usage) -> Result<Message, StoreError>;

    /// Mark the response `failed` with the captured error text.
    async fn fail_turn(&self, response_id: &str, error: &str) -> Result<(), StoreError> {
        self.update_response_status(response_id, ResponseStatus::Failed, None, Some(error))
            .await
    }

    /// Move a response to a new status; terminal rows reject the update.
    async fn update_response_status(
        &self,
        response_id: &str,
        status: ResponseStatus,
        usage: Option<&Usage>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_response(&self, response_id: &str) -> Result<Option<ResponseRecord>, StoreError>;

    /// The response joined with its assistant output text.
    async fn get_response_detail(&self, response_id: &str) -> Result<Option<ResponseDetail>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds_are_exclusive() {
        let window = MessageWindow::latest(10).after(2).before(5);
        assert!(!window.contains(2));
        assert!(window.contains(3));
        assert!(window.contains(4));
        assert!(!window.contains(5));
        assert!(MessageWindow::latest(1).contains(i64::MAX));
    }
}
