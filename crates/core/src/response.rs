//! Response records — one per orchestrated turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ThreadId;
use crate::provider::Usage;

/// Persisted status of a turn.
///
/// `InProgress` may move to `Completed` or `Failed`; terminal states are
/// never re-opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    Failed,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::InProgress => "in_progress",
            ResponseStatus::Completed => "completed",
            ResponseStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseStatus::InProgress)
    }

    /// Whether a stored row in `self` may be moved to `next`.
    pub fn can_transition_to(&self, next: ResponseStatus) -> bool {
        matches!(
            (self, next),
            (ResponseStatus::InProgress, ResponseStatus::Completed)
                | (ResponseStatus::InProgress, ResponseStatus::Failed)
        )
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResponseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(ResponseStatus::InProgress),
            "completed" => Ok(ResponseStatus::Completed),
            "failed" => Ok(ResponseStatus::Failed),
            other => Err(format!("unknown response status '{other}'")),
        }
    }
}

/// A stored response row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: String,
    pub thread_id: ThreadId,

    /// The user message that started the turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_message_id: Option<String>,

    /// The assistant message produced by the turn (completed turns only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message_id: Option<String>,

    pub status: ResponseStatus,
    pub usage: Usage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// A response joined with its output text, as served to API readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDetail {
    pub response_id: String,
    pub thread_id: ThreadId,
    pub status: ResponseStatus,

    /// Assistant text; empty unless the turn completed
    pub output_text: String,
    pub usage: Usage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
