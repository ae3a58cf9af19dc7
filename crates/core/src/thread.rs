//! Thread, summary and profile records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ThreadId;

/// A single ongoing conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub created_at: DateTime<Utc>,
}

/// The running digest of a thread's folded history. At most one per thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub thread_id: ThreadId,

    /// Digest text; each fold overwrites it with a merge of old and new.
    pub content: String,

    /// `seq` of the newest message absorbed into this summary.
    pub folded_through: i64,

    /// When the last fold happened
    pub created_at: DateTime<Utc>,
}

/// A durable fact about the user, keyed and overwritten on reassertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFact {
    pub id: String,

    /// Slowly-changing key such as `name` or `location`
    pub key: String,

    /// Structured value; plain facts are JSON strings
    pub value: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl ProfileFact {
    /// Render the value for prompt text without JSON quoting for strings.
    pub fn display_value(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_facts_render_unquoted() {
        let fact = ProfileFact {
            id: "p1".into(),
            key: "name".into(),
            value: serde_json::json!("Alice"),
            created_at: Utc::now(),
        };
        assert_eq!(fact.display_value(), "Alice");

        let fact = ProfileFact {
            value: serde_json::json!({"units": "metric"}),
            ..fact
        };
        assert_eq!(fact.display_value(), r#"{"units":"metric"}"#);
    }
}
