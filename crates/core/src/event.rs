//! Turn-level streaming events.
//!
//! `StreamEvent` is the live feed a listener receives while a turn streams.
//! The gateway forwards these verbatim as WebSocket text frames:
//! - `start` — the backend accepted the call
//! - `delta` — an incremental text fragment
//! - `end`   — full assembled text plus usage
//! - `error` — terminal failure; earlier deltas are not retracted

use serde::{Deserialize, Serialize};

use crate::message::ThreadId;
use crate::provider::Usage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start { response_id: String, thread_id: ThreadId },

    Delta { text: String },

    End { text: String, usage: Usage },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
    },
}

impl StreamEvent {
    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Delta { .. } => "delta",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
        }
    }

    /// `end` and `error` close the feed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}
