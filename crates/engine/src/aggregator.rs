//! Streaming response aggregation.
//!
//! Drives one streaming backend call and fans each fragment out to an
//! optional live listener and to an in-memory accumulator. The listener can
//! go away at any time; the backend stream is still drained to the end so
//! the turn completes and is persisted.

use localapi_core::error::Error;
use localapi_core::event::StreamEvent;
use localapi_core::message::ThreadId;
use localapi_core::provider::{Provider, ProviderRequest, Usage};
use localapi_core::token::{estimate_messages_tokens, estimate_tokens};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ── Turn state ────────────────────────────────────────────────────────────

/// Lifecycle of a streamed turn.
///
/// `Pending → Streaming → {Completed | Failed}`, or `Pending → Failed` when
/// the backend refuses the call. Terminal states have no way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Failed)
    }

    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Pending, Streaming) | (Pending, Failed) | (Streaming, Completed) | (Streaming, Failed)
        )
    }

    /// Move to `next`, or report the illegal transition.
    pub fn transition(self, next: TurnState) -> Result<TurnState, Error> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::Internal(format!("illegal turn transition {self:?} -> {next:?}")))
        }
    }
}

// ── Listener ──────────────────────────────────────────────────────────────

/// Best-effort delivery of [`StreamEvent`]s to a live listener.
///
/// The first failed send detaches the listener for good; nothing is ever
/// propagated back to the producer.
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<StreamEvent>>) -> Self {
        Self { tx }
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn is_attached(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn emit(&mut self, event: StreamEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).await.is_err() {
            debug!("Listener disconnected; continuing without it");
            self.tx = None;
        }
    }
}

// ── Aggregator ────────────────────────────────────────────────────────────

/// Result of one streamed turn.
#[derive(Debug)]
pub struct AggregatedTurn {
    pub state: TurnState,

    /// Full text on success; empty on failure (partial text is discarded)
    pub output_text: String,

    pub usage: Usage,

    /// Why the turn failed
    pub error: Option<Error>,
}

pub struct StreamAggregator {
    provider: Arc<dyn Provider>,
}

impl StreamAggregator {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Run `request` as a stream, emitting `start`, `delta`* and then `end`
    /// or `error` to `sink`.
    pub async fn run(
        &self,
        mut request: ProviderRequest,
        response_id: &str,
        thread_id: &ThreadId,
        sink: &mut EventSink,
    ) -> AggregatedTurn {
        request.stream = true;
        let prompt_estimate = estimate_messages_tokens(&request.messages);
        let state = TurnState::Pending;

        let mut rx = match self.provider.stream(request).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(response_id, "Backend refused stream: {e}");
                return Self::fail(state, Error::from(e), response_id, sink).await;
            }
        };

        let state = match state.transition(TurnState::Streaming) {
            Ok(s) => s,
            Err(e) => return Self::fail(state, e, response_id, sink).await,
        };
        sink.emit(StreamEvent::Start {
            response_id: response_id.to_string(),
            thread_id: thread_id.clone(),
        })
        .await;

        let mut text = String::new();
        let mut usage: Option<Usage> = None;
        let mut finished = false;
        let mut failure: Option<Error> = None;

        // Drain everything, even after the listener is gone
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                        text.push_str(&delta);
                        sink.emit(StreamEvent::Delta { text: delta }).await;
                    }
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    if chunk.done {
                        finished = true;
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(Error::from(e));
                    break;
                }
            }
        }

        let failure = failure.or_else(|| {
            (!finished).then(|| Error::BackendStreamError("stream closed before completion".into()))
        });
        if let Some(err) = failure {
            warn!(response_id, partial_chars = text.len(), "Stream failed: {err}");
            return Self::fail(state, err, response_id, sink).await;
        }

        let usage = usage.unwrap_or_else(|| {
            let prompt = u32::try_from(prompt_estimate).unwrap_or(u32::MAX);
            let completion = u32::try_from(estimate_tokens(&text)).unwrap_or(u32::MAX);
            Usage::new(prompt, completion)
        });

        let state = match state.transition(TurnState::Completed) {
            Ok(s) => s,
            Err(e) => return Self::fail(state, e, response_id, sink).await,
        };
        sink.emit(StreamEvent::End {
            text: text.clone(),
            usage,
        })
        .await;

        debug!(response_id, chars = text.len(), "Stream completed");
        AggregatedTurn {
            state,
            output_text: text,
            usage,
            error: None,
        }
    }

    async fn fail(state: TurnState, error: Error, response_id: &str, sink: &mut EventSink) -> AggregatedTurn {
        let state = state.transition(TurnState::Failed).unwrap_or(TurnState::Failed);
        sink.emit(StreamEvent::Error {
            message: error.to_string(),
            trace_id: Some(response_id.to_string()),
        })
        .await;
        AggregatedTurn {
            state,
            output_text: String::new(),
            usage: Usage::default(),
            error: Some(error),
        }
    }
}
