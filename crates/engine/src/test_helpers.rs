//! Shared test helpers for engine tests.

use async_trait::async_trait;
use localapi_core::error::ProviderError;
use localapi_core::message::{Message, Role, ThreadId};
use localapi_core::provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use localapi_core::store::Store;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the next `complete` (fold) call does.
#[derive(Debug, Clone)]
pub enum FoldScript {
    /// Reply with this digest
    Reply(String),
    /// Reply with the request body minus its headings, which keeps every fact
    Echo,
    /// Fail with a backend error
    Fail,
}

/// What the next `stream` call does.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Emit these deltas, then finish with the usage
    Chunks(Vec<String>, Usage),
    /// Refuse the connection
    Refuse(ProviderError),
    /// Emit these deltas, then fail in-band
    BreakAfter(Vec<String>, ProviderError),
}

/// A provider that plays back scripted folds and streams, recording every request.
pub struct ScriptedProvider {
    folds: Mutex<VecDeque<FoldScript>>,
    fold_fallback: FoldScript,
    streams: Mutex<VecDeque<StreamScript>>,
    fold_requests: Mutex<Vec<ProviderRequest>>,
    stream_requests: Mutex<Vec<ProviderRequest>>,
    stream_delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            folds: Mutex::new(VecDeque::new()),
            fold_fallback: FoldScript::Fail,
            streams: Mutex::new(VecDeque::new()),
            fold_requests: Mutex::new(Vec::new()),
            stream_requests: Mutex::new(Vec::new()),
            stream_delay: Duration::ZERO,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_folds(self, folds: Vec<FoldScript>) -> Self {
        *self.folds.lock().unwrap() = folds.into();
        self
    }

    /// Behaviour once the fold queue is empty (default: fail).
    pub fn with_fold_fallback(mut self, fallback: FoldScript) -> Self {
        self.fold_fallback = fallback;
        self
    }

    pub fn with_streams(self, streams: Vec<StreamScript>) -> Self {
        *self.streams.lock().unwrap() = streams.into();
        self
    }

    /// Hold every stream open this long before the first delta.
    pub fn with_stream_delay(mut self, delay: Duration) -> Self {
        self.stream_delay = delay;
        self
    }

    pub fn fold_requests(&self) -> Vec<ProviderRequest> {
        self.fold_requests.lock().unwrap().clone()
    }

    pub fn stream_requests(&self) -> Vec<ProviderRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    /// Highest number of streams that were open at the same time.
    pub fn max_concurrent_streams(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        self.fold_requests.lock().unwrap().push(request);

        let script = self
            .folds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fold_fallback.clone());

        let content = match script {
            FoldScript::Reply(text) => text,
            FoldScript::Echo => body
                .lines()
                .filter(|l| !l.is_empty() && !l.ends_with(':') && *l != "(none)")
                .collect::<Vec<_>>()
                .join(" | "),
            FoldScript::Fail => {
                return Err(ProviderError::ApiError {
                    status_code: 503,
                    message: "summarizer offline".into(),
                });
            }
        };

        Ok(ProviderResponse::text(content, Some(Usage::new(10, 5)), "mock-model"))
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.stream_requests.lock().unwrap().push(request);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StreamScript::Chunks(vec!["ok".into()], Usage::new(1, 1)));

        let (deltas, ending) = match script {
            StreamScript::Refuse(err) => return Err(err),
            StreamScript::Chunks(deltas, usage) => (deltas, Ok(usage)),
            StreamScript::BreakAfter(deltas, err) => (deltas, Err(err)),
        };

        let active = self.active.clone();
        let max_active = self.max_active.clone();
        let delay = self.stream_delay;
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for delta in deltas {
                let chunk = StreamChunk {
                    content: Some(delta),
                    ..Default::default()
                };
                let _ = tx.send(Ok(chunk)).await;
            }
            let last = ending.map(|usage| StreamChunk {
                content: None,
                done: true,
                usage: Some(usage),
            });
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }
}

/// Append alternating user/assistant messages to a thread.
pub async fn seed_messages(store: &Arc<dyn Store>, thread_id: &ThreadId, texts: &[&str]) -> Vec<Message> {
    let mut out = Vec::with_capacity(texts.len());
    for (i, text) in texts.iter().enumerate() {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        out.push(store.append_message(thread_id, role, text).await.unwrap());
    }
    out
}

/// A string whose estimate is exactly `tokens` (4 chars per token).
pub fn text_of_tokens(tokens: usize) -> String {
    "abcd".repeat(tokens)
}
