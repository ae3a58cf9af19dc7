//! Response orchestration — one call per user turn.
//!
//! A turn runs: resolve thread → take the thread lock → persist the user
//! message with an `in_progress` response → extract profile facts →
//! assemble context → optional tool round → stream → persist the outcome.
//!
//! Every turn runs on its own task, so a caller that stops waiting (a client
//! that disconnects, a timeout) never leaves the response `in_progress`.
//! Turns on the same thread are serialized by a per-thread async mutex;
//! turns on different threads run concurrently.

use crate::aggregator::{EventSink, StreamAggregator, TurnState};
use crate::context::{AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, SYSTEM_PROMPT};
use crate::folding::HistoryFolder;
use crate::profile::{ProfileExtractor, RegexProfileExtractor};
use crate::tools::default_tools;
use localapi_config::{AppConfig, LlmConfig};
use localapi_core::error::{Error, Result};
use localapi_core::event::StreamEvent;
use localapi_core::message::{ChatMessage, Message, Role, ThreadId};
use localapi_core::provider::{Provider, ProviderRequest, Usage};
use localapi_core::response::{ResponseDetail, ResponseStatus};
use localapi_core::store::Store;
use localapi_core::tool::ToolRegistry;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A request for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Continue (or start) this thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,

    /// Continue the thread this earlier response belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,

    /// Persist the turn (default `true`)
    #[serde(default = "default_store")]
    pub store: bool,

    pub input_text: String,
}

fn default_store() -> bool {
    true
}

impl TurnRequest {
    pub fn new(input_text: impl Into<String>) -> Self {
        Self {
            thread_id: None,
            previous_response_id: None,
            store: true,
            input_text: input_text.into(),
        }
    }

    pub fn on_thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn after_response(mut self, response_id: impl Into<String>) -> Self {
        self.previous_response_id = Some(response_id.into());
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.store = false;
        self
    }
}

/// What a finished turn looks like to the caller.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: ResponseDetail,

    /// Present whenever assembly ran
    pub context: Option<AssemblyMetadata>,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        self.response.status == ResponseStatus::Completed
    }
}

/// Registry of per-thread turn locks.
#[derive(Default)]
struct ThreadLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadLocks {
    fn handle(&self, thread_id: &ThreadId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Entries only the registry still references are idle
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(thread_id.0.clone()).or_default().clone()
    }
}

pub struct ResponseOrchestrator {
    runner: Arc<TurnRunner>,
}

/// Everything one turn needs; shared with the task each turn runs on.
struct TurnRunner {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    extractor: Arc<dyn ProfileExtractor>,
    assembler: ContextAssembler,
    aggregator: StreamAggregator,
    tools: ToolRegistry,
    url_pattern: Option<Regex>,
    llm: LlmConfig,
    locks: ThreadLocks,
}

impl ResponseOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn Store>, config: &AppConfig) -> Self {
        let folder = HistoryFolder::new(provider.clone(), store.clone(), config.llm.model.clone());
        let assembler = ContextAssembler::new(store.clone(), folder, config.context.clone(), SYSTEM_PROMPT);
        let runner = TurnRunner {
            store,
            provider: provider.clone(),
            extractor: Arc::new(RegexProfileExtractor::new()),
            assembler,
            aggregator: StreamAggregator::new(provider.clone()),
            tools: default_tools(provider, &config.llm.vision_model),
            url_pattern: Regex::new(r"https?://\S+")
                .inspect_err(|e| warn!("URL pattern rejected, tool round disabled: {e}"))
                .ok(),
            llm: config.llm.clone(),
            locks: ThreadLocks::default(),
        };
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Replace the default regex extractor.
    pub fn with_extractor(self, extractor: Arc<dyn ProfileExtractor>) -> Self {
        self.configure(|runner| runner.extractor = extractor)
    }

    /// Replace the tools offered in the tool round. An empty registry skips the round.
    pub fn with_tools(self, tools: ToolRegistry) -> Self {
        self.configure(|runner| runner.tools = tools)
    }

    /// Builders only apply before the first turn shares the runner.
    fn configure(mut self, apply: impl FnOnce(&mut TurnRunner)) -> Self {
        match Arc::get_mut(&mut self.runner) {
            Some(runner) => apply(runner),
            None => warn!("Orchestrator already serving turns; configuration change ignored"),
        }
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.runner.store
    }

    /// Whether the inference backend answers its health check.
    pub async fn backend_healthy(&self) -> bool {
        match self.runner.provider.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(provider = self.runner.provider.name(), "Health check failed: {e}");
                false
            }
        }
    }

    /// Run one turn, streaming events to `listener` when attached.
    ///
    /// The turn runs to completion on its own task even if this future is
    /// dropped; the listener is then simply detached.
    ///
    /// Returns `Err` only when the turn could not start (bad input, unknown
    /// `previous_response_id`, store failure before the response row exists).
    /// Backend failures come back as an outcome with status `failed`.
    pub async fn respond(
        &self,
        request: TurnRequest,
        listener: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<TurnOutcome> {
        let runner = self.runner.clone();
        tokio::spawn(async move { runner.run(request, listener).await })
            .await
            .map_err(|e| Error::Internal(format!("turn task ended abnormally: {e}")))?
    }
}

impl TurnRunner {
    async fn run(&self, request: TurnRequest, listener: Option<mpsc::Sender<StreamEvent>>) -> Result<TurnOutcome> {
        if request.input_text.trim().is_empty() {
            return Err(Error::InvalidInput("input_text must not be empty".into()));
        }

        let thread_id = self.resolve_thread(&request).await?;
        let lock = self.locks.handle(&thread_id);
        let _turn = lock.lock_owned().await;

        let mut sink = EventSink::new(listener);
        let persist = request.store;

        let (user_message, response_id) = if persist {
            let (message, record) = self.store.begin_turn(&thread_id, &request.input_text).await?;
            (message, record.id)
        } else {
            let message = Message::ephemeral(thread_id.clone(), i64::MAX, Role::User, request.input_text.as_str());
            (message, Uuid::new_v4().to_string())
        };

        info!(thread_id = %thread_id, response_id = %response_id, store = persist, "Turn started");

        let context = match self.prepare(&thread_id, &user_message, persist).await {
            Ok(context) => context,
            Err(e) => {
                error!(response_id = %response_id, "Turn preparation failed: {e}");
                sink.emit(StreamEvent::Error {
                    message: e.to_string(),
                    trace_id: Some(response_id.clone()),
                })
                .await;
                return Ok(self.failed(persist, response_id, thread_id, &e, None).await);
            }
        };

        let mut messages = context.messages;
        if self.wants_tool_round(&request.input_text) {
            let exchange = self.tool_round(&messages, &response_id).await;
            messages.extend(exchange);
        }

        let provider_request = self.chat_request(messages);

        let turn = self
            .aggregator
            .run(provider_request, &response_id, &thread_id, &mut sink)
            .await;
        let metadata = Some(context.metadata);

        if let Some(e) = turn.error {
            return Ok(self.failed(persist, response_id, thread_id, &e, metadata).await);
        }
        debug_assert_eq!(turn.state, TurnState::Completed);

        if persist
            && let Err(e) = self
                .store
                .complete_turn(&response_id, &turn.output_text, &turn.usage)
                .await
        {
            let e = Error::from(e);
            error!(response_id = %response_id, "Could not persist completed turn: {e}");
            return Ok(self.failed(persist, response_id, thread_id, &e, metadata).await);
        }

        info!(
            thread_id = %thread_id,
            response_id = %response_id,
            prompt_tokens = turn.usage.prompt_tokens,
            completion_tokens = turn.usage.completion_tokens,
            "Turn completed"
        );

        Ok(TurnOutcome {
            response: ResponseDetail {
                response_id,
                thread_id,
                status: ResponseStatus::Completed,
                output_text: turn.output_text,
                usage: turn.usage,
                error: None,
            },
            context: metadata,
        })
    }

    fn chat_request(&self, messages: Vec<ChatMessage>) -> ProviderRequest {
        let mut request = ProviderRequest::new(self.llm.model.clone(), messages);
        request.temperature = self.llm.temperature;
        request.max_tokens = Some(self.llm.max_tokens);
        request
    }

    /// Tools are offered only when the user text carries a link.
    fn wants_tool_round(&self, input: &str) -> bool {
        !self.tools.is_empty() && self.url_pattern.as_ref().is_some_and(|p| p.is_match(input))
    }

    /// One non-streamed call with the tools offered. At most one requested
    /// call is executed; its result is returned as the assistant/tool pair
    /// to append to the prompt. Backend errors skip the round.
    async fn tool_round(&self, prompt: &[ChatMessage], response_id: &str) -> Vec<ChatMessage> {
        let mut request = self.chat_request(prompt.to_vec());
        request.tools = self.tools.definitions();

        let response = match self.provider.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(response_id, "Tool round skipped: {e}");
                return Vec::new();
            }
        };

        let Some(call) = response.tool_calls.into_iter().next() else {
            debug!(response_id, "No tool requested");
            return Vec::new();
        };

        let result = match self.tools.execute(&call).await {
            Ok(result) => result,
            Err(e) => {
                warn!(response_id, tool = %call.name, "Tool call failed: {e}");
                serde_json::json!({ "error": e.to_string() })
            }
        };
        info!(response_id, tool = %call.name, "Tool call executed");

        let call_id = call.id.clone();
        vec![
            ChatMessage::assistant_tool_calls(response.content, vec![call]),
            ChatMessage::tool_result(call_id, result.to_string()),
        ]
    }

    /// Explicit thread id, then the thread of `previous_response_id`, then a new thread.
    async fn resolve_thread(&self, request: &TurnRequest) -> Result<ThreadId> {
        if let Some(thread_id) = request.thread_id.as_ref().filter(|t| !t.as_str().is_empty()) {
            self.store.ensure_thread(thread_id).await?;
            return Ok(thread_id.clone());
        }

        if let Some(previous) = request.previous_response_id.as_deref().filter(|p| !p.is_empty()) {
            return self
                .store
                .thread_for_response(previous)
                .await?
                .ok_or_else(|| Error::NotFound(format!("response {previous}")));
        }

        Ok(self.store.create_thread().await?.id)
    }

    /// Facts, then assembly. Facts are visible to this same turn.
    async fn prepare(&self, thread_id: &ThreadId, user: &Message, persist: bool) -> Result<AssembledContext> {
        let facts = self.extractor.extract(&user.content);
        let pending = if persist {
            for (key, value) in &facts {
                self.store
                    .upsert_profile_fact(key, serde_json::Value::String(value.clone()))
                    .await?;
                debug!(key = %key, "Profile fact stored");
            }
            BTreeMap::new()
        } else {
            facts
        };

        if persist {
            let stored = self.store.count_messages(thread_id).await?;
            let threshold = self.assembler.config().summarize_after_messages;
            if stored > threshold {
                info!(thread_id = %thread_id, stored, threshold, "Thread history past summarize_after_messages");
            }
        }

        self.assembler
            .assemble(AssemblyInput {
                thread_id,
                user_message: user,
                pending_facts: &pending,
            })
            .await
    }

    async fn failed(
        &self,
        persist: bool,
        response_id: String,
        thread_id: ThreadId,
        err: &Error,
        context: Option<AssemblyMetadata>,
    ) -> TurnOutcome {
        let message = err.to_string();
        if persist && let Err(e) = self.store.fail_turn(&response_id, &message).await {
            warn!(response_id = %response_id, "Could not mark response failed: {e}");
        }
        info!(thread_id = %thread_id, response_id = %response_id, "Turn failed: {message}");

        TurnOutcome {
            response: ResponseDetail {
                response_id,
                thread_id,
                status: ResponseStatus::Failed,
                output_text: String::new(),
                usage: Usage::default(),
                error: Some(message),
            },
            context,
        }
    }
}
