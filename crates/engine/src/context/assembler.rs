//! Context assembly under a token budget.
//!
//! Builds the prompt for one turn from four layers, in this order:
//!
//! 1. **System prompt**: fixed, always first
//! 2. **Profile line**: `User profile: k=v; ...` when any facts exist
//! 3. **Summary line**: `Thread summary: ...` when the thread has been folded
//! 4. **Recent window**: unfolded messages before the new user turn, then the
//!    user turn itself
//!
//! When the candidate exceeds `budget + hysteresis` the oldest part of the
//! window is folded into the summary. If that is not enough (or the fold
//! fails) the window decays geometrically until the prompt fits or only the
//! system lines and the user turn remain.
//!
//! # Determinism
//!
//! With no new messages, repeated assemblies produce the same prompt: folded
//! messages sit behind the summary's `folded_through` mark and a window no
//! larger than `fold_retain_messages` is never folded again.

use crate::folding::HistoryFolder;
use localapi_config::ContextConfig;
use localapi_core::error::{Error, Result};
use localapi_core::message::{ChatMessage, Message, ThreadId};
use localapi_core::store::{MessageWindow, Store};
use localapi_core::thread::{ProfileFact, Summary};
use localapi_core::token::estimate_messages_tokens;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

// ── Types ─────────────────────────────────────────────────────────────────

/// Inputs for assembling one turn's prompt.
pub struct AssemblyInput<'a> {
    pub thread_id: &'a ThreadId,

    /// The new user turn. Only history with a lower `seq` is considered.
    pub user_message: &'a Message,

    /// Facts from this turn that are not (or not yet) in the store.
    /// They override stored facts with the same key.
    pub pending_facts: &'a BTreeMap<String, String>,
}

/// The assembled prompt, ready for a backend call.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub metadata: AssemblyMetadata,
}

/// What happened while fitting the prompt to the budget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Estimated tokens of the final prompt.
    pub total_tokens: usize,
    /// `floor(window_tokens * prompt_budget_ratio)`.
    pub budget: usize,
    /// Tolerance above `budget` before the prompt counts as oversized.
    pub hysteresis: usize,
    /// Unfolded history messages loaded for this turn.
    pub window_messages: usize,
    /// History messages that made it into the prompt.
    pub retained_messages: usize,
    /// Messages absorbed into the summary during this assembly.
    pub folded_messages: usize,
    /// Messages dropped by decay truncation.
    pub truncated_messages: usize,
    /// A fold was attempted and failed.
    pub fold_failed: bool,
    /// Even the minimal prompt exceeds the budget.
    pub over_budget: bool,
    pub profile_included: bool,
    pub summary_included: bool,
}

/// Whether a prompt of `total` tokens is acceptable.
pub fn fits(total: usize, budget: usize, hysteresis: usize) -> bool {
    total <= budget + hysteresis
}

/// One decay step: `floor(retained * 0.7)`.
pub fn decay(retained: usize) -> usize {
    retained * 7 / 10
}

/// Render the profile line from stored facts and this turn's overrides.
pub fn profile_line(facts: &[ProfileFact], pending: &BTreeMap<String, String>) -> Option<String> {
    let mut merged: BTreeMap<&str, String> = facts
        .iter()
        .map(|f| (f.key.as_str(), f.display_value()))
        .collect();
    for (key, value) in pending {
        merged.insert(key.as_str(), value.clone());
    }

    if merged.is_empty() {
        return None;
    }

    let body = merged
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ");
    Some(format!("User profile: {body}"))
}

fn summary_line(summary: Option<&Summary>) -> Option<String> {
    summary
        .map(|s| s.content.trim())
        .filter(|s| !s.is_empty())
        .map(|s| format!("Thread summary: {s}"))
}

// ── Assembler ─────────────────────────────────────────────────────────────

pub struct ContextAssembler {
    store: Arc<dyn Store>,
    folder: HistoryFolder,
    config: ContextConfig,
    system_prompt: String,
}

/// Fixed lines placed before the history.
struct Preamble<'a> {
    system_prompt: &'a str,
    profile: Option<String>,
    summary: Option<String>,
}

impl Preamble<'_> {
    fn build(&self, window: &[Message], user: &Message) -> Vec<ChatMessage> {
        let mut prompt = Vec::with_capacity(window.len() + 4);
        prompt.push(ChatMessage::system(self.system_prompt));
        if let Some(profile) = &self.profile {
            prompt.push(ChatMessage::system(profile.clone()));
        }
        if let Some(summary) = &self.summary {
            prompt.push(ChatMessage::system(summary.clone()));
        }
        prompt.extend(window.iter().map(Message::to_chat));
        prompt.push(user.to_chat());
        prompt
    }
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn Store>,
        folder: HistoryFolder,
        config: ContextConfig,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            store,
            folder,
            config,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assemble the prompt for one turn.
    ///
    /// # Algorithm
    ///
    /// 1. Load summary, profile facts and the unfolded recent window
    /// 2. If the candidate fits `budget + hysteresis`, return it
    /// 3. Fold all but the newest `fold_retain_messages` into the summary
    /// 4. Decay the window (`floor(n * 0.7)`) until the prompt fits or is empty
    ///
    /// Fold failures are absorbed and reported in the metadata. Store
    /// failures are returned.
    pub async fn assemble(&self, input: AssemblyInput<'_>) -> Result<AssembledContext> {
        let budget = self.config.budget();
        let hysteresis = self.config.hysteresis_tokens;
        let thread_id = input.thread_id;
        let user = input.user_message;

        let mut summary = self.store.get_summary(thread_id).await?;
        let facts = self.store.list_profile_facts().await?;

        let mut bounds = MessageWindow::latest(self.config.max_context_messages).before(user.seq);
        if let Some(s) = &summary {
            bounds = bounds.after(s.folded_through);
        }
        let mut window = self.store.list_recent_messages(thread_id, bounds).await?;

        let mut preamble = Preamble {
            system_prompt: &self.system_prompt,
            profile: profile_line(&facts, input.pending_facts),
            summary: summary_line(summary.as_ref()),
        };
        let mut metadata = AssemblyMetadata {
            budget,
            hysteresis,
            window_messages: window.len(),
            profile_included: preamble.profile.is_some(),
            ..Default::default()
        };

        let mut prompt = preamble.build(&window, user);
        let mut total = estimate_messages_tokens(&prompt);

        // ── Fold ──────────────────────────────────────────────────────────
        let retain = self.config.fold_retain_messages;
        if !fits(total, budget, hysteresis) && window.len() > retain {
            let split = window.len() - retain;
            debug!(
                thread_id = %thread_id,
                total,
                budget,
                folding = split,
                "Prompt over budget, folding oldest messages"
            );

            match self.folder.fold(thread_id, summary.as_ref(), &window[..split]).await {
                Ok(folded) => {
                    window.drain(..split);
                    metadata.folded_messages = split;
                    summary = Some(folded);
                    preamble.summary = summary_line(summary.as_ref());
                    prompt = preamble.build(&window, user);
                    total = estimate_messages_tokens(&prompt);
                }
                Err(e) if !e.is_turn_fatal() => {
                    warn!(thread_id = %thread_id, "Fold failed, truncating instead: {e}");
                    metadata.fold_failed = true;
                }
                Err(e) => return Err(e),
            }
        }

        // ── Decay ─────────────────────────────────────────────────────────
        let mut retained = window.len();
        while !fits(total, budget, hysteresis) && retained > 0 {
            retained = decay(retained);
            prompt = preamble.build(&window[window.len() - retained..], user);
            total = estimate_messages_tokens(&prompt);
        }

        metadata.retained_messages = retained;
        metadata.truncated_messages = window.len() - retained;
        metadata.total_tokens = total;
        metadata.summary_included = preamble.summary.is_some();

        if !fits(total, budget, hysteresis) {
            metadata.over_budget = true;
            warn!(
                thread_id = %thread_id,
                "{}",
                Error::BudgetUnsatisfiable {
                    tokens: total,
                    budget: budget + hysteresis,
                }
            );
        }

        Ok(AssembledContext {
            messages: prompt,
            metadata,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
