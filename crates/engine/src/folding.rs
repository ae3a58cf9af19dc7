//! History folding — compresses retired messages into the thread summary.
//!
//! A fold is one single-shot backend call. The prior summary is always part
//! of the input, so each fold merges into the digest instead of replacing it.
//! The summary row and its `folded_through` mark are written in one upsert;
//! a failed fold writes nothing.

use localapi_core::error::{Error, Result};
use localapi_core::message::{ChatMessage, Message, ThreadId};
use localapi_core::provider::{Provider, ProviderRequest};
use localapi_core::store::Store;
use localapi_core::thread::Summary;
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed instruction sent as the system message of every fold.
pub const FOLD_INSTRUCTION: &str = "You maintain a running summary of a conversation. \
Merge the existing summary with the new messages into one concise digest. \
Preserve names, preferences, tasks, facts and references to earlier material. \
Drop greetings, filler and repeated phrasing. Reply with the digest only.";

/// Upper bound on digest length requested from the backend.
const FOLD_MAX_TOKENS: u32 = 512;

pub struct HistoryFolder {
    provider: Arc<dyn Provider>,
    store: Arc<dyn Store>,
    model: String,
}

impl HistoryFolder {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn Store>, model: impl Into<String>) -> Self {
        Self {
            provider,
            store,
            model: model.into(),
        }
    }

    /// Fold `messages` into the thread summary and persist the result.
    ///
    /// `messages` must be in chronological order; the new `folded_through`
    /// mark is the `seq` of the last one. Backend failures and empty output
    /// come back as [`Error::FoldingFailed`] with the prior summary untouched.
    pub async fn fold(&self, thread_id: &ThreadId, prior: Option<&Summary>, messages: &[Message]) -> Result<Summary> {
        let Some(last) = messages.last() else {
            return Err(Error::FoldingFailed("nothing to fold".into()));
        };
        let folded_through = prior
            .map_or(last.seq, |p| p.folded_through.max(last.seq));

        let mut request = ProviderRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(FOLD_INSTRUCTION),
                ChatMessage::user(fold_input(prior, messages)),
            ],
        );
        request.temperature = 0.0;
        request.max_tokens = Some(FOLD_MAX_TOKENS);

        debug!(thread_id = %thread_id, count = messages.len(), "Folding history");

        let response = self
            .provider
            .complete(request)
            .await
            .map_err(|e| Error::FoldingFailed(e.to_string()))?;

        let digest = response.content.trim();
        if digest.is_empty() {
            return Err(Error::FoldingFailed("backend returned an empty summary".into()));
        }

        let summary = self
            .store
            .upsert_summary(thread_id, digest, folded_through)
            .await?;

        info!(
            thread_id = %thread_id,
            folded = messages.len(),
            folded_through,
            "Thread history folded"
        );
        Ok(summary)
    }
}

/// The user-turn body of a fold request.
fn fold_input(prior: Option<&Summary>, messages: &[Message]) -> String {
    let existing = prior
        .map(|s| s.content.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("(none)");

    let transcript = messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    format!("Existing summary:\n{existing}\n\nNew messages:\n{transcript}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FoldScript, ScriptedProvider, seed_messages};
    use localapi_core::message::Role;
    use localapi_store::InMemoryStore;

    #[tokio::test]
    async fn fold_merges_prior_summary_into_request() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let thread = store.create_thread().await.unwrap();
        let messages = seed_messages(&store, &thread.id, &["I adopted a cat", "Nice!"]).await;
        let prior = store.upsert_summary(&thread.id, "User is Ada.", 0).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new().with_folds(vec![FoldScript::Reply(
            "User is Ada; adopted a cat.".into(),
        )]));
        let folder = HistoryFolder::new(provider.clone(), store.clone(), "m");

        let summary = folder.fold(&thread.id, Some(&prior), &messages).await.unwrap();
        assert_eq!(summary.content, "User is Ada; adopted a cat.");
        assert_eq!(summary.folded_through, messages[1].seq);

        let sent = provider.fold_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].messages[0].content, FOLD_INSTRUCTION);
        assert!(sent[0].messages[1].content.contains("User is Ada."));
        assert!(sent[0].messages[1].content.contains("user: I adopted a cat"));
        assert!(!sent[0].stream);

        let stored = store.get_summary(&thread.id).await.unwrap().unwrap();
        assert_eq!(stored, summary);
    }

    #[tokio::test]
    async fn failed_fold_keeps_prior_summary() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let thread = store.create_thread().await.unwrap();
        let messages = seed_messages(&store, &thread.id, &["one", "two"]).await;
        let prior = store.upsert_summary(&thread.id, "old digest", 0).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new().with_folds(vec![
            FoldScript::Fail,
            FoldScript::Reply("   ".into()),
        ]));
        let folder = HistoryFolder::new(provider, store.clone(), "m");

        for _ in 0..2 {
            let err = folder.fold(&thread.id, Some(&prior), &messages).await.unwrap_err();
            assert!(matches!(err, Error::FoldingFailed(_)));
        }
        let stored = store.get_summary(&thread.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "old digest");
        assert_eq!(stored.folded_through, 0);
    }

    #[test]
    fn fold_input_without_prior() {
        let thread = ThreadId::from("t");
        let messages = vec![
            Message::ephemeral(thread.clone(), 1, Role::User, "hello"),
            Message::ephemeral(thread, 2, Role::Assistant, "hi"),
        ];
        let input = fold_input(None, &messages);
        assert!(input.starts_with("Existing summary:\n(none)"));
        assert!(input.ends_with("user: hello\nassistant: hi"));
    }
}
