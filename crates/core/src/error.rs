//! Error types for the LocalAPI domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] is the turn-level
//! taxonomy the orchestrator and transport layers reason about.

use thiserror::Error;

/// The top-level error type for all LocalAPI operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Inference backend ---
    #[error("Inference backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Inference stream failed: {0}")]
    BackendStreamError(String),

    // --- Context engine ---
    #[error("History folding failed: {0}")]
    FoldingFailed(String),

    #[error("Prompt needs {tokens} tokens but budget is {budget} even after truncation")]
    BudgetUnsatisfiable { tokens: usize, budget: usize },

    // --- Persistence ---
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Request level ---
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::StreamInterrupted(_) | ProviderError::MalformedChunk(_) => {
                Error::BackendStreamError(err.to_string())
            }
            other => Error::BackendUnavailable(other.to_string()),
        }
    }
}

impl Error {
    /// Whether this error ends a turn with `failed` status.
    ///
    /// Folding and budget errors are recovered inside context assembly.
    pub fn is_turn_fatal(&self) -> bool {
        !matches!(self, Error::FoldingFailed(_) | Error::BudgetUnsatisfiable { .. })
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Malformed stream chunk: {0}")]
    MalformedChunk(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<ProviderError> for ToolError {
    fn from(err: ProviderError) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::from(ProviderError::ApiError {
            status_code: 503,
            message: "model loading".into(),
        });
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("model loading"));
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[test]
    fn stream_errors_map_to_stream_variant() {
        let err = Error::from(ProviderError::StreamInterrupted("connection reset".into()));
        assert!(matches!(err, Error::BackendStreamError(_)));

        let err = Error::from(ProviderError::MalformedChunk("{oops".into()));
        assert!(matches!(err, Error::BackendStreamError(_)));
    }

    #[test]
    fn folding_errors_are_absorbed() {
        assert!(!Error::FoldingFailed("timeout".into()).is_turn_fatal());
        assert!(!Error::BudgetUnsatisfiable { tokens: 90, budget: 50 }.is_turn_fatal());
        assert!(Error::BackendUnavailable("refused".into()).is_turn_fatal());
        assert!(Error::Persistence(StoreError::Storage("disk full".into())).is_turn_fatal());
    }

    #[test]
    fn store_error_displays_correctly() {
        let err = Error::from(StoreError::InvalidState("response r1 already completed".into()));
        assert!(err.to_string().contains("already completed"));
    }
}
