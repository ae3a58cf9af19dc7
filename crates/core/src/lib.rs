//! # LocalAPI Core
//!
//! Domain types, traits, and error definitions for the LocalAPI
//! conversational backend. This crate has **no framework dependencies**; it
//! defines the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Each external collaborator of the turn engine is a trait here:
//! - [`Provider`] — the inference backend (streaming and single-shot)
//! - [`Store`] — the relational persistence substrate
//! - [`Tool`] — a capability offered to the model in the tool round
//!
//! Implementations live in `localapi-providers` and `localapi-store`, which
//! keeps the engine testable with scripted providers and in-memory stores.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod response;
pub mod store;
pub mod thread;
pub mod token;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, StoreError, ToolError};
pub use event::StreamEvent;
pub use message::{ChatMessage, Message, Role, ThreadId};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use response::{ResponseDetail, ResponseRecord, ResponseStatus};
pub use store::{MessageWindow, Store};
pub use thread::{ProfileFact, Summary, Thread};
pub use tool::{Tool, ToolCall, ToolDefinition, ToolRegistry};
