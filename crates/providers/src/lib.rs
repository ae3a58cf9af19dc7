//! LLM Provider implementations for LocalAPI.
//!
//! All providers implement the `localapi_core::Provider` trait. The only
//! backend is a local OpenAI-compatible server (LM Studio, Ollama, vLLM).

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
