//! Budgeted prompt assembly.
//!
//! # Prompt Layers (in order)
//!
//! | Layer | Source | Under pressure |
//! |-------|--------|----------------|
//! | 1. System prompt | Fixed | Never trimmed |
//! | 2. Profile line | Profile facts | Never trimmed |
//! | 3. Summary line | Folded history | Grows by merging |
//! | 4. Recent window | Unfolded messages | Folded, then decayed oldest-first |
//! | 5. User turn | The new message | Never dropped |

pub mod assembler;

pub use assembler::{
    AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, decay, fits, profile_line,
};

/// First line of every prompt.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant. Be concise.";
