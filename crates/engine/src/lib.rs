//! The LocalAPI turn engine.
//!
//! One user turn flows through:
//!
//! 1. **Resolve** the thread and take its lock
//! 2. **Persist** the user message with an `in_progress` response
//! 3. **Extract** profile facts from the user text
//! 4. **Assemble** a prompt under the token budget, folding old history into
//!    the thread summary when needed
//! 5. **Call tools** once when the user text carries a link
//! 6. **Stream** the backend reply to the listener and the accumulator
//! 7. **Persist** the assistant message, or mark the response failed

pub mod aggregator;
pub mod context;
pub mod folding;
pub mod orchestrator;
pub mod profile;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use aggregator::{AggregatedTurn, EventSink, StreamAggregator, TurnState};
pub use context::{AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, SYSTEM_PROMPT};
pub use folding::{FOLD_INSTRUCTION, HistoryFolder};
pub use orchestrator::{ResponseOrchestrator, TurnOutcome, TurnRequest};
pub use profile::{ProfileExtractor, RegexProfileExtractor};
pub use tools::{VisionDescribeTool, default_tools};
