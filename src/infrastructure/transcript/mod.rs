//! Transcript store adapters.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlTranscriptStore;
pub use memory::InMemoryTranscriptStore;
