//! Ports: trait boundaries between the core and its collaborators.

pub mod playbook;
pub mod subagent_runner;
pub mod transcript_store;

pub use playbook::{
    PlaybookEntry, PlaybookError, PlaybookSnapshot, PlaybookStore, VersionedEntry,
};
pub use subagent_runner::{SubagentRunner, SubagentRunnerError};
pub use transcript_store::{TranscriptStore, TranscriptStoreError};
