//! Infrastructure layer: adapters behind the domain ports plus config and
//! logging bootstrap.

pub mod config;
pub mod logging;
pub mod playbook;
pub mod runner;
pub mod transcript;

pub use config::{ConfigError, ConfigLoader};
pub use playbook::{InMemoryPlaybookStore, SqlitePlaybookStore};
pub use runner::{ScriptEntry, ScriptFile, ScriptedRunner};
pub use transcript::{InMemoryTranscriptStore, JsonlTranscriptStore};
