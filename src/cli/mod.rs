//! Command-line interface.

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Curia: skills-loop orchestrator with proof-gated playbook governance.
#[derive(Parser)]
#[command(name = "curia", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file path; defaults to the `.curia/` hierarchy.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a full skills-loop run from a scripted agent fixture.
    Run(commands::run::RunArgs),
    /// Inspect, replay, or summarize run transcripts.
    Transcript(commands::transcript::TranscriptArgs),
    /// Manually accept or reject a delta against the playbook.
    Delta(commands::delta::DeltaArgs),
    /// Inspect the curated playbook.
    Playbook(commands::playbook::PlaybookArgs),
}

/// Print a CLI error and exit nonzero.
pub fn handle_error(err: anyhow::Error, json: bool) {
    if json {
        let payload = serde_json::json!({"error": err.to_string()});
        eprintln!("{payload}");
    } else {
        eprintln!("{} {err:#}", console::style("error:").red().bold());
    }
    std::process::exit(1);
}
