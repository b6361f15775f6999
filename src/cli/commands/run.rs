//! `curia run` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use console::style;

use crate::domain::models::run::{DeltaInput, DeltaSource, PermissionMode};
use crate::domain::models::Config;
use crate::domain::ports::{PlaybookStore, SubagentRunner, TranscriptStore};
use crate::infrastructure::{JsonlTranscriptStore, ScriptedRunner, SqlitePlaybookStore};
use crate::services::{DeltaGovernor, RunDriver, SubagentCoordinator, TranscriptRecorder};

#[derive(Args)]
pub struct RunArgs {
    /// High-level objective for the run.
    pub objective: String,

    /// JSON fixture of scripted subagent outcomes driving the run.
    #[arg(long)]
    pub script: PathBuf,

    /// Permission mode override: plan, accept-edits, bypass-permissions.
    #[arg(long)]
    pub permission_mode: Option<String>,

    /// Playbook section the run targets.
    #[arg(long)]
    pub section: Option<String>,

    /// Rationale when seeding the run from a curation-queue delta.
    #[arg(long)]
    pub rationale: Option<String>,
}

pub async fn execute(args: RunArgs, config: Config, json: bool) -> Result<()> {
    let permission_mode = args
        .permission_mode
        .as_deref()
        .map(|s| {
            PermissionMode::from_str(s)
                .with_context(|| format!("invalid permission mode: {s}"))
        })
        .transpose()?;

    let delta_input = args.section.map(|section| DeltaInput {
        delta_id: format!("cli-{section}"),
        rationale: args
            .rationale
            .unwrap_or_else(|| "manually filed from the command line".to_string()),
        playbook_section: section,
        source: DeltaSource::Manual,
    });

    let script_raw = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read script {}", args.script.display()))?;
    let script = serde_json::from_str(&script_raw).context("failed to parse script file")?;
    let runner = Arc::new(ScriptedRunner::from_script(script).await);

    let transcript_store: Arc<dyn TranscriptStore> =
        Arc::new(JsonlTranscriptStore::new(&config.transcript.dir));
    let recorder = Arc::new(TranscriptRecorder::new(transcript_store));
    let playbook: Arc<dyn PlaybookStore> = Arc::new(
        SqlitePlaybookStore::connect(&config.database)
            .await
            .context("failed to open playbook database")?,
    );

    let governor = Arc::new(DeltaGovernor::new(
        Arc::clone(&playbook),
        Arc::clone(&recorder),
        config.run.clone(),
    ));
    let coordinator = Arc::new(SubagentCoordinator::new(
        runner as Arc<dyn SubagentRunner>,
        Arc::clone(&recorder),
        config.run.clone(),
    ));
    let driver = RunDriver::new(
        recorder,
        governor,
        coordinator,
        playbook,
        config.run.clone(),
    );

    let completed = driver
        .execute(&args.objective, delta_input, permission_mode)
        .await
        .context("run failed")?;

    if json {
        let payload = serde_json::json!({
            "run_id": completed.run.id,
            "outcome": completed.run.outcome,
            "summary": completed.summary,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let outcome = completed
        .run
        .outcome
        .as_ref()
        .map_or("unknown".to_string(), |o| format!("{o:?}"));
    println!(
        "{} run {} finished: {outcome}",
        style("curia").cyan().bold(),
        completed.run.id
    );
    if let Some(summary) = completed.summary {
        println!("\n{}", summary.render_markdown());
    }
    Ok(())
}
