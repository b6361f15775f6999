//! `curia delta` commands: manual curation against the playbook.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use console::style;

use crate::domain::models::delta::{DeltaOp, DeltaProposal, RejectCategory};
use crate::domain::models::run::{Phase, TaskRun};
use crate::domain::models::Config;
use crate::domain::ports::{PlaybookStore, TranscriptStore};
use crate::infrastructure::{JsonlTranscriptStore, SqlitePlaybookStore};
use crate::services::command_surface::{self, Command};
use crate::services::{DeltaGovernor, TranscriptRecorder};

#[derive(Args)]
pub struct DeltaArgs {
    #[command(subcommand)]
    pub command: DeltaCommand,
}

#[derive(Subcommand)]
pub enum DeltaCommand {
    /// Propose and accept a delta under the governance contract.
    Accept {
        /// Playbook key to write.
        key: String,
        /// Strategy text.
        content: String,
        /// Why this delta should land.
        #[arg(long, default_value = "manually accepted from the command line")]
        rationale: String,
        /// Remove the entry instead of upserting it.
        #[arg(long)]
        remove: bool,
    },
    /// Record an explicit rejection for audit; the playbook is untouched.
    Reject {
        /// Playbook key the rejected delta targeted.
        key: String,
        /// Rejection category: insufficient_evidence, test_failure,
        /// conflicts_with_existing, low_confidence, other.
        #[arg(long, default_value = "other")]
        category: String,
        /// Why the delta was rejected.
        #[arg(long, default_value = "manually rejected from the command line")]
        rationale: String,
    },
}

pub async fn execute(args: DeltaArgs, config: Config, json: bool) -> Result<()> {
    let transcript_store: Arc<dyn TranscriptStore> =
        Arc::new(JsonlTranscriptStore::new(&config.transcript.dir));
    let recorder = Arc::new(TranscriptRecorder::new(transcript_store));
    let playbook: Arc<dyn PlaybookStore> = Arc::new(
        SqlitePlaybookStore::connect(&config.database)
            .await
            .context("failed to open playbook database")?,
    );
    let governor = DeltaGovernor::new(playbook, Arc::clone(&recorder), config.run.clone());

    // Manual curation runs as a one-command review: the synthetic run sits
    // in Review so the command surface applies the same gating as a live
    // loop.
    let mut run = TaskRun::new(
        "manual curation",
        None,
        config.run.default_permission_mode,
    );
    run.phase = Phase::Review;

    match args.command {
        DeltaCommand::Accept {
            key,
            content,
            rationale,
            remove,
        } => {
            command_surface::validate(Command::AcceptDelta, &run)
                .context("command rejected by the surface validator")?;

            let op = if remove { DeltaOp::Remove } else { DeltaOp::Add };
            let proposal =
                DeltaProposal::new(run.id, Phase::Review, op, key, content, rationale);
            let decision = governor
                .decide(&run, &proposal)
                .await
                .context("governor decision failed")?;

            emit(json, &proposal, &decision)?;
        }
        DeltaCommand::Reject {
            key,
            category,
            rationale,
        } => {
            command_surface::validate(Command::RejectDelta, &run)
                .context("command rejected by the surface validator")?;

            let category = parse_category(&category)?;
            let proposal = DeltaProposal::new(
                run.id,
                Phase::Review,
                DeltaOp::Add,
                key,
                String::new(),
                rationale.clone(),
            );
            let decision = governor
                .reject(&run, &proposal, category, rationale)
                .await
                .context("failed to record rejection")?;

            emit(json, &proposal, &decision)?;
        }
    }
    Ok(())
}

fn parse_category(s: &str) -> Result<RejectCategory> {
    Ok(match s {
        "insufficient_evidence" => RejectCategory::InsufficientEvidence,
        "test_failure" => RejectCategory::TestFailure,
        "conflicts_with_existing" => RejectCategory::ConflictsWithExisting,
        "low_confidence" => RejectCategory::LowConfidence,
        "other" => RejectCategory::Other,
        other => bail!("unknown rejection category: {other}"),
    })
}

fn emit(
    json: bool,
    proposal: &DeltaProposal,
    decision: &crate::domain::models::DeltaDecision,
) -> Result<()> {
    if json {
        let payload = serde_json::json!({
            "proposal_id": proposal.id,
            "target_key": proposal.target_key,
            "decision": decision,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!(
            "{} {} on {}: {decision:?}",
            style("delta").cyan().bold(),
            proposal.id,
            proposal.target_key
        );
    }
    Ok(())
}
