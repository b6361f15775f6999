//! `curia transcript` commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use uuid::Uuid;

use crate::domain::models::event::SequenceNumber;
use crate::domain::models::Config;
use crate::domain::ports::TranscriptStore;
use crate::infrastructure::JsonlTranscriptStore;
use crate::services::metrics::RunMetrics;
use crate::services::replay::replay;
use crate::services::TranscriptRecorder;

#[derive(Args)]
pub struct TranscriptArgs {
    #[command(subcommand)]
    pub command: TranscriptCommand,
}

#[derive(Subcommand)]
pub enum TranscriptCommand {
    /// Print a run's events.
    Show {
        run_id: Uuid,
        /// Resume from this sequence number.
        #[arg(long, default_value_t = 0)]
        from: u64,
    },
    /// Replay a run and print the reconstructed terminal state.
    Replay { run_id: Uuid },
    /// Aggregate metrics from a run's transcript.
    Metrics { run_id: Uuid },
}

pub async fn execute(args: TranscriptArgs, config: Config, json: bool) -> Result<()> {
    let store: Arc<dyn TranscriptStore> =
        Arc::new(JsonlTranscriptStore::new(&config.transcript.dir));
    let recorder = TranscriptRecorder::new(store);

    match args.command {
        TranscriptCommand::Show { run_id, from } => {
            let events = recorder
                .read(run_id, SequenceNumber(from))
                .await
                .context("failed to read transcript")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["seq", "time", "kind", "subagent", "payload"]);
            for event in &events {
                let mut payload = event.payload.to_string();
                if payload.len() > 72 {
                    payload.truncate(69);
                    payload.push_str("...");
                }
                table.add_row(vec![
                    event.sequence.to_string(),
                    event.timestamp.format("%H:%M:%S%.3f").to_string(),
                    event.kind.to_string(),
                    event
                        .subagent_id
                        .map_or(String::new(), |id| id.to_string()[..8].to_string()),
                    payload,
                ]);
            }
            println!("{table}");
        }
        TranscriptCommand::Replay { run_id } => {
            let events = recorder
                .read(run_id, SequenceNumber(0))
                .await
                .context("failed to read transcript")?;
            let replayed = replay(&events).context("replay failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&replayed)?);
            } else {
                println!("events replayed: {}", replayed.event_count);
                println!(
                    "final phase: {}",
                    replayed
                        .final_phase
                        .map_or("unknown".to_string(), |p| p.to_string())
                );
                println!("outcome: {:?}", replayed.outcome);
                println!("proposals: {}", replayed.proposed.len());
                for (id, decision) in &replayed.decisions {
                    println!("  {id}: {decision:?}");
                }
            }
        }
        TranscriptCommand::Metrics { run_id } => {
            let events = recorder
                .read(run_id, SequenceNumber(0))
                .await
                .context("failed to read transcript")?;
            let metrics = RunMetrics::from_events(&events);

            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["phase", "entries", "duration (s)"]);
            for (phase, m) in &metrics.phases {
                table.add_row(vec![
                    phase.to_string(),
                    m.entry_count.to_string(),
                    format!("{:.2}", m.total_duration_seconds),
                ]);
            }
            println!("{table}");
            println!(
                "events: {}  tools: {}  subagents: {}",
                metrics.total_events, metrics.tool_invocations, metrics.subagents_spawned
            );
        }
    }
    Ok(())
}
