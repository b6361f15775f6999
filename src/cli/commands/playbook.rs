//! `curia playbook` commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::domain::models::Config;
use crate::domain::ports::PlaybookStore;
use crate::infrastructure::SqlitePlaybookStore;

#[derive(Args)]
pub struct PlaybookArgs {
    #[command(subcommand)]
    pub command: PlaybookCommand,
}

#[derive(Subcommand)]
pub enum PlaybookCommand {
    /// List curated entries.
    List,
    /// Show one entry in full.
    Show { key: String },
}

pub async fn execute(args: PlaybookArgs, config: Config, json: bool) -> Result<()> {
    let store = SqlitePlaybookStore::connect(&config.database)
        .await
        .context("failed to open playbook database")?;

    match args.command {
        PlaybookCommand::List => {
            let snapshot = store.snapshot().await.context("failed to read playbook")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["key", "strategy", "+/-", "tags"]);
            for (key, entry) in &snapshot.entries {
                let mut strategy = entry.strategy.clone();
                if strategy.len() > 60 {
                    strategy.truncate(57);
                    strategy.push_str("...");
                }
                table.add_row(vec![
                    key.clone(),
                    strategy,
                    format!("+{}/-{}", entry.helpful_count, entry.harmful_count),
                    entry.tags.iter().cloned().collect::<Vec<_>>().join(", "),
                ]);
            }
            println!("{table}");
        }
        PlaybookCommand::Show { key } => {
            let versioned = store
                .read(&key)
                .await
                .context("failed to read playbook")?
                .with_context(|| format!("no entry at key {key}"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&versioned)?);
            } else {
                println!("key:      {key}");
                println!("version:  {}", versioned.version);
                println!("helpful:  {}", versioned.entry.helpful_count);
                println!("harmful:  {}", versioned.entry.harmful_count);
                println!("strategy: {}", versioned.entry.strategy);
            }
        }
    }
    Ok(())
}
