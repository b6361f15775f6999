//! Curia CLI entry point.

use clap::Parser;

use curia::cli::{Cli, Commands};
use curia::infrastructure::{logging, ConfigLoader};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.config.as_ref() {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            curia::cli::handle_error(err, cli.json);
            return;
        }
    };

    let _logging = match logging::init(&config.logging) {
        Ok(logging) => logging,
        Err(err) => {
            curia::cli::handle_error(err, cli.json);
            return;
        }
    };

    let result = match cli.command {
        Commands::Run(args) => curia::cli::commands::run::execute(args, config, cli.json).await,
        Commands::Transcript(args) => {
            curia::cli::commands::transcript::execute(args, config, cli.json).await
        }
        Commands::Delta(args) => {
            curia::cli::commands::delta::execute(args, config, cli.json).await
        }
        Commands::Playbook(args) => {
            curia::cli::commands::playbook::execute(args, config, cli.json).await
        }
    };

    if let Err(err) = result {
        curia::cli::handle_error(err, cli.json);
    }
}
