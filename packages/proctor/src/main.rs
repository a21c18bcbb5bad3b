use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod cli;
mod config;

use crate::config::ProctorConfig;

#[derive(Parser)]
#[command(name = "proctor")]
#[command(about = "Inspect and exercise the assessment session sync layer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.proctor)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration as TOML
    Config,

    /// Run a scripted session against in-memory collaborators
    Simulate(SimulateArgs),

    /// Inspect or clear persisted recovery tickets
    Tickets {
        #[command(subcommand)]
        command: TicketsCommand,
    },
}

#[derive(Parser)]
struct SimulateArgs {
    /// Number of durable writes that fail before writes succeed
    #[arg(long, default_value = "0")]
    flaky_writes: usize,

    /// Number of finalize calls that fail, counting the first attempt
    #[arg(long, default_value = "0")]
    finalize_failures: u32,

    /// Shrink every delay so the run takes about a second
    #[arg(long)]
    fast: bool,
}

#[derive(Subcommand)]
enum TicketsCommand {
    /// List live tickets
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one ticket as JSON
    Show { instance_id: String },
    /// Delete a ticket
    Clear { instance_id: String },
    /// Delete expired tickets
    Prune,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "proctor=debug,proctor_sync=debug,warn"
    } else {
        "proctor=info,proctor_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = ProctorConfig::new(cli.data_dir)?;

    match cli.command {
        Commands::Config => cli::config::config_command(&config),
        Commands::Simulate(args) => {
            let options = cli::simulate::SimulateOptions {
                flaky_writes: args.flaky_writes,
                finalize_failures: args.finalize_failures,
                fast: args.fast,
            };
            cli::simulate::simulate_command(&config, options).await
        }
        Commands::Tickets { command } => match command {
            TicketsCommand::List { json } => cli::tickets::list_command(&config, json).await,
            TicketsCommand::Show { instance_id } => {
                cli::tickets::show_command(&config, &instance_id).await
            }
            TicketsCommand::Clear { instance_id } => {
                cli::tickets::clear_command(&config, &instance_id).await
            }
            TicketsCommand::Prune => cli::tickets::prune_command(&config).await,
        },
    }
}
