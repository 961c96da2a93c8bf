use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostdeck_logging::init_tracing;
use hostdeck_operations::{
    config::ConsoleSettings,
    orchestration_entry::{run_scenario, Scenario},
};
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "opsctl", version, about = "Hostdeck host operation orchestrator")]
struct Cli {
    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Loads and validates a settings file, then prints the effective values.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Runs a scripted scenario against the simulated host.
    Scenario {
        /// install-php, disable-firewall, system-update or flaky-job.
        name: Scenario,
        /// Approve the confirmation prompt instead of rejecting it.
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<ConsoleSettings> {
    path.map_or_else(|| Ok(ConsoleSettings::default()), ConsoleSettings::load)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    match cli.command {
        Commands::CheckConfig { config } => {
            let settings = load_settings(Some(&config))?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Scenario {
            name,
            approve,
            config,
        } => {
            let settings = load_settings(config.as_ref())?;
            let runtime = Runtime::new().context("starting tokio runtime")?;
            let report = runtime.block_on(run_scenario(name, settings, approve))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
