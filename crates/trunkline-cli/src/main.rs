//! trunkline CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "trunkline")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so JSON output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { path, trigger, format } => {
            handlers::plan(&config, &path, &trigger, format)?
        }
        Commands::Run {
            path,
            trigger,
            format,
            max_parallel,
            no_cache,
        } => {
            let overrides = handlers::RunOverrides {
                format,
                max_parallel,
                no_cache,
            };
            let status = handlers::run_pipeline(&config, &path, &trigger, overrides).await?;
            if !status.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Schema { target } => handlers::schema(target)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
