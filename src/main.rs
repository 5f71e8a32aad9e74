//! vmgate - per-identity VM lifecycle cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vmgate::cli::{commands, Cli, Commands};
use vmgate::config::{Config, ConfigManager};
use vmgate::error::VmgateResult;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> VmgateResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);

    // Config inspection works even where the state dir cannot be created
    if let Commands::Config(args) = cli.command {
        return commands::config(args, &config, &config_manager).await;
    }

    ConfigManager::ensure_state_dirs(&config).await?;

    match cli.command {
        Commands::Connect(args) => commands::connect(args, &config).await,
        Commands::Reap(args) => commands::reap(args, &config).await,
        Commands::List(args) => commands::list(args, &config).await,
        Commands::Evict(args) => commands::evict(args, &config).await,
        Commands::Status => commands::status(&config).await,
        Commands::Config(_) => unreachable!("Config handled above"),
    }
}

/// Logs go to stderr; `connect` relays its byte stream over stdout.
///
/// 0 = warn, 1 = info, 2+ = debug. `VMGATE_LOG` overrides the level.
fn init_logging(verbose: u8, config: &Config) {
    let default = match verbose {
        0 => "vmgate=warn",
        1 => "vmgate=info",
        _ => "vmgate=debug",
    };
    let filter = EnvFilter::try_from_env("VMGATE_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
