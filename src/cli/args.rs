//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// vmgate - per-identity VM lifecycle cache
///
/// Provisions a VM on first connection, reuses it while it is active and
/// shuts it down once it has been idle long enough.
#[derive(Parser, Debug)]
#[command(name = "vmgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "VMGATE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision (or reuse) the caller's VM and relay stdin/stdout to it
    Connect(ConnectArgs),

    /// Reconcile entries and stop idle VMs
    Reap(ReapArgs),

    /// List tracked VMs
    List(ListArgs),

    /// Stop one VM now and forget its entry
    Evict(EvictArgs),

    /// Check backend tooling, state store and reaper
    Status,

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the connect command
#[derive(Parser, Debug)]
pub struct ConnectArgs {
    /// Identity to connect as (defaults to $USER)
    #[arg(short, long, env = "VMGATE_IDENTITY")]
    pub identity: Option<String>,

    /// File holding the public key to authorize on a new VM
    /// (defaults to ~/.ssh/authorized_keys)
    #[arg(short, long)]
    pub key_file: Option<PathBuf>,

    /// Display name for the guest account (defaults to the identity)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Print the address instead of relaying
    #[arg(long)]
    pub print: bool,
}

/// Arguments for the reap command
#[derive(Parser, Debug)]
pub struct ReapArgs {
    /// Report what would happen without stopping or forgetting anything
    #[arg(long, conflicts_with = "watch")]
    pub dry_run: bool,

    /// Keep sweeping every reaper.interval_secs until interrupted
    #[arg(short, long)]
    pub watch: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the evict command
#[derive(Parser, Debug)]
pub struct EvictArgs {
    /// Identity whose VM to stop
    pub identity: String,

    /// Power off immediately instead of requesting a shutdown
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., reaper.idle_threshold_minutes)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for list and reap
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
