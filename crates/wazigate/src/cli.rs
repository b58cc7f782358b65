//! Clap derive definitions for the `wazigate` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "wazigate",
    version,
    about = "Wazigate edge gateway: MQTT broker and cloud synchronizer",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    /// Defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Command>,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (default: $WAZIGATE_CONFIG, then the platform config dir)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker and the cloud synchronizer
    Serve(ServeArgs),

    /// Print the persisted clouds registry
    Clouds,

    /// Print the effective configuration as TOML
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// TLS certificate (.crt), overrides `tls_crt`
    #[arg(long)]
    pub crt: Option<PathBuf>,

    /// TLS private key (.key), overrides `tls_key`
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Gateway id, overrides `local_id`
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Also write it to the config file
    #[arg(long)]
    pub write: bool,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}
