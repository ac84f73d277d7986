use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "jira-lark-sync",
    version,
    about = "One-way incremental sync of JIRA issues into Lark Base tables"
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one cycle for every enabled binding (or a `--team`/`--table`
    /// subset), then exit.
    Sync {
        #[arg(long)]
        team: Option<String>,
        #[arg(long)]
        table: Option<String>,
        /// Re-sync every matching issue regardless of staleness, bypassing
        /// the ProcessingLog's `updated` filter.
        #[arg(long)]
        full_update: bool,
    },
    /// Run continuously, scheduling each binding's cycle on its configured
    /// interval until interrupted.
    Daemon,
    /// Print every binding's last recorded cycle metrics.
    Status,
    /// Sync one issue by key, regardless of staleness.
    Issue {
        #[arg(long)]
        team: String,
        #[arg(long)]
        table: String,
        key: String,
    },
    /// Retry resolution for every username a prior cycle left pending.
    ResolveUsers,
    /// Off-cycle upkeep: duplicate-row scan for every enabled binding, with
    /// an optional full field re-push.
    Maintenance {
        #[arg(long)]
        full_refresh: bool,
    },
}
