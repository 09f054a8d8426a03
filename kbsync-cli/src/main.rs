//! kbsync: knowledge base synchronization CLI.
//!
//! # Usage
//!
//! ```text
//! kbsync config put <config_id> --business-id <id> --business-name <name>
//!                   [--assistant <id>] [--industry <tag>] --payload <file.json>
//! kbsync config list
//! kbsync render <config_id> [--out <dir>]
//! kbsync diff <config_id>
//! kbsync sync <config_id> [--retry-failed]
//! kbsync status [--json]
//! kbsync daemon start|stop|status|enqueue <config_id>|jobs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    config::ConfigCommand, daemon::DaemonCommand, diff::DiffArgs, render::RenderArgs,
    status::StatusArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "kbsync",
    version,
    about = "Publish business configurations as assistant knowledge bases",
    long_about = None,
)]
struct Cli {
    /// Log engine activity to stderr (`RUST_LOG` overrides the level).
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, update and list configuration records.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Preview the documents a sync would publish.
    Render(RenderArgs),

    /// Show unified diff of generated documents against the archived copies.
    Diff(DiffArgs),

    /// Run one sync attempt for a configuration.
    Sync(SyncArgs),

    /// Show sync status across configurations.
    Status(StatusArgs),

    /// Manage the kbsync background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    // The daemon installs its own subscriber.
    if cli.verbose && !matches!(cli.command, Commands::Daemon { .. }) {
        init_logging();
    }
    match cli.command {
        Commands::Config { command } => commands::config::run(command),
        Commands::Render(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

/// stderr subscriber; library crates log through the `log` facade, which
/// the subscriber picks up.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
