//! slotsync: reservation sheet → remote store synchronizer.
//!
//! # Usage
//!
//! ```text
//! slotsync init <source-dir>
//! slotsync sync [--dry-run] [--json]
//! slotsync diff <file>
//! slotsync daemon start|stop|status|sync|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, diff::DiffArgs, init::InitArgs, sync::SyncArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "slotsync",
    version,
    about = "Synchronize reservation spreadsheets into the reservation store",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config pointing at a source directory.
    Init(InitArgs),

    /// Run one sync cycle in the foreground.
    Sync(SyncArgs),

    /// Show the changes a single sheet would produce, without applying them.
    Diff(DiffArgs),

    /// Run or talk to the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
