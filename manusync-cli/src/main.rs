//! manusync: keep CMS manuscripts and their agent copies in agreement.
//!
//! # Usage
//!
//! ```text
//! manusync init --canonical <dir> --shadow <dir>
//! manusync sync <record_id> [--json] [--daemon]
//! manusync events [<record_id>] [--since N] [--json] [--verify]
//! manusync escalations [--json]
//! manusync resolve <record_id> <field> <value> [--daemon]
//! manusync health [--json]
//! manusync daemon start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, escalations::EscalationsArgs, events::EventsArgs, health::HealthArgs,
    init::InitArgs, resolve::ResolveArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "manusync",
    version,
    about = "Synchronize manuscript records between the CMS and the agent subsystem",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config pointing at the two record directories.
    Init(InitArgs),

    /// Synchronize one manuscript record.
    Sync(SyncArgs),

    /// Show the audit trail of synchronization attempts.
    Events(EventsArgs),

    /// List conflicts waiting for an editorial decision.
    Escalations(EscalationsArgs),

    /// Record an editorial decision and apply it.
    Resolve(ResolveArgs),

    /// Show lock, queue and outcome counters.
    Health(HealthArgs),

    /// Manage the background sync daemon.
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
        Commands::Events(args) => args.run(),
        Commands::Escalations(args) => args.run(),
        Commands::Resolve(args) => args.run(),
        Commands::Health(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
