//! `manusync sync <record_id>`: one synchronization attempt.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use manusync_core::{RecordId, SyncEvent, SyncOutcome};
use manusync_daemon::request_sync;

const CLI_ACTOR: &str = "cli";

/// Arguments for `manusync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Manuscript record to synchronize.
    pub record_id: String,

    /// Emit the sync event as JSON.
    #[arg(long)]
    pub json: bool,

    /// Run the sync inside the running daemon instead of in-process.
    #[arg(long)]
    pub daemon: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let event = if self.daemon {
            let data = request_sync(&home, &self.record_id)
                .with_context(|| format!("daemon sync failed for '{}'", self.record_id))?;
            serde_json::from_value(data).context("daemon returned a malformed sync event")?
        } else {
            let orchestrator = super::open(&home)?;
            let record_id = RecordId::from(self.record_id.as_str());
            super::block_on(orchestrator.synchronize_as(&record_id, CLI_ACTOR))?
        };
        report(&event, self.json)
    }
}

/// Print `event` and turn a failed outcome into a non-zero exit.
pub(crate) fn report(event: &SyncEvent, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(event).context("failed to serialize sync event")?
        );
    } else {
        print_event(event);
    }
    match event.outcome {
        SyncOutcome::Success | SyncOutcome::Escalated => Ok(()),
        SyncOutcome::FailedRetryable | SyncOutcome::FailedPermanent => bail!(
            "synchronization of '{}' {}",
            event.record_id,
            event.outcome
        ),
    }
}

fn print_event(event: &SyncEvent) {
    let id = &event.record_id;
    match event.outcome {
        SyncOutcome::Success if event.is_noop() => {
            println!("{} '{id}' already in sync", "✓".green().bold());
        }
        SyncOutcome::Success => {
            println!(
                "{} '{id}' synced ({} changes, {} resolved)",
                "✓".green().bold(),
                event.changes.len(),
                event.resolutions.len(),
            );
        }
        SyncOutcome::Escalated => {
            println!(
                "{} '{id}' escalated: {}",
                "!".yellow().bold(),
                event.escalated_fields.join(", ")
            );
        }
        SyncOutcome::FailedRetryable | SyncOutcome::FailedPermanent => {
            let phase = event
                .failed_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "{} '{id}' {} during {phase}: {}",
                "✗".red().bold(),
                event.outcome,
                event.error.as_deref().unwrap_or("no error recorded"),
            );
        }
    }

    for resolution in &event.resolutions {
        println!(
            "  ≈  {}  {}  ({})",
            resolution.field, resolution.rule, resolution.reason
        );
    }
    if event.outcome == SyncOutcome::Escalated {
        println!("Run 'manusync escalations' to review.");
    }
    if event.seq == 0 {
        println!("{} event could not be recorded in the audit trail", "!".yellow().bold());
    }
}
