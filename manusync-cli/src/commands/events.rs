//! `manusync events`: the hash-chained audit trail.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use futures::TryStreamExt;
use tabled::{settings::Style, Table, Tabled};

use manusync_core::{RecordId, SyncEvent};

/// Arguments for `manusync events`.
#[derive(Args, Debug)]
pub struct EventsArgs {
    /// Only events for this record (all records when omitted).
    pub record_id: Option<String>,

    /// Only events with a sequence number above N.
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub since: u64,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Check the hash chain of the whole log before listing.
    #[arg(long)]
    pub verify: bool,
}

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "seq")]
    seq: u64,
    #[tabled(rename = "time")]
    time: String,
    #[tabled(rename = "record")]
    record: String,
    #[tabled(rename = "actor")]
    actor: String,
    #[tabled(rename = "try")]
    attempt: u32,
    #[tabled(rename = "outcome")]
    outcome: String,
    #[tabled(rename = "changes")]
    changes: usize,
    #[tabled(rename = "resolved")]
    resolved: usize,
    #[tabled(rename = "escalated")]
    escalated: String,
    #[tabled(rename = "error")]
    error: String,
}

impl From<&SyncEvent> for EventRow {
    fn from(event: &SyncEvent) -> Self {
        Self {
            seq: event.seq,
            time: event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            record: event.record_id.to_string(),
            actor: event.actor.clone(),
            attempt: event.attempt,
            outcome: event.outcome.to_string(),
            changes: event.changes.len(),
            resolved: event.resolutions.len(),
            escalated: event.escalated_fields.join(", "),
            error: event.error.clone().unwrap_or_default(),
        }
    }
}

impl EventsArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let orchestrator = super::open(&home)?;
        let record_id = self.record_id.as_deref().map(RecordId::from);

        let (verified, events) = super::block_on(async {
            let verified = if self.verify {
                Some(
                    orchestrator
                        .verify_events()
                        .await
                        .context("event log failed verification")?,
                )
            } else {
                None
            };
            let events: Vec<SyncEvent> = orchestrator
                .list_events(record_id, self.since)
                .try_collect()
                .await
                .context("failed to read the event log")?;
            Ok::<_, anyhow::Error>((verified, events))
        })??;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&events).context("failed to serialize events")?
            );
            return Ok(());
        }

        if let Some(count) = verified {
            println!("{} hash chain intact ({count} events)", "✓".green().bold());
        }
        if events.is_empty() {
            println!("No sync events recorded.");
            return Ok(());
        }
        let rows: Vec<EventRow> = events.iter().map(EventRow::from).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
