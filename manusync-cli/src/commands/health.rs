//! `manusync health`: counters from the running daemon, or a local snapshot.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use manusync_daemon::{request_health, DaemonError};
use manusync_sync::HealthSnapshot;

/// Arguments for `manusync health`.
#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl HealthArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let (snapshot, live) = match request_health(&home) {
            Ok(data) => (
                serde_json::from_value::<HealthSnapshot>(data)
                    .context("daemon returned a malformed health snapshot")?,
                true,
            ),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                (super::open(&home)?.health(), false)
            }
            Err(err) => return Err(err).context("failed to query daemon health"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).context("failed to serialize health")?
            );
            return Ok(());
        }
        print_snapshot(&snapshot, live);
        Ok(())
    }
}

fn print_snapshot(snapshot: &HealthSnapshot, live: bool) {
    let status = if snapshot.is_healthy() {
        "healthy".green().bold()
    } else {
        "degraded".red().bold()
    };
    println!("manusync v{} | {status}", env!("CARGO_PKG_VERSION"));
    if !live {
        println!("daemon not running; counters cover this process only");
    }

    let m = &snapshot.metrics;
    let l = &snapshot.locks;
    println!("escalations open:  {}", snapshot.escalation_queue_depth);
    println!("retry queue:       {}", snapshot.retry_queue_depth);
    println!(
        "outcomes:          {} success | {} escalated | {} failed-retryable | {} failed-permanent",
        m.success, m.escalated, m.failed_retryable, m.failed_permanent
    );
    println!(
        "locks:             {} held | {} acquired | {} contended | {} busy | {} reclaimed",
        l.held, l.acquired, l.contended, l.busy, l.reclaimed
    );
    println!(
        "integrity errors:  {} | rollbacks {} ({} failed) | redetections {}",
        m.integrity_errors, m.rollbacks, m.rollback_failures, m.redetections
    );
    println!(
        "events appended:   {} ({} failed)",
        m.events_appended, m.event_append_failures
    );
}
