//! `manusync daemon`: background watcher lifecycle.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;

use manusync_daemon::paths::socket_path;
use manusync_daemon::{request_status, request_stop, start_blocking, DaemonError};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run in the foreground: watch both record directories, drive retries,
    /// serve the control socket.
    Start,
    /// Ask a running daemon to shut down.
    Stop,
    /// Show whether the daemon is running and what it is watching.
    Status {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status { json } => {
            let status = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            } else {
                print_status(&status);
            }
        }
    }

    Ok(())
}

fn print_status(status: &Value) {
    let text = |key: &str| status[key].as_str().unwrap_or("-").to_string();
    if !status["running"].as_bool().unwrap_or(false) {
        println!("{} (socket {})", "daemon is not running".yellow(), text("socket"));
        return;
    }

    println!(
        "{} pid {} since {}",
        "daemon running".green().bold(),
        status["pid"],
        unix_to_display(status["started_at_unix"].as_u64())
    );
    println!("canonical:    {}", text("canonical_dir"));
    println!("shadow:       {}", text("shadow_dir"));
    println!(
        "last sync:    {}",
        unix_to_display(status["last_sync_at_unix"].as_u64())
    );
    println!("escalations:  {}", status["open_escalations"]);
    println!("retry queue:  {}", status["retry_queue_depth"]);
}

fn unix_to_display(secs: Option<u64>) -> String {
    secs.filter(|s| *s > 0)
        .and_then(|s| DateTime::<Utc>::from_timestamp(s as i64, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}
