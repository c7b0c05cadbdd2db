pub mod daemon;
pub mod escalations;
pub mod events;
pub mod health;
pub mod init;
pub mod resolve;
pub mod sync;

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use manusync_sync::{pipeline, Orchestrator};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// File-backed orchestrator for `home`, with open escalations and pending
/// decisions restored so that held fields stay pinned.
pub(crate) fn open(home: &Path) -> Result<Orchestrator> {
    let orchestrator =
        pipeline::open_at(home).context("failed to open sync state; run `manusync init` first")?;
    block_on(orchestrator.restore_escalations())?
        .context("failed to read escalations from the event log")?;
    Ok(orchestrator)
}

/// Drive an engine future to completion on a single-threaded runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}
