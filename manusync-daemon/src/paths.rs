use std::path::{Path, PathBuf};
use std::time::Duration;

use manusync_core::paths::manusync_root;

pub const DAEMON_LABEL: &str = "dev.manusync.daemon";
pub const DAEMON_SOCKET: &str = "daemon.sock";

/// Saves to the same record file inside this window trigger one sync.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// How often the retry driver checks for due retries.
pub const RETRY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn socket_path(home: &Path) -> PathBuf {
    manusync_root(home).join(DAEMON_SOCKET)
}
