use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::TryStreamExt;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use manusync_core::{paths::manusync_root, Escalation, RecordId, SyncEvent};
use manusync_sync::{pipeline, Orchestrator};

use crate::error::{io_err, DaemonError};
use crate::paths::{socket_path, DAEMON_LABEL, DEBOUNCE_WINDOW, RETRY_POLL_INTERVAL};
use crate::protocol::{DaemonRequest, DaemonResponse};

const WATCHER_ACTOR: &str = "watcher";
const SOCKET_ACTOR: &str = "socket";
const EDITOR_ACTOR: &str = "editor";

/// Shared by every daemon task.
struct DaemonState {
    home: PathBuf,
    orchestrator: Arc<Orchestrator>,
    started_at_unix: u64,
    last_sync_at_unix: AtomicU64,
}

impl DaemonState {
    fn new(home: PathBuf, orchestrator: Orchestrator) -> Self {
        Self {
            home,
            orchestrator: Arc::new(orchestrator),
            started_at_unix: unix_seconds_now(),
            last_sync_at_unix: AtomicU64::new(0),
        }
    }

    async fn sync(&self, record_id: &RecordId, actor: &str) -> SyncEvent {
        let event = self.orchestrator.synchronize_as(record_id, actor).await;
        self.mark_synced();
        event
    }

    fn mark_synced(&self) {
        self.last_sync_at_unix
            .store(unix_seconds_now(), Ordering::Relaxed);
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon until ctrl-c or a `stop` request.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let orchestrator = pipeline::open_at(&home)?;
    let restored = orchestrator.restore_escalations().await?;
    let state = Arc::new(DaemonState::new(home.clone(), orchestrator));
    tracing::info!(
        home = %home.display(),
        open_escalations = restored,
        "daemon starting"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        tokio::spawn(async move {
            let result = watcher_task(state, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let retry_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        tokio::spawn(async move {
            let result = retry_task(state, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, retry_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, retry_handle, socket_handle, signal_handle);

    handle_join("watcher", watcher_result)?;
    handle_join("retry", retry_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Trailing-edge debounce keyed by record: a record fires once its files have
/// been quiet for the window.
struct Debouncer {
    window: Duration,
    pending: HashMap<RecordId, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn touch(&mut self, record_id: RecordId, now: Instant) {
        self.pending.insert(record_id, now + self.window);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    fn take_ready(&mut self, now: Instant) -> Vec<RecordId> {
        let mut ready: Vec<RecordId> = self
            .pending
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ready {
            self.pending.remove(id);
        }
        ready.sort();
        ready
    }
}

async fn watcher_task(
    state: Arc<DaemonState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let config = state.orchestrator.config();
    let dirs: Vec<PathBuf> = [config.canonical_dir.clone(), config.shadow_dir.clone()]
        .into_iter()
        .flatten()
        .collect();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    for dir in &dirs {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %dir.display(), "watching record directory");
    }

    let mut debouncer = Debouncer::new(DEBOUNCE_WINDOW);

    loop {
        let next = debouncer.next_deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep_until_some(next) => {
                for record_id in debouncer.take_ready(Instant::now()) {
                    let state = state.clone();
                    tokio::spawn(async move {
                        let event = state.sync(&record_id, WATCHER_ACTOR).await;
                        tracing::debug!(
                            record_id = %record_id,
                            outcome = %event.outcome,
                            "watcher-triggered sync finished"
                        );
                    });
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    if let Some(record_id) = record_id_for_path(path) {
                        debouncer.touch(record_id, Instant::now());
                    }
                }
            }
        }
    }

    Ok(())
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// `<dir>/<record_id>.json` → record id. Temp files and other names are
/// ignored.
fn record_id_for_path(path: &Path) -> Option<RecordId> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json {
        return None;
    }
    let record_id = RecordId::from(path.file_stem()?.to_str()?);
    record_id.is_path_safe().then_some(record_id)
}

// ---------------------------------------------------------------------------
// Retry driver
// ---------------------------------------------------------------------------

async fn retry_task(
    state: Arc<DaemonState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(RETRY_POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let events = state.orchestrator.run_due_retries().await;
                if !events.is_empty() {
                    state.mark_synced();
                    tracing::debug!(count = events.len(), "due retries processed");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = dispatch(&state, &request, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn dispatch(
    state: &DaemonState,
    request: &DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    match handle_request(state, request, shutdown_tx).await {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

async fn handle_request(
    state: &DaemonState,
    request: &DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Value, DaemonError> {
    let orchestrator = &state.orchestrator;
    match request.cmd.as_str() {
        "status" => Ok(status_payload(state)),
        "sync" => {
            let record_id = required_record(request)?;
            let event = state.sync(&record_id, SOCKET_ACTOR).await;
            Ok(serde_json::to_value(event)?)
        }
        "events" => {
            let record_id = request.record_id.clone().map(RecordId::from);
            let events: Vec<SyncEvent> = orchestrator
                .list_events(record_id, request.since.unwrap_or(0))
                .try_collect()
                .await?;
            Ok(serde_json::to_value(events)?)
        }
        "escalations" => {
            let after = request.since.unwrap_or(0);
            let open: Vec<Escalation> = orchestrator
                .escalations()
                .open()
                .into_iter()
                .filter(|e| e.seq > after)
                .collect();
            Ok(serde_json::to_value(open)?)
        }
        "resolve" => {
            let record_id = required_record(request)?;
            let field = request
                .field
                .as_deref()
                .ok_or_else(|| DaemonError::Protocol("'resolve' needs a field".to_string()))?;
            let value = request
                .value
                .clone()
                .ok_or_else(|| DaemonError::Protocol("'resolve' needs a value".to_string()))?;
            orchestrator.resolve_escalation(&record_id, field, value).await?;
            let event = state.sync(&record_id, EDITOR_ACTOR).await;
            Ok(serde_json::to_value(event)?)
        }
        "health" => Ok(serde_json::to_value(orchestrator.health())?),
        "stop" => {
            let _ = shutdown_tx.send(());
            Ok(json!({ "stopping": true }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    }
}

fn required_record(request: &DaemonRequest) -> Result<RecordId, DaemonError> {
    request
        .record_id
        .as_deref()
        .map(RecordId::from)
        .ok_or_else(|| DaemonError::Protocol(format!("'{}' needs a record_id", request.cmd)))
}

fn status_payload(state: &DaemonState) -> Value {
    let orchestrator = &state.orchestrator;
    let config = orchestrator.config();
    let health = orchestrator.health();
    json!({
        "running": true,
        "label": DAEMON_LABEL,
        "pid": std::process::id(),
        "started_at_unix": state.started_at_unix,
        "last_sync_at_unix": state.last_sync_at_unix.load(Ordering::Relaxed),
        "socket": socket_path(&state.home).display().to_string(),
        "canonical_dir": config.canonical_dir,
        "shadow_dir": config.shadow_dir,
        "open_escalations": health.escalation_queue_depth,
        "retry_queue_depth": health.retry_queue_depth,
        "healthy": health.is_healthy(),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = manusync_root(home);
    fs::create_dir_all(&root).map_err(|e| io_err(&root, e))
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
