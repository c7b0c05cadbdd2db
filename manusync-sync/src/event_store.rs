//! Append-only, hash-chained audit trail of [`SyncEvent`]s.
//!
//! Each appended event gets the next sequence number (starting at 1), the
//! previous event's hash, and its own hash:
//!
//! ```text
//! hash = hex(sha256(prev_hash || json(event with hash = "")))
//! ```
//!
//! The first event chains from [`GENESIS_HASH`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use manusync_core::{paths, RecordId, SyncEvent};

use crate::error::{io_err, SyncError};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Default page size of [`list_events`].
pub const PAGE_SIZE: usize = 256;

/// One page of events after a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub events: Vec<SyncEvent>,
    /// Pass as `since` to read the next page.
    pub next_cursor: u64,
    /// No matching events exist after this page.
    pub exhausted: bool,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Seal and append `event`; returns it with `seq`, `prev_hash`, `hash` set.
    async fn append(&self, event: SyncEvent) -> Result<SyncEvent, SyncError>;

    /// Up to `limit` events with `seq > since`, optionally for one record.
    async fn read_page(
        &self,
        record_id: Option<&RecordId>,
        since: u64,
        limit: usize,
    ) -> Result<EventPage, SyncError>;

    /// True if any committed event exists for the record.
    async fn has_history(&self, record_id: &RecordId) -> Result<bool, SyncError>;

    /// Walk the whole chain; returns the number of events verified.
    async fn verify_chain(&self) -> Result<usize, SyncError>;
}

/// Lazily page through events with `seq > since`.
///
/// The stream ends once a page reports exhaustion. Restart from the `seq` of
/// the last event seen to resume.
pub fn list_events(
    store: Arc<dyn EventStore>,
    record_id: Option<RecordId>,
    since: u64,
    page_size: usize,
) -> BoxStream<'static, Result<SyncEvent, SyncError>> {
    let page_size = page_size.max(1);
    stream::try_unfold(Some(since), move |cursor| {
        let store = Arc::clone(&store);
        let record_id = record_id.clone();
        async move {
            let Some(cursor) = cursor else {
                return Ok::<_, SyncError>(None);
            };
            let page = store.read_page(record_id.as_ref(), cursor, page_size).await?;
            if page.events.is_empty() {
                return Ok(None);
            }
            let next = (!page.exhausted).then_some(page.next_cursor);
            Ok(Some((page.events, next)))
        }
    })
    .map_ok(|events| stream::iter(events.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

// ---------------------------------------------------------------------------
// Hash chain
// ---------------------------------------------------------------------------

pub fn event_hash(event: &SyncEvent) -> Result<String, SyncError> {
    let mut body = event.clone();
    body.hash = String::new();
    let json = serde_json::to_vec(&body)?;
    let mut hasher = Sha256::new();
    hasher.update(body.prev_hash.as_bytes());
    hasher.update(&json);
    Ok(hex::encode(hasher.finalize()))
}

fn seal(mut event: SyncEvent, last: Option<(u64, &str)>) -> Result<SyncEvent, SyncError> {
    let (seq, prev) = last.unwrap_or((0, GENESIS_HASH));
    event.seq = seq + 1;
    event.prev_hash = prev.to_string();
    event.hash = event_hash(&event)?;
    Ok(event)
}

fn verify(events: &[SyncEvent]) -> Result<usize, SyncError> {
    let mut prev = GENESIS_HASH.to_string();
    for (i, event) in events.iter().enumerate() {
        let expected_seq = i as u64 + 1;
        if event.seq != expected_seq {
            return Err(SyncError::Integrity(format!(
                "event chain gap: expected seq {expected_seq}, found {}",
                event.seq
            )));
        }
        if event.prev_hash != prev {
            return Err(SyncError::Integrity(format!(
                "event {} does not chain from its predecessor",
                event.seq
            )));
        }
        if event_hash(event)? != event.hash {
            return Err(SyncError::Integrity(format!(
                "event {} hash does not match its contents",
                event.seq
            )));
        }
        prev = event.hash.clone();
    }
    Ok(events.len())
}

fn page_of<'a>(
    events: impl Iterator<Item = &'a SyncEvent>,
    record_id: Option<&RecordId>,
    since: u64,
    limit: usize,
) -> EventPage {
    let mut matching = events
        .filter(|e| e.seq > since)
        .filter(|e| record_id.map_or(true, |id| e.record_id == *id));
    let page: Vec<SyncEvent> = matching.by_ref().take(limit).cloned().collect();
    let exhausted = matching.next().is_none();
    EventPage {
        next_cursor: page.last().map_or(since, |e| e.seq),
        events: page,
        exhausted,
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored event in place. Only for exercising
    /// [`EventStore::verify_chain`].
    pub fn tamper(&self, seq: u64, edit: impl FnOnce(&mut SyncEvent)) {
        if let Some(event) = self.events.lock().iter_mut().find(|e| e.seq == seq) {
            edit(event);
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: SyncEvent) -> Result<SyncEvent, SyncError> {
        let mut events = self.events.lock();
        let sealed = seal(event, events.last().map(|e| (e.seq, e.hash.as_str())))?;
        events.push(sealed.clone());
        Ok(sealed)
    }

    async fn read_page(
        &self,
        record_id: Option<&RecordId>,
        since: u64,
        limit: usize,
    ) -> Result<EventPage, SyncError> {
        Ok(page_of(self.events.lock().iter(), record_id, since, limit))
    }

    async fn has_history(&self, record_id: &RecordId) -> Result<bool, SyncError> {
        Ok(self
            .events
            .lock()
            .iter()
            .any(|e| e.committed && e.record_id == *record_id))
    }

    async fn verify_chain(&self) -> Result<usize, SyncError> {
        verify(&self.events.lock())
    }
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// One event per line in `<home>/.manusync/events.jsonl`.
///
/// Appends hold an exclusive `flock` on the log across reading the chain tail
/// and writing the new line, so every process on the host extends the same
/// chain. Reads take a shared lock. Parsed events are kept in an index that
/// only reads the bytes appended since the last look.
#[derive(Debug, Clone)]
pub struct JsonlEventStore {
    path: PathBuf,
    index: Arc<Mutex<LogIndex>>,
}

#[derive(Debug, Default)]
struct LogIndex {
    /// Bytes of complete lines already parsed.
    offset: u64,
    lines: usize,
    events: Vec<SyncEvent>,
    committed: HashSet<RecordId>,
}

impl LogIndex {
    fn push(&mut self, event: SyncEvent) {
        if event.committed {
            self.committed.insert(event.record_id.clone());
        }
        self.events.push(event);
    }

    /// Parse whatever complete lines were appended after `offset`. A
    /// shrunken file is re-read from the start; a trailing partial line is
    /// left for the next refresh.
    fn refresh(&mut self, file: &mut File, path: &Path) -> Result<(), SyncError> {
        let len = file.metadata().map_err(|e| io_err(path, e))?.len();
        if len < self.offset {
            *self = LogIndex::default();
        }
        if len == self.offset {
            return Ok(());
        }
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| io_err(path, e))?;
        let mut reader = BufReader::new(&mut *file);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).map_err(|e| io_err(path, e))?;
            if read == 0 || !line.ends_with('\n') {
                return Ok(());
            }
            if !line.trim().is_empty() {
                let event = serde_json::from_str(&line).map_err(|err| {
                    SyncError::Integrity(format!(
                        "{}:{}: unreadable event: {err}",
                        path.display(),
                        self.lines + 1
                    ))
                })?;
                self.push(event);
            }
            self.lines += 1;
            self.offset += read as u64;
        }
    }
}

impl JsonlEventStore {
    pub fn new(home: &Path) -> Self {
        Self::at_path(paths::events_path(home))
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: Arc::new(Mutex::new(LogIndex::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` on the index after catching it up with the file, under a
    /// shared lock on the log.
    async fn read<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&LogIndex) -> Result<T, SyncError> + Send + 'static,
    {
        let (path, index) = (self.path.clone(), Arc::clone(&self.index));
        blocking(move || {
            let mut index = index.lock();
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    *index = LogIndex::default();
                    return op(&index);
                }
                Err(err) => return Err(io_err(&path, err)),
            };
            fs2::FileExt::lock_shared(&file).map_err(|e| io_err(&path, e))?;
            let refreshed = index.refresh(&mut file, &path);
            let _ = fs2::FileExt::unlock(&file);
            refreshed?;
            op(&index)
        })
        .await
    }
}

async fn blocking<T, F>(op: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| SyncError::Integrity(format!("event store join error: {err}")))?
}

/// Seal `event` onto the tail and write it. The caller holds the exclusive
/// lock on `file`.
fn append_locked(
    path: &Path,
    index: &mut LogIndex,
    file: &mut File,
    event: SyncEvent,
) -> Result<SyncEvent, SyncError> {
    index.refresh(file, path)?;
    // Anything past the last complete line is a torn write from a crash.
    let len = file.metadata().map_err(|e| io_err(path, e))?.len();
    if len > index.offset {
        tracing::warn!(
            path = %path.display(),
            bytes = len - index.offset,
            "truncating partial event line"
        );
        file.set_len(index.offset).map_err(|e| io_err(path, e))?;
    }

    let tail = index.events.last();
    let sealed = seal(event, tail.map(|e| (e.seq, e.hash.as_str())))?;
    let mut line = serde_json::to_vec(&sealed)?;
    line.push(b'\n');
    file.write_all(&line).map_err(|e| io_err(path, e))?;
    file.sync_data().map_err(|e| io_err(path, e))?;
    index.offset += line.len() as u64;
    index.lines += 1;
    index.push(sealed.clone());
    Ok(sealed)
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, event: SyncEvent) -> Result<SyncEvent, SyncError> {
        let (path, index) = (self.path.clone(), Arc::clone(&self.index));
        blocking(move || {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            }
            let mut index = index.lock();
            let mut file = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)
                .map_err(|e| io_err(&path, e))?;
            fs2::FileExt::lock_exclusive(&file).map_err(|e| io_err(&path, e))?;
            let appended = append_locked(&path, &mut index, &mut file, event);
            let _ = fs2::FileExt::unlock(&file);
            appended
        })
        .await
    }

    async fn read_page(
        &self,
        record_id: Option<&RecordId>,
        since: u64,
        limit: usize,
    ) -> Result<EventPage, SyncError> {
        let record_id = record_id.cloned();
        self.read(move |index| {
            let start = index.events.partition_point(|e| e.seq <= since);
            Ok(page_of(index.events[start..].iter(), record_id.as_ref(), since, limit))
        })
        .await
    }

    async fn has_history(&self, record_id: &RecordId) -> Result<bool, SyncError> {
        let record_id = record_id.clone();
        self.read(move |index| Ok(index.committed.contains(&record_id)))
            .await
    }

    async fn verify_chain(&self) -> Result<usize, SyncError> {
        self.read(|index| verify(&index.events)).await
    }
}
