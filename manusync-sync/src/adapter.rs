//! I/O boundaries to the two systems that own a manuscript.
//!
//! [`RecordStore`] is the CMS (system of record) side and [`AgentStateStore`]
//! the agent side. Both writes are optimistic: the caller passes the revision
//! it read and gets [`SyncError::RevisionConflict`] if the record moved.
//!
//! Patches are partial: keys not present are left alone, `null` deletes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use manusync_core::{FieldMap, FieldValue, ManuscriptRecord, RecordId, Side};

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// CMS side: canonical manuscript records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError>;

    /// Apply `fields` if the stored revision equals `expected_revision`.
    /// Returns the new revision.
    async fn update_record(
        &self,
        id: &RecordId,
        fields: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError>;
}

/// Agent side: the shadow copy of the same manuscript.
#[async_trait]
pub trait AgentStateStore: Send + Sync {
    async fn get_state(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError>;

    async fn update_state(
        &self,
        id: &RecordId,
        fields: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError>;
}

/// Apply a partial patch, bumping the revision and stamping the writer.
pub fn apply_patch(record: &mut ManuscriptRecord, patch: &FieldMap, writer: Side, now: DateTime<Utc>) {
    for (field, value) in patch {
        if value.is_null() {
            record.fields.remove(field);
        } else {
            record.fields.insert(field.clone(), value.clone());
        }
    }
    record.revision += 1;
    record.modified_at = now;
    record.modified_by = writer;
}

// ---------------------------------------------------------------------------
// Timed access used by the orchestrator
// ---------------------------------------------------------------------------

/// Both adapters behind one side-indexed interface with per-call timeouts.
#[derive(Clone)]
pub(crate) struct Adapters {
    pub canonical: Arc<dyn RecordStore>,
    pub shadow: Arc<dyn AgentStateStore>,
    pub timeout: Duration,
}

impl Adapters {
    pub async fn read(
        &self,
        side: Side,
        id: &RecordId,
    ) -> Result<Option<ManuscriptRecord>, SyncError> {
        let call = async {
            match side {
                Side::Canonical => self.canonical.get_record(id).await,
                Side::Shadow => self.shadow.get_state(id).await,
            }
        };
        self.timed(side, call).await
    }

    pub async fn write(
        &self,
        side: Side,
        id: &RecordId,
        patch: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError> {
        let call = async {
            match side {
                Side::Canonical => self.canonical.update_record(id, patch, expected_revision).await,
                Side::Shadow => self.shadow.update_state(id, patch, expected_revision).await,
            }
        };
        self.timed(side, call).await
    }

    async fn timed<T>(
        &self,
        side: Side,
        call: impl std::future::Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::AdapterUnavailable {
                side,
                reason: format!("call timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Faults {
    failing_reads: u32,
    failing_writes: u32,
    always_fail: bool,
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
}

/// In-memory adapter usable as either side, with fault injection and write
/// concurrency instrumentation.
#[derive(Debug)]
pub struct MemoryRecordStore {
    side: Side,
    records: Mutex<HashMap<RecordId, ManuscriptRecord>>,
    faults: Mutex<Faults>,
    inflight_writes: AtomicUsize,
    peak_inflight_writes: AtomicUsize,
    writes: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            records: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            inflight_writes: AtomicUsize::new(0),
            peak_inflight_writes: AtomicUsize::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Replace a record wholesale.
    pub fn insert(&self, record: ManuscriptRecord) {
        self.records.lock().insert(record.id.clone(), record);
    }

    pub fn snapshot(&self, id: &RecordId) -> Option<ManuscriptRecord> {
        self.records.lock().get(id).cloned()
    }

    pub fn field(&self, id: &RecordId, field: &str) -> Option<FieldValue> {
        self.records
            .lock()
            .get(id)
            .and_then(|r| r.value(field).cloned())
    }

    /// Simulate the owning system editing a field. Creates the record if
    /// needed and returns the new revision.
    pub fn set_field(&self, id: &RecordId, field: &str, value: FieldValue) -> u64 {
        let mut records = self.records.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| ManuscriptRecord::empty(id.clone(), self.side));
        let mut patch = FieldMap::new();
        patch.insert(field.to_string(), value);
        apply_patch(record, &patch, self.side, Utc::now());
        record.revision
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.faults.lock().failing_reads = count;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.faults.lock().failing_writes = count;
    }

    /// Every call fails with `AdapterUnavailable` until turned off.
    pub fn fail_always(&self, on: bool) {
        self.faults.lock().always_fail = on;
    }

    pub fn delay_reads(&self, delay: Duration) {
        self.faults.lock().read_delay = Some(delay);
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.faults.lock().write_delay = Some(delay);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Highest number of writes observed in flight at once.
    pub fn peak_concurrent_writes(&self) -> usize {
        self.peak_inflight_writes.load(Ordering::SeqCst)
    }

    async fn read(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError> {
        let delay = {
            let mut faults = self.faults.lock();
            if faults.always_fail || faults.failing_reads > 0 {
                faults.failing_reads = faults.failing_reads.saturating_sub(1);
                return Err(self.injected("read"));
            }
            faults.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.snapshot(id))
    }

    async fn write(
        &self,
        id: &RecordId,
        patch: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError> {
        let _inflight = InflightGuard::enter(&self.inflight_writes, &self.peak_inflight_writes);
        let delay = {
            let mut faults = self.faults.lock();
            if faults.always_fail || faults.failing_writes > 0 {
                faults.failing_writes = faults.failing_writes.saturating_sub(1);
                return Err(self.injected("write"));
            }
            faults.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut records = self.records.lock();
        let actual = records.get(id).map(|r| r.revision).unwrap_or(0);
        if actual != expected_revision {
            return Err(SyncError::RevisionConflict {
                side: self.side,
                expected: expected_revision,
                actual,
            });
        }
        let record = records
            .entry(id.clone())
            .or_insert_with(|| ManuscriptRecord::empty(id.clone(), self.side));
        apply_patch(record, patch, self.side, Utc::now());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record.revision)
    }

    fn injected(&self, op: &str) -> SyncError {
        SyncError::AdapterUnavailable {
            side: self.side,
            reason: format!("injected {op} fault"),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_record(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError> {
        self.read(id).await
    }

    async fn update_record(
        &self,
        id: &RecordId,
        fields: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError> {
        self.write(id, fields, expected_revision).await
    }
}

#[async_trait]
impl AgentStateStore for MemoryRecordStore {
    async fn get_state(&self, id: &RecordId) -> Result<Option<ManuscriptRecord>, SyncError> {
        self.read(id).await
    }

    async fn update_state(
        &self,
        id: &RecordId,
        fields: &FieldMap,
        expected_revision: u64,
    ) -> Result<u64, SyncError> {
        self.write(id, fields, expected_revision).await
    }
}

struct InflightGuard<'a> {
    inflight: &'a AtomicUsize,
}

impl<'a> InflightGuard<'a> {
    fn enter(inflight: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { inflight }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}
