//! Per-record leases.
//!
//! A lease is exclusive for one record id and expires after its TTL unless
//! renewed. Every grant carries a fencing token larger than any token
//! previously granted for that record; `renew` and `release` with a token
//! that is no longer current fail with [`SyncError::LeaseLost`].
//!
//! Two implementations:
//! - [`MemoryLockManager`]: in-process lease table
//! - [`FileLockManager`]: `<home>/.manusync/leases/<id>.lease`, shared by
//!   every process on the host

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use manusync_core::{paths, RecordId};

use crate::error::{io_err, SyncError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub record_id: RecordId,
    pub holder: String,
    /// Fencing token; strictly increasing per record.
    pub token: u64,
    pub ttl_ms: u64,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Return `Busy` immediately if the record is held.
    FailFast,
    /// Wait up to the given duration for the holder to release or expire.
    Wait(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired(Lease),
    Busy {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

/// Contention counters for the health surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    pub acquired: u64,
    /// Acquire calls that found the record held at least once.
    pub contended: u64,
    /// Acquire calls that gave up with `Busy`.
    pub busy: u64,
    /// Expired leases taken over by a new holder.
    pub reclaimed: u64,
    /// Leases currently held through this manager.
    pub held: u64,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(
        &self,
        record_id: &RecordId,
        holder: &str,
        ttl: Duration,
        mode: AcquireMode,
    ) -> Result<Acquire, SyncError>;

    /// Extend the lease by its TTL from now.
    async fn renew(&self, lease: &Lease) -> Result<Lease, SyncError>;

    async fn release(&self, lease: &Lease) -> Result<(), SyncError>;

    fn stats(&self) -> LockStats;
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    contended: AtomicU64,
    busy: AtomicU64,
    reclaimed: AtomicU64,
    held: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            held: self.held.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn release_one(&self) {
        let _ = self
            .held
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

fn lease_for(record_id: &RecordId, holder: &str, token: u64, ttl: Duration) -> Lease {
    Lease {
        record_id: record_id.clone(),
        holder: holder.to_string(),
        token,
        ttl_ms: ttl.as_millis() as u64,
        expires_at: expiry_from_now(ttl),
    }
}

fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    Utc::now() + ttl
}

fn lost(lease: &Lease) -> SyncError {
    SyncError::LeaseLost {
        record_id: lease.record_id.clone(),
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    lease: Lease,
    deadline: Instant,
}

/// In-process lease table. Waiters are woken on release and at the
/// current holder's expiry.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    table: Mutex<HashMap<RecordId, Entry>>,
    released: Notify,
    next_token: AtomicU64,
    counters: Counters,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant or report the current holder, without waiting.
    fn try_acquire(&self, record_id: &RecordId, holder: &str, ttl: Duration) -> Result<Lease, Entry> {
        let now = Instant::now();
        let mut table = self.table.lock();
        if let Some(entry) = table.get(record_id) {
            if entry.deadline > now {
                return Err(Entry {
                    lease: entry.lease.clone(),
                    deadline: entry.deadline,
                });
            }
            Counters::bump(&self.counters.reclaimed);
            self.counters.release_one();
            tracing::warn!(
                record_id = %record_id,
                holder = %entry.lease.holder,
                token = entry.lease.token,
                "reclaiming expired lease"
            );
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let lease = lease_for(record_id, holder, token, ttl);
        table.insert(
            record_id.clone(),
            Entry {
                lease: lease.clone(),
                deadline: now + ttl,
            },
        );
        Counters::bump(&self.counters.acquired);
        Counters::bump(&self.counters.held);
        Ok(lease)
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        record_id: &RecordId,
        holder: &str,
        ttl: Duration,
        mode: AcquireMode,
    ) -> Result<Acquire, SyncError> {
        let give_up = match mode {
            AcquireMode::FailFast => None,
            AcquireMode::Wait(wait) => Some(Instant::now() + wait),
        };
        let mut contended = false;
        loop {
            // Register for wake-ups before looking, so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = match self.try_acquire(record_id, holder, ttl) {
                Ok(lease) => {
                    tracing::debug!(record_id = %record_id, holder, token = lease.token, "lease acquired");
                    return Ok(Acquire::Acquired(lease));
                }
                Err(current) => current,
            };
            if !contended {
                contended = true;
                Counters::bump(&self.counters.contended);
            }

            let now = Instant::now();
            let Some(give_up) = give_up.filter(|at| *at > now) else {
                Counters::bump(&self.counters.busy);
                return Ok(Acquire::Busy {
                    holder: current.lease.holder,
                    expires_at: current.lease.expires_at,
                });
            };
            let wake = give_up.min(current.deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, SyncError> {
        let mut table = self.table.lock();
        match table.get_mut(&lease.record_id) {
            Some(entry) if entry.lease.token == lease.token => {
                entry.deadline = Instant::now() + lease.ttl();
                entry.lease.expires_at = expiry_from_now(lease.ttl());
                Ok(entry.lease.clone())
            }
            _ => Err(lost(lease)),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), SyncError> {
        {
            let mut table = self.table.lock();
            match table.get(&lease.record_id) {
                Some(entry) if entry.lease.token == lease.token => {
                    table.remove(&lease.record_id);
                }
                _ => return Err(lost(lease)),
            }
        }
        self.counters.release_one();
        self.released.notify_waiters();
        tracing::debug!(record_id = %lease.record_id, token = lease.token, "lease released");
        Ok(())
    }

    fn stats(&self) -> LockStats {
        self.counters.snapshot()
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

const POLL_START: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_millis(250);

/// Lease files under `<home>/.manusync/leases/`.
///
/// Every read-modify-write of `<id>.lease` happens under an exclusive
/// advisory lock on its sibling `<id>.lease.lock`, so grant, takeover, renew
/// and release are serialized across processes. The lease itself is written
/// to a temporary file and renamed into place. Tokens are wall-clock
/// nanoseconds, bumped past the previous holder's token when the clock has
/// not moved on.
#[derive(Debug)]
pub struct FileLockManager {
    dir: PathBuf,
    counters: Counters,
}

impl FileLockManager {
    pub fn new(home: &Path) -> Self {
        Self::in_dir(paths::leases_dir(home))
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counters: Counters::default(),
        }
    }

    pub fn lease_path(&self, record_id: &RecordId) -> Result<PathBuf, SyncError> {
        if !record_id.is_path_safe() {
            return Err(SyncError::Integrity(format!(
                "record id '{record_id}' cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{}.lease", record_id.0)))
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, SyncError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || op(dir))
            .await
            .map_err(|err| SyncError::Integrity(format!("lease task join error: {err}")))?
    }
}

#[derive(Debug)]
enum FileAttempt {
    Acquired { lease: Lease, reclaimed: bool },
    Busy(Lease),
}

fn read_lease(path: &Path) -> Result<Option<Lease>, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents).ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

fn write_replacing(path: &Path, lease: &Lease) -> Result<(), SyncError> {
    let tmp = path.with_extension(format!("lease.{}.tmp", lease.token));
    std::fs::write(&tmp, serde_json::to_vec(lease)?).map_err(|e| io_err(&tmp, e))?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, err));
    }
    Ok(())
}

fn next_token(previous: Option<u64>) -> u64 {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or(0);
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}

/// Exclusive `flock` on `<id>.lease.lock`; released on drop.
#[derive(Debug)]
struct RecordGuard {
    file: std::fs::File,
}

impl RecordGuard {
    fn lock(lease_path: &Path) -> Result<Self, SyncError> {
        let path = lease_path.with_extension("lease.lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        fs2::FileExt::lock_exclusive(&file).map_err(|e| io_err(&path, e))?;
        Ok(Self { file })
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn try_acquire_file(
    dir: &Path,
    path: &Path,
    record_id: &RecordId,
    holder: &str,
    ttl: Duration,
) -> Result<FileAttempt, SyncError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let _guard = RecordGuard::lock(path)?;

    // An unreadable lease file is treated as abandoned, like an expired one.
    let current = read_lease(path)?;
    if let Some(current) = current.as_ref().filter(|l| !l.is_expired()) {
        return Ok(FileAttempt::Busy(current.clone()));
    }
    let token = next_token(current.as_ref().map(|l| l.token));
    let lease = lease_for(record_id, holder, token, ttl);
    write_replacing(path, &lease)?;
    Ok(FileAttempt::Acquired {
        lease,
        reclaimed: current.is_some(),
    })
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn acquire(
        &self,
        record_id: &RecordId,
        holder: &str,
        ttl: Duration,
        mode: AcquireMode,
    ) -> Result<Acquire, SyncError> {
        let path = self.lease_path(record_id)?;
        let give_up = match mode {
            AcquireMode::FailFast => None,
            AcquireMode::Wait(wait) => Some(Instant::now() + wait),
        };
        let mut poll = POLL_START;
        let mut contended = false;
        loop {
            let attempt = {
                let (path, record_id, holder) = (path.clone(), record_id.clone(), holder.to_string());
                self.blocking(move |dir| try_acquire_file(&dir, &path, &record_id, &holder, ttl))
                    .await?
            };
            let current = match attempt {
                FileAttempt::Acquired { lease, reclaimed } => {
                    if reclaimed {
                        Counters::bump(&self.counters.reclaimed);
                        tracing::warn!(record_id = %record_id, "reclaimed expired lease file");
                    }
                    Counters::bump(&self.counters.acquired);
                    Counters::bump(&self.counters.held);
                    tracing::debug!(record_id = %record_id, holder, token = lease.token, "lease acquired");
                    return Ok(Acquire::Acquired(lease));
                }
                FileAttempt::Busy(current) => current,
            };
            if !contended {
                contended = true;
                Counters::bump(&self.counters.contended);
            }
            let now = Instant::now();
            let Some(give_up) = give_up.filter(|at| *at > now) else {
                Counters::bump(&self.counters.busy);
                return Ok(Acquire::Busy {
                    holder: current.holder,
                    expires_at: current.expires_at,
                });
            };
            tokio::time::sleep(poll.min(give_up - now)).await;
            poll = (poll * 2).min(POLL_MAX);
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, SyncError> {
        let path = self.lease_path(&lease.record_id)?;
        let lease = lease.clone();
        self.blocking(move |_| {
            let _guard = RecordGuard::lock(&path)?;
            match read_lease(&path)? {
                Some(current) if current.token == lease.token => {
                    let renewed = Lease {
                        expires_at: expiry_from_now(lease.ttl()),
                        ..current
                    };
                    write_replacing(&path, &renewed)?;
                    Ok(renewed)
                }
                _ => Err(lost(&lease)),
            }
        })
        .await
    }

    async fn release(&self, lease: &Lease) -> Result<(), SyncError> {
        let path = self.lease_path(&lease.record_id)?;
        let owned = lease.clone();
        self.blocking(move |_| {
            let _guard = RecordGuard::lock(&path)?;
            match read_lease(&path)? {
                Some(current) if current.token == owned.token => {
                    std::fs::remove_file(&path).map_err(|e| io_err(&path, e))
                }
                _ => Err(lost(&owned)),
            }
        })
        .await?;
        self.counters.release_one();
        tracing::debug!(record_id = %lease.record_id, token = lease.token, "lease released");
        Ok(())
    }

    fn stats(&self) -> LockStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn id() -> RecordId {
        RecordId::from("ms-1")
    }

    fn acquired(result: Acquire) -> Lease {
        match result {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy { holder, .. } => panic!("expected lease, held by {holder}"),
        }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn memory_lease_is_exclusive() {
        let locks = MemoryLockManager::new();
        let lease = acquired(locks.acquire(&id(), "a", TTL, AcquireMode::FailFast).await.unwrap());
        let busy = locks.acquire(&id(), "b", TTL, AcquireMode::FailFast).await.unwrap();
        assert!(matches!(busy, Acquire::Busy { ref holder, .. } if holder == "a"));

        let other = RecordId::from("ms-2");
        assert!(matches!(
            locks.acquire(&other, "b", TTL, AcquireMode::FailFast).await.unwrap(),
            Acquire::Acquired(_)
        ));

        locks.release(&lease).await.unwrap();
        let stats = locks.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.contended, 1);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.held, 1);
    }

    #[tokio::test]
    async fn memory_tokens_increase() {
        let locks = MemoryLockManager::new();
        let first = acquired(locks.acquire(&id(), "a", TTL, AcquireMode::FailFast).await.unwrap());
        locks.release(&first).await.unwrap();
        let second = acquired(locks.acquire(&id(), "a", TTL, AcquireMode::FailFast).await.unwrap());
        assert!(second.token > first.token);
    }

    #[tokio::test]
    async fn stale_token_is_rejected() {
        let locks = MemoryLockManager::new();
        let first = acquired(locks.acquire(&id(), "a", TTL, AcquireMode::FailFast).await.unwrap());
        locks.release(&first).await.unwrap();
        let _second = acquired(locks.acquire(&id(), "b", TTL, AcquireMode::FailFast).await.unwrap());

        assert!(matches!(locks.renew(&first).await, Err(SyncError::LeaseLost { .. })));
        assert!(matches!(locks.release(&first).await, Err(SyncError::LeaseLost { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_woken_by_release() {
        let locks = Arc::new(MemoryLockManager::new());
        let lease = acquired(locks.acquire(&id(), "a", TTL, AcquireMode::FailFast).await.unwrap());

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire(&id(), "b", TTL, AcquireMode::Wait(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        locks.release(&lease).await.unwrap();

        let lease_b = acquired(waiter.await.unwrap().unwrap());
        assert_eq!(lease_b.holder, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_gives_up() {
        let locks = MemoryLockManager::new();
        let _lease = acquired(locks.acquire(&id(), "a", TTL, AcquireMode::FailFast).await.unwrap());
        let started = Instant::now();
        let result = locks
            .acquire(&id(), "b", TTL, AcquireMode::Wait(Duration::from_millis(500)))
            .await
            .unwrap();
        assert!(matches!(result, Acquire::Busy { .. }));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_reacquired() {
        let locks = MemoryLockManager::new();
        let abandoned = acquired(
            locks
                .acquire(&id(), "a", Duration::from_millis(100), AcquireMode::FailFast)
                .await
                .unwrap(),
        );
        let lease = acquired(
            locks
                .acquire(&id(), "b", TTL, AcquireMode::Wait(Duration::from_secs(1)))
                .await
                .unwrap(),
        );
        assert_eq!(lease.holder, "b");
        assert!(lease.token > abandoned.token);
        assert_eq!(locks.stats().reclaimed, 1);
        assert!(locks.renew(&abandoned).await.is_err());
    }

    #[tokio::test]
    async fn file_lease_is_exclusive_across_managers() {
        let home = TempDir::new().unwrap();
        let one = FileLockManager::new(home.path());
        let two = FileLockManager::new(home.path());

        let lease = acquired(one.acquire(&id(), "one", TTL, AcquireMode::FailFast).await.unwrap());
        assert!(one.lease_path(&id()).unwrap().exists());
        assert!(matches!(
            two.acquire(&id(), "two", TTL, AcquireMode::FailFast).await.unwrap(),
            Acquire::Busy { ref holder, .. } if holder == "one"
        ));

        one.release(&lease).await.unwrap();
        assert!(!one.lease_path(&id()).unwrap().exists());
        let next = acquired(two.acquire(&id(), "two", TTL, AcquireMode::FailFast).await.unwrap());
        assert!(next.token > lease.token);
    }

    #[tokio::test]
    async fn file_lease_expired_is_reclaimed() {
        let home = TempDir::new().unwrap();
        let locks = FileLockManager::new(home.path());
        let old = acquired(
            locks
                .acquire(&id(), "old", Duration::from_millis(20), AcquireMode::FailFast)
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(40)).await;

        let new = acquired(
            locks
                .acquire(&id(), "new", TTL, AcquireMode::Wait(Duration::from_secs(1)))
                .await
                .unwrap(),
        );
        assert_eq!(new.holder, "new");
        assert!(new.token > old.token);
        assert!(matches!(locks.release(&old).await, Err(SyncError::LeaseLost { .. })));
        let leftovers: Vec<_> = std::fs::read_dir(paths::leases_dir(home.path()))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn expired_file_lease_goes_to_exactly_one_contender() {
        let home = TempDir::new().unwrap();
        for round in 0..20 {
            let seed = FileLockManager::new(home.path());
            acquired(
                seed.acquire(&id(), "gone", Duration::from_millis(1), AcquireMode::FailFast)
                    .await
                    .unwrap(),
            );
            tokio::time::sleep(Duration::from_millis(5)).await;

            let contenders: Vec<_> = (0..8)
                .map(|n| {
                    let locks = FileLockManager::new(home.path());
                    tokio::spawn(async move {
                        locks
                            .acquire(&id(), &format!("c{n}"), TTL, AcquireMode::FailFast)
                            .await
                            .unwrap()
                    })
                })
                .collect();
            let mut winners = Vec::new();
            for contender in contenders {
                if let Acquire::Acquired(lease) = contender.await.unwrap() {
                    winners.push(lease);
                }
            }
            assert_eq!(winners.len(), 1, "round {round}: {winners:?}");
            FileLockManager::new(home.path())
                .release(&winners[0])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn file_lease_renew_after_takeover_is_rejected() {
        let home = TempDir::new().unwrap();
        let one = FileLockManager::new(home.path());
        let two = FileLockManager::new(home.path());
        let stale = acquired(
            one.acquire(&id(), "one", Duration::from_millis(10), AcquireMode::FailFast)
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = acquired(two.acquire(&id(), "two", TTL, AcquireMode::FailFast).await.unwrap());

        assert!(matches!(one.renew(&stale).await, Err(SyncError::LeaseLost { .. })));
        let on_disk = read_lease(&two.lease_path(&id()).unwrap()).unwrap().unwrap();
        assert_eq!(on_disk.token, current.token);
        assert_eq!(on_disk.holder, "two");
    }

    #[tokio::test]
    async fn file_lease_renew_extends_expiry() {
        let home = TempDir::new().unwrap();
        let locks = FileLockManager::new(home.path());
        let lease = acquired(locks.acquire(&id(), "a", TTL, AcquireMode::FailFast).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let renewed = locks.renew(&lease).await.unwrap();
        assert_eq!(renewed.token, lease.token);
        assert!(renewed.expires_at > lease.expires_at);
    }
}
