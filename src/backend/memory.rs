//! In-memory store exposing both transaction families over one row map.
//!
//! [`MemoryStore::locking`] hands out transactions that hold an exclusive
//! per-row `tokio` mutex across the read-modify-write, staging the write
//! until commit, the way a `SELECT ... FOR UPDATE` backend behaves. Removal
//! takes the same lock, like a `DELETE` queued behind the row lock, so an
//! open transaction always finishes before its row disappears.
//! [`MemoryStore::compare_and_swap`] hands out optimistic transactions that
//! record a version stamp at read time and write conditionally on it.
//!
//! Version stamps come from one store-global monotonic counter, so a
//! deleted-and-recreated row can never be mistaken for the row a reader
//! observed earlier.

use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

use crate::backend::RemoteStore;
use crate::error::Error;
use crate::time::{SystemTimeSource, TimeSource};
use crate::transaction::{LockedRow, StateWrite, StoreTransaction, UpdateOutcome};

#[derive(Debug, Clone, thiserror::Error)]
enum MemoryStoreError {
    #[error("update issued before the row lock was taken")]
    UpdateBeforeLock,
    #[error("conditional update issued before the versioned read")]
    UpdateBeforeRead,
}

/// The mutex a locking transaction holds for the lifetime of a row. A
/// removed row's lock is never reused; re-claiming the key mints a fresh
/// one, so lock identity tells incarnations of the same key apart.
type RowLock = Arc<tokio::sync::Mutex<()>>;

struct Row {
    bytes: Option<Vec<u8>>,
    version: u64,
    expires_at_nanos: Option<u64>,
    lock: RowLock,
}

impl Row {
    fn empty(version: u64) -> Self {
        Row {
            bytes: None,
            version,
            expires_at_nanos: None,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

struct Shared<K> {
    rows: Mutex<HashMap<K, Row>>,
    stamp: AtomicU64,
    time: Arc<dyn TimeSource>,
}

impl<K> Shared<K> {
    fn next_stamp(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn live_bytes(&self, row: &Row) -> Option<Vec<u8>> {
        match (row.bytes.as_ref(), row.expires_at_nanos) {
            (Some(_), Some(deadline)) if self.time.now_nanos() >= deadline => None,
            (Some(bytes), _) => Some(bytes.clone()),
            (None, _) => None,
        }
    }
}

/// Shared in-memory row map. Cheap to clone; clones see the same rows.
pub struct MemoryStore<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        MemoryStore { shared: Arc::clone(&self.shared) }
    }
}

impl<K> MemoryStore<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// A store whose expiry checks read `time`. Tests pass the same manual
    /// source the rest of the pipeline uses.
    pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
        MemoryStore {
            shared: Arc::new(Shared {
                rows: Mutex::new(HashMap::new()),
                stamp: AtomicU64::new(0),
                time,
            }),
        }
    }

    /// Lock-based transaction front.
    pub fn locking(&self) -> LockingStore<K> {
        LockingStore { shared: Arc::clone(&self.shared) }
    }

    /// Compare-and-swap transaction front.
    pub fn compare_and_swap(&self) -> CasStore<K> {
        CasStore { shared: Arc::clone(&self.shared) }
    }

    /// Unexpired state bytes for `key`, exactly as persisted.
    pub fn raw_bytes(&self, key: &K) -> Option<Vec<u8>> {
        let rows = self.shared.rows.lock().unwrap();
        rows.get(key).and_then(|row| self.shared.live_bytes(row))
    }

    /// Number of materialized rows, claimed-but-empty ones included.
    pub fn row_count(&self) -> usize {
        self.shared.rows.lock().unwrap().len()
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for a row lock, bounded by the caller's timeout slice. The clone
/// keeps the `Arc` available for identity checks after acquisition.
async fn acquire(lock: &RowLock, timeout: Option<Duration>) -> Result<OwnedMutexGuard<()>, Error> {
    match timeout {
        None => Ok(Arc::clone(lock).lock_owned().await),
        Some(slice) => tokio::time::timeout(slice, Arc::clone(lock).lock_owned())
            .await
            .map_err(|_| Error::Timeout { elapsed: slice, budget: slice }),
    }
}

/// Lock-based front over a [`MemoryStore`].
pub struct LockingStore<K> {
    shared: Arc<Shared<K>>,
}

#[async_trait]
impl<K> RemoteStore<K> for LockingStore<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    type Tx = LockingTransaction<K>;

    async fn begin_transaction(
        &self,
        key: &K,
        _timeout: Option<Duration>,
    ) -> Result<Self::Tx, Error> {
        Ok(LockingTransaction {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            held: None,
            staged: None,
        })
    }

    /// Deletes like any other writer: waits for the row's exclusive lock,
    /// so an open transaction commits or rolls back before its row goes.
    async fn remove(&self, key: &K, timeout: Option<Duration>) -> Result<(), Error> {
        loop {
            let lock = {
                let rows = self.shared.rows.lock().unwrap();
                match rows.get(key) {
                    None => return Ok(()),
                    Some(row) => Arc::clone(&row.lock),
                }
            };

            let _guard = acquire(&lock, timeout).await?;

            let mut rows = self.shared.rows.lock().unwrap();
            let unchanged = match rows.get(key) {
                None => return Ok(()),
                Some(row) => Arc::ptr_eq(&row.lock, &lock),
            };
            if unchanged {
                rows.remove(key);
                return Ok(());
            }
            // Removed and re-claimed while we waited; the key now fronts a
            // different lock, so start over on that one.
        }
    }
}

/// Holds the row's mutex from `lock_and_get` until commit or rollback;
/// the staged write becomes visible only at commit.
pub struct LockingTransaction<K> {
    shared: Arc<Shared<K>>,
    key: K,
    held: Option<(RowLock, OwnedMutexGuard<()>)>,
    staged: Option<(Vec<u8>, Option<u64>)>,
}

impl<K> LockingTransaction<K> {
    /// True when `lock` is the very mutex this transaction is holding.
    fn holds(&self, lock: &RowLock) -> bool {
        self.held.as_ref().is_some_and(|(held, _)| Arc::ptr_eq(held, lock))
    }
}

#[async_trait]
impl<K> StoreTransaction for LockingTransaction<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    async fn lock_and_get(&mut self, timeout: Option<Duration>) -> Result<LockedRow, Error> {
        loop {
            let lock = {
                let rows = self.shared.rows.lock().unwrap();
                match rows.get(&self.key) {
                    // A missing row cannot be locked; the caller must claim it.
                    None => return Ok(LockedRow::Absent),
                    Some(row) => Arc::clone(&row.lock),
                }
            };

            let guard = acquire(&lock, timeout).await?;

            // The row may have changed hands while we waited: only a lock
            // that still fronts the key counts as held.
            let row = {
                let rows = self.shared.rows.lock().unwrap();
                match rows.get(&self.key) {
                    None => Some(LockedRow::Absent),
                    Some(row) if Arc::ptr_eq(&row.lock, &lock) => {
                        match self.shared.live_bytes(row) {
                            Some(bytes) => Some(LockedRow::Present(bytes)),
                            None => Some(LockedRow::Uninitialized),
                        }
                    }
                    // Removed and re-claimed; wait on the new incarnation.
                    Some(_) => None,
                }
            };

            match row {
                Some(LockedRow::Absent) => return Ok(LockedRow::Absent),
                Some(row) => {
                    self.held = Some((lock, guard));
                    return Ok(row);
                }
                None => {}
            }
        }
    }

    async fn try_insert_empty(&mut self, _timeout: Option<Duration>) -> Result<bool, Error> {
        let mut rows = self.shared.rows.lock().unwrap();
        if rows.contains_key(&self.key) {
            return Ok(false);
        }
        let stamp = self.shared.next_stamp();
        rows.insert(self.key.clone(), Row::empty(stamp));
        Ok(true)
    }

    async fn update(
        &mut self,
        write: StateWrite<'_>,
        _timeout: Option<Duration>,
    ) -> Result<UpdateOutcome, Error> {
        if self.held.is_none() {
            return Err(Error::storage(MemoryStoreError::UpdateBeforeLock));
        }
        self.staged = Some((write.bytes.to_vec(), write.ttl_nanos));
        Ok(UpdateOutcome::Applied)
    }

    async fn commit(&mut self, _timeout: Option<Duration>) -> Result<(), Error> {
        if let Some((bytes, ttl_nanos)) = self.staged.take() {
            let expires_at_nanos =
                ttl_nanos.map(|ttl| self.shared.time.now_nanos().saturating_add(ttl));
            let stamp = self.shared.next_stamp();
            let mut rows = self.shared.rows.lock().unwrap();
            match rows.get_mut(&self.key) {
                Some(row) if self.holds(&row.lock) => {
                    row.bytes = Some(bytes);
                    row.version = stamp;
                    row.expires_at_nanos = expires_at_nanos;
                }
                // The row this write was derived from is gone; writing it
                // back would resurrect state a removal already discarded.
                _ => {}
            }
        }
        self.held = None;
        Ok(())
    }

    async fn rollback(&mut self, _timeout: Option<Duration>) -> Result<(), Error> {
        self.staged = None;
        self.held = None;
        Ok(())
    }
}

/// Compare-and-swap front over a [`MemoryStore`].
pub struct CasStore<K> {
    shared: Arc<Shared<K>>,
}

#[async_trait]
impl<K> RemoteStore<K> for CasStore<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    type Tx = CasTransaction<K>;

    async fn begin_transaction(
        &self,
        key: &K,
        _timeout: Option<Duration>,
    ) -> Result<Self::Tx, Error> {
        Ok(CasTransaction {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            observed: None,
        })
    }

    async fn remove(&self, key: &K, _timeout: Option<Duration>) -> Result<(), Error> {
        // No need to wait for anyone: stamps are store-global, so a writer
        // that read the old row fails its version check even if the key is
        // re-created in between.
        self.shared.rows.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    NoRow,
    Version(u64),
}

/// Optimistic transaction: a plain read records the version stamp, the
/// write succeeds only if the stamp is still current. Commit and rollback
/// are no-ops because the conditional write already decided the outcome.
pub struct CasTransaction<K> {
    shared: Arc<Shared<K>>,
    key: K,
    observed: Option<Observed>,
}

#[async_trait]
impl<K> StoreTransaction for CasTransaction<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    async fn lock_and_get(&mut self, _timeout: Option<Duration>) -> Result<LockedRow, Error> {
        let rows = self.shared.rows.lock().unwrap();
        match rows.get(&self.key) {
            None => {
                self.observed = Some(Observed::NoRow);
                Ok(LockedRow::Uninitialized)
            }
            Some(row) => {
                self.observed = Some(Observed::Version(row.version));
                match self.shared.live_bytes(row) {
                    Some(bytes) => Ok(LockedRow::Present(bytes)),
                    None => Ok(LockedRow::Uninitialized),
                }
            }
        }
    }

    async fn try_insert_empty(&mut self, _timeout: Option<Duration>) -> Result<bool, Error> {
        // Creation rides the conditional write; there is nothing to claim.
        Ok(true)
    }

    async fn update(
        &mut self,
        write: StateWrite<'_>,
        _timeout: Option<Duration>,
    ) -> Result<UpdateOutcome, Error> {
        let observed = self
            .observed
            .ok_or_else(|| Error::storage(MemoryStoreError::UpdateBeforeRead))?;
        let expires_at_nanos = write
            .ttl_nanos
            .map(|ttl| self.shared.time.now_nanos().saturating_add(ttl));
        let stamp = self.shared.next_stamp();

        let mut rows = self.shared.rows.lock().unwrap();
        match (rows.get_mut(&self.key), observed) {
            (None, Observed::NoRow) => {
                let mut row = Row::empty(stamp);
                row.bytes = Some(write.bytes.to_vec());
                row.expires_at_nanos = expires_at_nanos;
                rows.insert(self.key.clone(), row);
                Ok(UpdateOutcome::Applied)
            }
            (Some(row), Observed::Version(version)) if row.version == version => {
                row.bytes = Some(write.bytes.to_vec());
                row.version = stamp;
                row.expires_at_nanos = expires_at_nanos;
                Ok(UpdateOutcome::Applied)
            }
            _ => Ok(UpdateOutcome::Conflict),
        }
    }

    async fn commit(&mut self, _timeout: Option<Duration>) -> Result<(), Error> {
        Ok(())
    }

    async fn rollback(&mut self, _timeout: Option<Duration>) -> Result<(), Error> {
        Ok(())
    }
}
