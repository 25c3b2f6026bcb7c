//! Backend contract and the transactional driver shared by every store.
//!
//! [`RemoteStore`] is what a storage integration implements: allocate a
//! [`StoreTransaction`] for a key, delete a key. [`TransactionalBackend`]
//! turns any such store into a [`Backend`] by running the one execution
//! protocol: lock/read, apply the command, write back, commit, with the
//! claim dance for missing rows and bounded retries for conditional-write
//! conflicts. Correctness lives here once; stores only move bytes.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::command::{CommandResult, StateCell};
use crate::error::Error;
use crate::time::{SystemTimeSource, TimeSource};
use crate::transaction::{Deadline, LockedRow, StateWrite, StoreTransaction, UpdateOutcome};
use crate::wire::{decode_state, encode_state, Request};

/// Conditional-write retries before surfacing [`Error::Contention`].
pub const DEFAULT_RETRY_BUDGET: usize = 16;

/// A remote command-execution surface for buckets keyed by `K`.
#[async_trait]
pub trait Backend<K>: Send + Sync
where
    K: Send + Sync,
{
    /// Executes one request against `key`'s bucket.
    async fn execute(&self, key: &K, request: Request) -> Result<CommandResult, Error>;

    /// Deletes `key`'s state. Removing an absent key succeeds.
    async fn remove(&self, key: &K) -> Result<(), Error>;

    /// Adapts this backend to another key type through a total,
    /// deterministic mapping onto the native key.
    fn map_key<J, F>(self, map: F) -> MappedBackend<Self, F>
    where
        Self: Sized,
        J: Send + Sync,
        F: Fn(&J) -> K + Send + Sync,
    {
        MappedBackend { inner: self, map }
    }
}

/// A backend whose native key type is hidden behind a mapping function.
pub struct MappedBackend<B, F> {
    inner: B,
    map: F,
}

#[async_trait]
impl<J, K, B, F> Backend<J> for MappedBackend<B, F>
where
    J: Send + Sync,
    K: Send + Sync,
    B: Backend<K>,
    F: Fn(&J) -> K + Send + Sync,
{
    async fn execute(&self, key: &J, request: Request) -> Result<CommandResult, Error> {
        let native = (self.map)(key);
        self.inner.execute(&native, request).await
    }

    async fn remove(&self, key: &J) -> Result<(), Error> {
        let native = (self.map)(key);
        self.inner.remove(&native).await
    }
}

/// Store-side half of the contract, implemented once per storage system.
#[async_trait]
pub trait RemoteStore<K>: Send + Sync
where
    K: Send + Sync,
{
    type Tx: StoreTransaction;

    /// Allocates a transaction scoped to `key` (connection checkout, lock
    /// handle). Resources are released when the transaction drops.
    async fn begin_transaction(
        &self,
        key: &K,
        timeout: Option<Duration>,
    ) -> Result<Self::Tx, Error>;

    /// Deletes `key`'s row. Must be idempotent.
    async fn remove(&self, key: &K, timeout: Option<Duration>) -> Result<(), Error>;
}

/// Drives the execution protocol over any [`RemoteStore`].
pub struct TransactionalBackend<S> {
    store: S,
    time: Arc<dyn TimeSource>,
    retry_budget: usize,
    request_timeout: Option<Duration>,
}

impl<S> TransactionalBackend<S> {
    pub fn new(store: S) -> Self {
        TransactionalBackend {
            store,
            time: Arc::new(SystemTimeSource),
            retry_budget: DEFAULT_RETRY_BUDGET,
            request_timeout: None,
        }
    }

    /// Clock consulted when a request carries no client time.
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Conditional-write retries before giving up with
    /// [`Error::Contention`].
    pub fn with_retry_budget(mut self, budget: usize) -> Self {
        self.retry_budget = budget.max(1);
        self
    }

    /// Budget for one whole request; expiry rolls the transaction back and
    /// surfaces [`Error::Timeout`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

enum Attempt {
    Complete(CommandResult),
    /// A missing row was claimed; retry in a fresh transaction.
    Claimed,
    /// The conditional write lost; retry from the read.
    Conflicted,
}

#[async_trait]
impl<K, S> Backend<K> for TransactionalBackend<S>
where
    K: Send + Sync,
    S: RemoteStore<K>,
{
    async fn execute(&self, key: &K, request: Request) -> Result<CommandResult, Error> {
        let deadline = Deadline::start(self.request_timeout);
        // One clock reading per request: retries of the same request must
        // not observe different refill instants.
        let now_nanos = match request.client_time_nanos {
            Some(nanos) => nanos,
            None => self.time.now_nanos(),
        };

        let mut conflicts = 0usize;
        loop {
            let mut tx = self.store.begin_transaction(key, deadline.remaining()?).await?;
            match run_attempt(&mut tx, &request, now_nanos, &deadline).await {
                Ok(Attempt::Complete(result)) => return Ok(result),
                Ok(Attempt::Claimed) => {
                    debug!("claimed missing row, retrying read in a fresh transaction");
                }
                Ok(Attempt::Conflicted) => {
                    conflicts += 1;
                    if conflicts >= self.retry_budget {
                        return Err(Error::Contention { retries: conflicts });
                    }
                    debug!(conflicts, "conditional write lost, retrying from the read");
                }
                Err(err) => {
                    // Failed work must not leak: roll back before surfacing.
                    if let Err(rollback_err) = tx.rollback(None).await {
                        warn!(error = %rollback_err, "rollback after failed attempt also failed");
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn remove(&self, key: &K) -> Result<(), Error> {
        let deadline = Deadline::start(self.request_timeout);
        self.store.remove(key, deadline.remaining()?).await
    }
}

async fn run_attempt<T: StoreTransaction>(
    tx: &mut T,
    request: &Request,
    now_nanos: u64,
    deadline: &Deadline,
) -> Result<Attempt, Error> {
    let mut cell = match tx.lock_and_get(deadline.remaining()?).await? {
        LockedRow::Present(bytes) => StateCell::new(Some(decode_state(&bytes)?)),
        LockedRow::Uninitialized => StateCell::empty(),
        LockedRow::Absent => {
            if !request.command.initializes() {
                // nothing to read and nothing this command would create, so
                // answer without claiming a row
                let mut cell = StateCell::empty();
                let outcome = request.command.apply(&mut cell, now_nanos);
                tx.rollback(deadline.remaining()?).await?;
                return Ok(Attempt::Complete(CommandResult {
                    outcome,
                    snapshot: None,
                    time_nanos: now_nanos,
                }));
            }
            tx.try_insert_empty(deadline.remaining()?).await?;
            tx.commit(deadline.remaining()?).await?;
            return Ok(Attempt::Claimed);
        }
    };

    let outcome = request.command.apply(&mut cell, now_nanos);

    match (cell.modified(), cell.state()) {
        (true, Some(state)) => {
            let bytes = encode_state(state, request.version)?;
            let write = StateWrite {
                bytes: &bytes,
                state,
                ttl_nanos: request.expiration.map(|policy| policy.ttl_nanos(state, now_nanos)),
            };
            match tx.update(write, deadline.remaining()?).await? {
                UpdateOutcome::Applied => tx.commit(deadline.remaining()?).await?,
                UpdateOutcome::Conflict => {
                    tx.rollback(deadline.remaining()?).await?;
                    return Ok(Attempt::Conflicted);
                }
            }
        }
        // Reads and rejections commit without writing.
        _ => tx.commit(deadline.remaining()?).await?,
    }

    Ok(Attempt::Complete(CommandResult {
        outcome,
        snapshot: cell.into_state(),
        time_nanos: now_nanos,
    }))
}
