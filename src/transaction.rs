//! The transaction contract every remote store implements.
//!
//! Two families of stores sit behind one trait. Lock-based stores take an
//! exclusive row lock in [`StoreTransaction::lock_and_get`] and write
//! unconditionally; compare-and-swap stores read a version token there and
//! write conditionally, reporting [`UpdateOutcome::Conflict`] when the token
//! went stale. The driver in [`backend`](crate::backend) runs the same
//! protocol over both and never needs to know which family it holds.
//!
//! Dropping a transaction releases whatever it acquired (connection, row
//! lock); `commit`/`rollback` finish the unit of work first. Uncommitted
//! work must vanish on drop.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::state::RemoteState;

/// Result of locking and reading one key's row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockedRow {
    /// State bytes exist and this transaction covers them.
    Present(Vec<u8>),
    /// The row is covered but holds no state yet; the next update creates
    /// the state. Compare-and-swap stores also report a missing row this
    /// way, since their conditional write can create it.
    Uninitialized,
    /// No row exists and the locking strategy cannot lock a missing row.
    /// The caller claims the key with [`StoreTransaction::try_insert_empty`]
    /// and retries with a fresh transaction.
    Absent,
}

/// Result of writing new state bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Another writer committed since the read; retry from the read step.
    Conflict,
}

/// A write about to land: the serialized bytes, the typed state they
/// encode (stores may index or inspect it), and the TTL for the row.
#[derive(Debug, Clone, Copy)]
pub struct StateWrite<'a> {
    pub bytes: &'a [u8],
    pub state: &'a RemoteState,
    pub ttl_nanos: Option<u64>,
}

/// One unit of atomic work against a single key.
///
/// Every step takes the remaining slice of the caller's deadline; a store
/// that can block (lock acquisition, network wait) must give up when the
/// slice runs out rather than wait indefinitely.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Reads the current row under the strategy's concurrency control.
    async fn lock_and_get(&mut self, timeout: Option<Duration>) -> Result<LockedRow, Error>;

    /// Idempotent claim of a missing row so a locking strategy has
    /// something to lock. Returns whether this call created it; `false`
    /// means a concurrent claim won, which is just as good.
    async fn try_insert_empty(&mut self, timeout: Option<Duration>) -> Result<bool, Error>;

    /// Writes new state bytes under the protection established by
    /// [`lock_and_get`](Self::lock_and_get).
    async fn update(
        &mut self,
        write: StateWrite<'_>,
        timeout: Option<Duration>,
    ) -> Result<UpdateOutcome, Error>;

    /// Makes the work visible.
    async fn commit(&mut self, timeout: Option<Duration>) -> Result<(), Error>;

    /// Discards the work. Must be safe to call at any point.
    async fn rollback(&mut self, timeout: Option<Duration>) -> Result<(), Error>;
}

/// Remaining-time view over one request's optional budget.
///
/// [`Deadline::remaining`] yields the slice to hand the next transactional
/// step, or [`Error::Timeout`] once the budget is spent, which forces the
/// caller onto its rollback path.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn start(budget: Option<Duration>) -> Self {
        Deadline { started: Instant::now(), budget }
    }

    pub fn remaining(&self) -> Result<Option<Duration>, Error> {
        match self.budget {
            None => Ok(None),
            Some(budget) => {
                let elapsed = self.started.elapsed();
                if elapsed >= budget {
                    Err(Error::Timeout { elapsed, budget })
                } else {
                    Ok(Some(budget - elapsed))
                }
            }
        }
    }
}
