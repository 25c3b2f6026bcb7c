//! Synchronization decorators over the command executor.
//!
//! Each decorator implements [`CommandExecutor`] and wraps another one, so
//! strategies compose like middleware. They optimize transport count only;
//! the semantics of every command are fixed by
//! [`Command::apply`](crate::command::Command::apply) and must come out
//! identical with or without decoration.

pub mod batching;
pub mod skip_on_zero;

pub use batching::BatchingExecutor;
pub use skip_on_zero::SkipOnZeroExecutor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::executor::CommandExecutor;
use crate::time::TimeSource;

/// Observability hook for the synchronization layer.
///
/// Called on the hot path; implementations must return quickly and must
/// not fail. Default methods ignore everything so listeners implement only
/// what they watch.
pub trait SynchronizationListener: Send + Sync {
    /// `count` commands were merged into one remote round trip.
    fn on_merge(&self, count: usize) {
        let _ = count;
    }

    /// `count` commands were answered locally without a round trip.
    fn on_skip(&self, count: usize) {
        let _ = count;
    }
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopSynchronizationListener;

impl SynchronizationListener for NopSynchronizationListener {}

/// Listener accumulating merge and skip totals.
#[derive(Debug, Default)]
pub struct CountingSynchronizationListener {
    merged: AtomicU64,
    skipped: AtomicU64,
}

impl CountingSynchronizationListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total commands merged into composite round trips.
    pub fn merged(&self) -> u64 {
        self.merged.load(Ordering::Relaxed)
    }

    /// Total commands answered locally.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl SynchronizationListener for CountingSynchronizationListener {
    fn on_merge(&self, count: usize) {
        self.merged.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn on_skip(&self, count: usize) {
        self.skipped.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Per-bucket synchronization strategy, chosen at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Synchronization {
    /// Every command performs its own round trip.
    #[default]
    None,
    /// Concurrent commands against the bucket merge into composite round
    /// trips while one is already in flight.
    Batching,
    /// Batching, plus local rejection of consumption while the bucket is
    /// known to be empty.
    SkipOnZero,
}

impl Synchronization {
    /// Wraps `executor` according to the strategy. Skip-on-zero sits inside
    /// batching so composite commands also benefit from local rejection.
    pub(crate) fn decorate(
        self,
        executor: Arc<dyn CommandExecutor>,
        listener: Arc<dyn SynchronizationListener>,
        time: Arc<dyn TimeSource>,
    ) -> Arc<dyn CommandExecutor> {
        match self {
            Synchronization::None => executor,
            Synchronization::Batching => {
                Arc::new(BatchingExecutor::new(executor, listener))
            }
            Synchronization::SkipOnZero => {
                let skip =
                    Arc::new(SkipOnZeroExecutor::new(executor, listener.clone(), time));
                Arc::new(BatchingExecutor::new(skip, listener))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_listener_accumulates() {
        let listener = CountingSynchronizationListener::new();
        listener.on_merge(3);
        listener.on_merge(2);
        listener.on_skip(7);
        assert_eq!(listener.merged(), 5);
        assert_eq!(listener.skipped(), 7);
    }

    #[test]
    fn nop_listener_is_callable() {
        NopSynchronizationListener.on_merge(1);
        NopSynchronizationListener.on_skip(1);
    }
}
