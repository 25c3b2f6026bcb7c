//! Answers doomed consumption attempts locally while the bucket is empty.
//!
//! The decorator keeps a shadow of the last authoritative state it saw in a
//! response. A consuming command is replayed against a refilled copy of that
//! shadow first; when the replay comes out as a pure rejection (nothing
//! would have been written), the rejection is returned without a round trip.
//! Anything that might grant, write, or read fresh data falls through to the
//! wrapped executor, and every response it produces refreshes the shadow.
//!
//! The shadow accounts for time-based refill during replay, so the only
//! blind spot is external mutation (credits or re-creation by another
//! process), which can briefly reject requests a round trip would have
//! granted. The decorator never grants locally, so it never over-admits.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::trace;

use crate::command::{Command, CommandResult, Outcome, StateCell};
use crate::error::Error;
use crate::executor::CommandExecutor;
use crate::state::{RemoteState, NEVER};
use crate::sync::SynchronizationListener;
use crate::time::TimeSource;

#[derive(Debug, Clone)]
struct Shadow {
    state: RemoteState,
    observed_at_nanos: u64,
}

/// Executor decorator that predicts rejections from the last observed state.
pub struct SkipOnZeroExecutor {
    inner: Arc<dyn CommandExecutor>,
    listener: Arc<dyn SynchronizationListener>,
    time: Arc<dyn TimeSource>,
    shadow: ArcSwapOption<Shadow>,
}

impl SkipOnZeroExecutor {
    pub fn new(
        inner: Arc<dyn CommandExecutor>,
        listener: Arc<dyn SynchronizationListener>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        SkipOnZeroExecutor { inner, listener, time, shadow: ArcSwapOption::empty() }
    }

    /// Replays `command` against the shadow and returns a local result when
    /// the replay is a pure rejection. `None` means a round trip is needed.
    fn reject_locally(&self, command: &Command) -> Option<CommandResult> {
        if command.estimated_demand() == 0 {
            return None;
        }
        let shadow = self.shadow.load_full()?;
        // never replay on a clock older than the observation itself
        let now = self.time.now_nanos().max(shadow.observed_at_nanos);
        let mut cell = StateCell::new(Some(shadow.state.clone()));
        let outcome = command.apply(&mut cell, now);
        if cell.modified() || !is_pure_rejection(&outcome) {
            return None;
        }
        let skipped = rejected_count(&outcome);
        self.listener.on_skip(skipped);
        trace!(skipped, "rejected locally against the shadow state");
        Some(CommandResult {
            outcome,
            snapshot: Some(shadow.state.clone()),
            time_nanos: now,
        })
    }

    fn refresh(&self, result: &CommandResult) {
        match &result.snapshot {
            Some(state) => self.shadow.store(Some(Arc::new(Shadow {
                state: state.clone(),
                observed_at_nanos: result.time_nanos,
            }))),
            // the bucket does not exist remotely, stop predicting
            None => self.shadow.store(None),
        }
    }
}

#[async_trait]
impl CommandExecutor for SkipOnZeroExecutor {
    async fn execute(&self, command: Command) -> Result<CommandResult, Error> {
        if let Some(result) = self.reject_locally(&command) {
            return Ok(result);
        }
        let result = self.inner.execute(command).await?;
        self.refresh(&result);
        Ok(result)
    }
}

/// True when the outcome reports a refusal that wrote nothing.
fn is_pure_rejection(outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Consumed(consumed) => !consumed,
        Outcome::Probe(probe) => !probe.consumed,
        Outcome::Tokens(taken) => *taken == 0,
        Outcome::Wait(wait) => *wait == NEVER,
        Outcome::Batch(outcomes) => {
            !outcomes.is_empty() && outcomes.iter().all(is_pure_rejection)
        }
        _ => false,
    }
}

fn rejected_count(outcome: &Outcome) -> usize {
    match outcome {
        Outcome::Batch(outcomes) => outcomes.iter().map(rejected_count).sum(),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{LockingStore, MemoryStore};
    use crate::backend::{Backend, TransactionalBackend};
    use crate::command::ConsumptionProbe;
    use crate::config::{Bandwidth, BucketConfig};
    use crate::executor::{BackendExecutor, ClientConfig};
    use crate::sync::CountingSynchronizationListener;
    use crate::time::ManualTimeSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SECOND: u64 = 1_000_000_000;

    struct CountingExecutor {
        inner: BackendExecutor<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandExecutor for CountingExecutor {
        async fn execute(&self, command: Command) -> Result<CommandResult, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(command).await
        }
    }

    struct Rig {
        skip: SkipOnZeroExecutor,
        counting: Arc<CountingExecutor>,
        backend: Arc<TransactionalBackend<LockingStore<String>>>,
        clock: ManualTimeSource,
        listener: Arc<CountingSynchronizationListener>,
    }

    impl Rig {
        fn remote_calls(&self) -> usize {
            self.counting.calls.load(Ordering::SeqCst)
        }
    }

    fn rig() -> Rig {
        let clock = ManualTimeSource::new(0);
        let store: MemoryStore<String> =
            MemoryStore::with_time_source(Arc::new(clock.clone()));
        let backend = Arc::new(
            TransactionalBackend::new(store.locking())
                .with_time_source(Arc::new(clock.clone())),
        );
        let direct = BackendExecutor::new(
            backend.clone() as Arc<dyn Backend<String>>,
            "tenant-1".to_string(),
            ClientConfig {
                client_time: Some(Arc::new(clock.clone())),
                ..ClientConfig::default()
            },
        );
        let counting = Arc::new(CountingExecutor { inner: direct, calls: AtomicUsize::new(0) });
        let listener = Arc::new(CountingSynchronizationListener::new());
        let skip = SkipOnZeroExecutor::new(
            counting.clone() as Arc<dyn CommandExecutor>,
            listener.clone(),
            Arc::new(clock.clone()),
        );
        Rig { skip, counting, backend, clock, listener }
    }

    fn two_per_second() -> BucketConfig {
        BucketConfig::builder()
            .add_bandwidth(Bandwidth::simple(2, Duration::from_secs(1)).unwrap())
            .build()
            .unwrap()
    }

    /// Creates the bucket and drains it, leaving the shadow at zero tokens.
    async fn drain(rig: &Rig) {
        let created = rig
            .skip
            .execute(Command::CreateIfAbsent {
                config: two_per_second(),
                version: 1,
                inner: Box::new(Command::TryConsume { tokens: 2 }),
            })
            .await
            .unwrap();
        assert_eq!(created.outcome, Outcome::Consumed(true));
    }

    #[tokio::test]
    async fn empty_bucket_rejections_stay_local() {
        let rig = rig();
        drain(&rig).await;
        assert_eq!(rig.remote_calls(), 1);

        for _ in 0..5 {
            let result =
                rig.skip.execute(Command::TryConsume { tokens: 1 }).await.unwrap();
            assert_eq!(result.outcome, Outcome::Consumed(false));
        }
        assert_eq!(rig.remote_calls(), 1);
        assert_eq!(rig.listener.skipped(), 5);
    }

    #[tokio::test]
    async fn refilled_shadow_falls_through_and_grants() {
        let rig = rig();
        drain(&rig).await;

        rig.clock.advance(Duration::from_secs(1));
        let result = rig.skip.execute(Command::TryConsume { tokens: 1 }).await.unwrap();
        assert_eq!(result.outcome, Outcome::Consumed(true));
        assert_eq!(rig.remote_calls(), 2);
        assert_eq!(rig.listener.skipped(), 0);
    }

    #[tokio::test]
    async fn verbose_rejection_carries_shadow_wait_estimate() {
        let rig = rig();
        drain(&rig).await;

        let result = rig
            .skip
            .execute(Command::TryConsumeAndReturnRemaining { tokens: 1 })
            .await
            .unwrap();
        match result.outcome {
            Outcome::Probe(ConsumptionProbe { consumed, nanos_to_wait_for_refill, .. }) => {
                assert!(!consumed);
                assert_eq!(nanos_to_wait_for_refill, SECOND / 2);
            }
            other => panic!("expected a probe, got {other:?}"),
        }
        assert_eq!(rig.remote_calls(), 1);
    }

    #[tokio::test]
    async fn credits_fall_through_and_refresh_the_shadow() {
        let rig = rig();
        drain(&rig).await;

        rig.skip.execute(Command::AddTokens { tokens: 1 }).await.unwrap();
        assert_eq!(rig.remote_calls(), 2);

        // the refreshed shadow now predicts a grant, so this goes remote
        let result = rig.skip.execute(Command::TryConsume { tokens: 1 }).await.unwrap();
        assert_eq!(result.outcome, Outcome::Consumed(true));
        assert_eq!(rig.remote_calls(), 3);
        assert_eq!(rig.listener.skipped(), 0);
    }

    #[tokio::test]
    async fn batch_of_rejections_is_skipped_whole() {
        let rig = rig();
        drain(&rig).await;

        let result = rig
            .skip
            .execute(Command::Batch {
                commands: vec![
                    Command::TryConsume { tokens: 1 },
                    Command::TryConsumeAndReturnRemaining { tokens: 2 },
                ],
            })
            .await
            .unwrap();
        match result.outcome {
            Outcome::Batch(outcomes) => {
                assert_eq!(outcomes.len(), 2);
                assert_eq!(outcomes[0], Outcome::Consumed(false));
            }
            other => panic!("expected a composite outcome, got {other:?}"),
        }
        assert_eq!(rig.remote_calls(), 1);
        assert_eq!(rig.listener.skipped(), 2);
    }

    #[tokio::test]
    async fn batch_with_one_grantable_command_goes_remote() {
        let rig = rig();
        drain(&rig).await;

        rig.clock.advance(Duration::from_millis(500));
        // one token refilled, the first sub-command would succeed
        let result = rig
            .skip
            .execute(Command::Batch {
                commands: vec![
                    Command::TryConsume { tokens: 1 },
                    Command::TryConsume { tokens: 1 },
                ],
            })
            .await
            .unwrap();
        assert_eq!(
            result.outcome,
            Outcome::Batch(vec![Outcome::Consumed(true), Outcome::Consumed(false)])
        );
        assert_eq!(rig.remote_calls(), 2);
    }

    #[tokio::test]
    async fn impossible_reservation_is_rejected_locally() {
        let rig = rig();
        drain(&rig).await;

        let result = rig
            .skip
            .execute(Command::Reserve { tokens: 5, max_wait_nanos: 60 * SECOND })
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Wait(NEVER));
        assert_eq!(rig.remote_calls(), 1);
        assert_eq!(rig.listener.skipped(), 1);
    }

    #[tokio::test]
    async fn removed_bucket_clears_the_shadow() {
        let rig = rig();
        drain(&rig).await;

        rig.backend.remove(&"tenant-1".to_string()).await.unwrap();
        rig.clock.advance(Duration::from_secs(5));

        // the replay would grant, so the command goes remote and learns the
        // bucket is gone
        let result = rig.skip.execute(Command::TryConsume { tokens: 1 }).await.unwrap();
        assert_eq!(result.outcome, Outcome::NotFound);
        assert_eq!(result.snapshot, None);

        // with no shadow left, even a doomed command goes remote
        let result = rig.skip.execute(Command::TryConsume { tokens: 1 }).await.unwrap();
        assert_eq!(result.outcome, Outcome::NotFound);
        assert_eq!(rig.remote_calls(), 3);
    }
}
