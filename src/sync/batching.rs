//! Merges concurrent commands against one bucket into composite round trips.
//!
//! The first command to arrive while no round trip is in flight becomes the
//! leader and executes alone. Commands arriving during that flight queue up;
//! when the flight completes, the whole queue ships as one
//! [`Command::Batch`] and each waiter receives its own slot of the composite
//! outcome. Ordering within the batch is submission order, so two consumes
//! queued behind a reset observe the bucket the same way they would have
//! without merging.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::command::{Command, CommandResult, Outcome};
use crate::error::Error;
use crate::executor::CommandExecutor;
use crate::sync::SynchronizationListener;

/// A merged request was dropped before its round trip produced a response.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("merged command dropped before a response was produced")]
struct BatchAbandoned;

type Reply = oneshot::Sender<Result<CommandResult, Error>>;

struct FlightState {
    in_flight: bool,
    queue: Vec<(Command, Reply)>,
}

/// Executor decorator that amortizes round trips across concurrent callers.
///
/// Merging is purely a transport optimization: every queued command still
/// runs through [`Command::apply`] on the backend, inside the same
/// transaction as its batch mates.
pub struct BatchingExecutor {
    inner: Arc<dyn CommandExecutor>,
    listener: Arc<dyn SynchronizationListener>,
    flight: Arc<Mutex<FlightState>>,
}

impl BatchingExecutor {
    pub fn new(
        inner: Arc<dyn CommandExecutor>,
        listener: Arc<dyn SynchronizationListener>,
    ) -> Self {
        BatchingExecutor {
            inner,
            listener,
            flight: Arc::new(Mutex::new(FlightState { in_flight: false, queue: Vec::new() })),
        }
    }
}

enum Role {
    Leader(Command),
    Waiter(oneshot::Receiver<Result<CommandResult, Error>>),
}

#[async_trait]
impl CommandExecutor for BatchingExecutor {
    async fn execute(&self, command: Command) -> Result<CommandResult, Error> {
        let role = {
            let mut flight = self.flight.lock().unwrap();
            if flight.in_flight {
                let (tx, rx) = oneshot::channel();
                flight.queue.push((command, tx));
                Role::Waiter(rx)
            } else {
                flight.in_flight = true;
                Role::Leader(command)
            }
        };

        match role {
            Role::Leader(command) => {
                let _handoff = FlightHandoff {
                    inner: Arc::clone(&self.inner),
                    listener: Arc::clone(&self.listener),
                    flight: Arc::clone(&self.flight),
                };
                self.inner.execute(command).await
            }
            Role::Waiter(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::storage(BatchAbandoned)),
            },
        }
    }
}

/// Ends the leader's flight when its future completes or is dropped.
///
/// Without this, a cancelled leader would leave `in_flight` set forever and
/// every later command would queue behind a flight that no longer exists.
struct FlightHandoff {
    inner: Arc<dyn CommandExecutor>,
    listener: Arc<dyn SynchronizationListener>,
    flight: Arc<Mutex<FlightState>>,
}

impl Drop for FlightHandoff {
    fn drop(&mut self) {
        let batch = {
            let mut flight = self.flight.lock().unwrap();
            if flight.queue.is_empty() {
                flight.in_flight = false;
                return;
            }
            std::mem::take(&mut flight.queue)
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                let listener = Arc::clone(&self.listener);
                let flight = Arc::clone(&self.flight);
                handle.spawn(async move {
                    drain(inner, listener, flight, batch).await;
                });
            }
            Err(_) => {
                warn!("no runtime to drain queued commands, failing the waiters");
                self.flight.lock().unwrap().in_flight = false;
                // dropping the replies wakes every waiter with an error
            }
        }
    }
}

/// Ships queued commands until the queue stays empty, then clears the
/// in-flight flag so the next arrival leads again.
async fn drain(
    inner: Arc<dyn CommandExecutor>,
    listener: Arc<dyn SynchronizationListener>,
    flight: Arc<Mutex<FlightState>>,
    mut batch: Vec<(Command, Reply)>,
) {
    loop {
        run_batch(inner.as_ref(), listener.as_ref(), batch).await;
        batch = {
            let mut guard = flight.lock().unwrap();
            if guard.queue.is_empty() {
                guard.in_flight = false;
                return;
            }
            std::mem::take(&mut guard.queue)
        };
    }
}

async fn run_batch(
    inner: &dyn CommandExecutor,
    listener: &dyn SynchronizationListener,
    mut batch: Vec<(Command, Reply)>,
) {
    if batch.len() == 1 {
        if let Some((command, reply)) = batch.pop() {
            let _ = reply.send(inner.execute(command).await);
        }
        return;
    }

    listener.on_merge(batch.len());
    debug!(merged = batch.len(), "merging queued commands into one round trip");
    let (commands, replies): (Vec<Command>, Vec<Reply>) = batch.into_iter().unzip();
    match inner.execute(Command::Batch { commands }).await {
        Ok(result) => fan_out(result, replies),
        Err(err) => {
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}

/// Distributes the i-th slot of a composite outcome to the i-th waiter.
/// Every waiter sees the same post-batch snapshot.
fn fan_out(result: CommandResult, replies: Vec<Reply>) {
    match result.outcome {
        Outcome::Batch(outcomes) if outcomes.len() == replies.len() => {
            for (outcome, reply) in outcomes.into_iter().zip(replies) {
                let _ = reply.send(Ok(CommandResult {
                    outcome,
                    snapshot: result.snapshot.clone(),
                    time_nanos: result.time_nanos,
                }));
            }
        }
        other => {
            warn!(outcome = ?other, "composite response does not match the submitted batch");
            let err = Error::codec("composite response does not match the submitted batch");
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CountingSynchronizationListener;
    use tokio::sync::Semaphore;
    use tokio::task::yield_now;

    /// Records every command and waits for a permit before answering, so
    /// tests control exactly when a flight completes.
    struct GatedExecutor {
        calls: Mutex<Vec<Command>>,
        gate: Semaphore,
        fail_batches: bool,
    }

    impl GatedExecutor {
        fn new() -> Self {
            GatedExecutor { calls: Mutex::new(Vec::new()), gate: Semaphore::new(0), fail_batches: false }
        }

        fn calls(&self) -> Vec<Command> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for GatedExecutor {
        async fn execute(&self, command: Command) -> Result<CommandResult, Error> {
            self.calls.lock().unwrap().push(command.clone());
            let permit = self.gate.acquire().await.map_err(Error::storage)?;
            permit.forget();
            match command {
                Command::Batch { commands } => {
                    if self.fail_batches {
                        return Err(Error::Contention { retries: 3 });
                    }
                    let outcomes =
                        commands.iter().map(|_| Outcome::Consumed(true)).collect();
                    Ok(CommandResult { outcome: Outcome::Batch(outcomes), snapshot: None, time_nanos: 7 })
                }
                _ => Ok(CommandResult { outcome: Outcome::Consumed(true), snapshot: None, time_nanos: 7 }),
            }
        }
    }

    async fn wait_for_calls(executor: &GatedExecutor, count: usize) {
        for _ in 0..1000 {
            if executor.calls.lock().unwrap().len() >= count {
                return;
            }
            yield_now().await;
        }
        panic!("executor never reached {count} calls");
    }

    async fn wait_until(probe: impl Fn() -> bool) {
        for _ in 0..1000 {
            if probe() {
                return;
            }
            yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn commands_during_flight_merge_into_one_batch() {
        let gated = Arc::new(GatedExecutor::new());
        let listener = Arc::new(CountingSynchronizationListener::new());
        let batching = Arc::new(BatchingExecutor::new(
            gated.clone() as Arc<dyn CommandExecutor>,
            listener.clone(),
        ));

        let leader = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::TryConsume { tokens: 1 }).await }
        });
        wait_for_calls(&gated, 1).await;

        let mut waiters = Vec::new();
        for tokens in 2..=4 {
            let batching = batching.clone();
            waiters.push(tokio::spawn(async move {
                batching.execute(Command::TryConsume { tokens }).await
            }));
        }
        wait_until(|| batching.flight.lock().unwrap().queue.len() == 3).await;

        // leader completes, then the drained batch completes
        gated.gate.add_permits(1);
        assert!(leader.await.unwrap().is_ok());
        wait_for_calls(&gated, 2).await;
        gated.gate.add_permits(1);
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }

        let calls = gated.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Command::TryConsume { tokens: 1 });
        match &calls[1] {
            Command::Batch { commands } => {
                assert_eq!(
                    commands,
                    &vec![
                        Command::TryConsume { tokens: 2 },
                        Command::TryConsume { tokens: 3 },
                        Command::TryConsume { tokens: 4 },
                    ]
                );
            }
            other => panic!("expected a composite command, got {other:?}"),
        }
        assert_eq!(listener.merged(), 3);
    }

    #[tokio::test]
    async fn single_queued_command_is_not_wrapped() {
        let gated = Arc::new(GatedExecutor::new());
        let listener = Arc::new(CountingSynchronizationListener::new());
        let batching = Arc::new(BatchingExecutor::new(
            gated.clone() as Arc<dyn CommandExecutor>,
            listener.clone(),
        ));

        let leader = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::AvailableTokens).await }
        });
        wait_for_calls(&gated, 1).await;
        let follower = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::Reset).await }
        });
        wait_until(|| batching.flight.lock().unwrap().queue.len() == 1).await;

        gated.gate.add_permits(2);
        leader.await.unwrap().unwrap();
        follower.await.unwrap().unwrap();

        let calls = gated.calls();
        assert_eq!(calls, vec![Command::AvailableTokens, Command::Reset]);
        assert_eq!(listener.merged(), 0);
    }

    #[tokio::test]
    async fn composite_failure_reaches_every_waiter() {
        let mut inner = GatedExecutor::new();
        inner.fail_batches = true;
        let gated = Arc::new(inner);
        let listener = Arc::new(CountingSynchronizationListener::new());
        let batching = Arc::new(BatchingExecutor::new(
            gated.clone() as Arc<dyn CommandExecutor>,
            listener,
        ));

        let leader = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::TryConsume { tokens: 1 }).await }
        });
        wait_for_calls(&gated, 1).await;
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let batching = batching.clone();
            waiters.push(tokio::spawn(async move {
                batching.execute(Command::TryConsume { tokens: 1 }).await
            }));
        }
        wait_until(|| batching.flight.lock().unwrap().queue.len() == 2).await;

        gated.gate.add_permits(2);
        assert!(leader.await.unwrap().is_ok());
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(err.is_contention());
        }
    }

    #[tokio::test]
    async fn flight_clears_after_drain() {
        let gated = Arc::new(GatedExecutor::new());
        let listener = Arc::new(CountingSynchronizationListener::new());
        let batching = Arc::new(BatchingExecutor::new(
            gated.clone() as Arc<dyn CommandExecutor>,
            listener,
        ));

        gated.gate.add_permits(1);
        batching.execute(Command::TryConsume { tokens: 1 }).await.unwrap();
        assert!(!batching.flight.lock().unwrap().in_flight);

        // the next command leads again rather than queueing
        gated.gate.add_permits(1);
        batching.execute(Command::TryConsume { tokens: 1 }).await.unwrap();
        assert_eq!(gated.calls().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_leader_hands_the_flight_over() {
        let gated = Arc::new(GatedExecutor::new());
        let listener = Arc::new(CountingSynchronizationListener::new());
        let batching = Arc::new(BatchingExecutor::new(
            gated.clone() as Arc<dyn CommandExecutor>,
            listener,
        ));

        let leader = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::TryConsume { tokens: 1 }).await }
        });
        wait_for_calls(&gated, 1).await;
        let waiter = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::TryConsume { tokens: 2 }).await }
        });
        wait_until(|| batching.flight.lock().unwrap().queue.len() == 1).await;

        leader.abort();
        let _ = leader.await;

        // the queued command still runs, via the handoff drain
        gated.gate.add_permits(1);
        waiter.await.unwrap().unwrap();
        wait_until(|| !batching.flight.lock().unwrap().in_flight).await;
    }

    #[tokio::test]
    async fn waiter_sees_batch_snapshot_and_time() {
        let gated = Arc::new(GatedExecutor::new());
        let listener = Arc::new(CountingSynchronizationListener::new());
        let batching = Arc::new(BatchingExecutor::new(
            gated.clone() as Arc<dyn CommandExecutor>,
            listener,
        ));

        let leader = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::TryConsume { tokens: 1 }).await }
        });
        wait_for_calls(&gated, 1).await;
        let a = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::TryConsume { tokens: 1 }).await }
        });
        let b = tokio::spawn({
            let batching = batching.clone();
            async move { batching.execute(Command::TryConsume { tokens: 1 }).await }
        });
        wait_until(|| batching.flight.lock().unwrap().queue.len() == 2).await;

        gated.gate.add_permits(2);
        leader.await.unwrap().unwrap();
        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        assert_eq!(first.outcome, Outcome::Consumed(true));
        assert_eq!(first.time_nanos, 7);
        assert_eq!(second.time_nanos, 7);
    }

    #[test]
    fn abandoned_error_is_storage_flavored() {
        let err = Error::storage(BatchAbandoned);
        assert!(err.is_storage_related());
    }
}
