//! Per-key bucket handles and the manager that mints them.
//!
//! A [`ProxyManager`] owns a backend and hands out [`Bucket`] handles through
//! a builder. Handles are lazy: nothing is written remotely until the first
//! operation, at which point the configuration supplier is asked once and the
//! bucket is materialized with an insert-if-absent, so concurrent first
//! touches from several processes still agree on a single row.
//!
//! Implicit configuration replacement attaches a desired version to every
//! command the handle sends. Deployments roll a config change by bumping the
//! version: nodes still on the old version leave newer remote state alone,
//! nodes on the new version upgrade older state exactly once, applying the
//! chosen tokens-inheritance rule.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;

use crate::backend::Backend;
use crate::command::{Command, ConsumptionProbe, Outcome};
use crate::config::{BucketConfig, TokensInheritance};
use crate::error::Error;
use crate::executor::{BackendExecutor, ClientConfig, CommandExecutor};
use crate::state::NEVER;
use crate::sync::{
    NopSynchronizationListener, Synchronization, SynchronizationListener,
};
use crate::time::{Sleeper, SystemTimeSource, TokioSleeper};

/// Version stamped on buckets created without an explicit replacement policy.
const INITIAL_CONFIG_VERSION: u64 = 1;

/// Provides the configuration for a bucket the first time its key is used.
///
/// May be called concurrently by racing first touches; only one of the
/// resulting configurations wins the insert-if-absent, so suppliers should
/// be deterministic per key.
#[async_trait]
pub trait ConfigSupplier: Send + Sync {
    async fn bucket_config(&self) -> Result<BucketConfig, Error>;
}

#[async_trait]
impl<F> ConfigSupplier for F
where
    F: Fn() -> BucketConfig + Send + Sync,
{
    async fn bucket_config(&self) -> Result<BucketConfig, Error> {
        Ok(self())
    }
}

/// Observability hook for bucket operations. Methods run on the hot path
/// and must not block or fail.
pub trait BucketListener: Send + Sync {
    /// Tokens actually consumed (or reserved) by an operation.
    fn on_consumed(&self, tokens: u64) {
        let _ = tokens;
    }

    /// Tokens requested by an operation that was refused.
    fn on_rejected(&self, tokens: u64) {
        let _ = tokens;
    }

    /// A consume had to wait for refill; `nanos` is the sleep length.
    fn on_delayed(&self, nanos: u64) {
        let _ = nanos;
    }
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopBucketListener;

impl BucketListener for NopBucketListener {}

/// Listener accumulating totals, mostly useful in tests and gauges.
#[derive(Debug, Default)]
pub struct CountingBucketListener {
    consumed: AtomicU64,
    rejected: AtomicU64,
    delayed_nanos: AtomicU64,
}

impl CountingBucketListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn delayed_nanos(&self) -> u64 {
        self.delayed_nanos.load(Ordering::Relaxed)
    }
}

impl BucketListener for CountingBucketListener {
    fn on_consumed(&self, tokens: u64) {
        self.consumed.fetch_add(tokens, Ordering::Relaxed);
    }

    fn on_rejected(&self, tokens: u64) {
        self.rejected.fetch_add(tokens, Ordering::Relaxed);
    }

    fn on_delayed(&self, nanos: u64) {
        self.delayed_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct ImplicitReplacement {
    version: u64,
    inheritance: TokensInheritance,
}

/// Entry point for working with buckets on one backend.
pub struct ProxyManager<K> {
    backend: Arc<dyn Backend<K>>,
    client: ClientConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl<K> ProxyManager<K>
where
    K: Send + Sync + Clone + 'static,
{
    pub fn new(backend: Arc<dyn Backend<K>>) -> Self {
        ProxyManager { backend, client: ClientConfig::default(), sleeper: Arc::new(TokioSleeper) }
    }

    /// Replaces the request envelope settings used by every handle.
    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    /// Replaces the sleeper used by waiting consumes. Tests swap in a
    /// recording sleeper to avoid real delays.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Starts building a bucket handle.
    pub fn builder(&self) -> BucketBuilder<K> {
        BucketBuilder {
            backend: Arc::clone(&self.backend),
            client: self.client.clone(),
            sleeper: Arc::clone(&self.sleeper),
            synchronization: Synchronization::None,
            sync_listener: Arc::new(NopSynchronizationListener),
            listener: Arc::new(NopBucketListener),
            replacement: None,
        }
    }

    /// Configuration currently stored for `key`, or `None` when the key has
    /// never been materialized. Does not create the bucket.
    pub async fn get_configuration(&self, key: &K) -> Result<Option<BucketConfig>, Error> {
        let executor =
            BackendExecutor::new(Arc::clone(&self.backend), key.clone(), self.client.clone());
        match executor.execute(Command::GetConfiguration).await?.outcome {
            Outcome::Configuration(config) => Ok(Some(config)),
            Outcome::NotFound => Ok(None),
            other => Err(unexpected("get_configuration", other)),
        }
    }

    /// Deletes the remote state for `key`. Removing an absent key succeeds.
    pub async fn remove(&self, key: &K) -> Result<(), Error> {
        self.backend.remove(key).await
    }
}

/// Configures and builds one [`Bucket`] handle.
pub struct BucketBuilder<K> {
    backend: Arc<dyn Backend<K>>,
    client: ClientConfig,
    sleeper: Arc<dyn Sleeper>,
    synchronization: Synchronization,
    sync_listener: Arc<dyn SynchronizationListener>,
    listener: Arc<dyn BucketListener>,
    replacement: Option<ImplicitReplacement>,
}

impl<K> BucketBuilder<K>
where
    K: Send + Sync + 'static,
{
    /// Selects how concurrent commands from this handle reach the backend.
    pub fn synchronization(mut self, synchronization: Synchronization) -> Self {
        self.synchronization = synchronization;
        self
    }

    pub fn synchronization_listener(
        mut self,
        listener: Arc<dyn SynchronizationListener>,
    ) -> Self {
        self.sync_listener = listener;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn BucketListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Attaches a desired configuration version to every command. Remote
    /// state recorded under an older version is upgraded to the supplier's
    /// configuration with `inheritance` deciding what happens to the tokens;
    /// newer remote state is left alone.
    pub fn implicit_config_replacement(
        mut self,
        version: u64,
        inheritance: TokensInheritance,
    ) -> Self {
        self.replacement = Some(ImplicitReplacement { version, inheritance });
        self
    }

    /// Binds the handle to `key`. No remote call happens until the first
    /// operation.
    pub fn build<S>(self, key: K, supplier: S) -> Bucket
    where
        S: ConfigSupplier + 'static,
    {
        let direct: Arc<dyn CommandExecutor> =
            Arc::new(BackendExecutor::new(self.backend, key, self.client.clone()));
        let time = self
            .client
            .client_time
            .unwrap_or_else(|| Arc::new(SystemTimeSource));
        let executor = self.synchronization.decorate(direct, self.sync_listener, time);
        Bucket {
            executor,
            supplier: Arc::new(supplier),
            listener: self.listener,
            replacement: self.replacement,
            sleeper: self.sleeper,
            config_cache: OnceCell::new(),
        }
    }
}

/// Async handle to one bucket.
///
/// All operations share the lazy-init protocol: commands are sent bare, and
/// a `NotFound` answer triggers one retry wrapped in a create-if-absent
/// carrying the supplier's configuration. With implicit replacement
/// configured, every command instead carries the ensure wrapper, which both
/// creates and upgrades as needed.
pub struct Bucket {
    executor: Arc<dyn CommandExecutor>,
    supplier: Arc<dyn ConfigSupplier>,
    listener: Arc<dyn BucketListener>,
    replacement: Option<ImplicitReplacement>,
    sleeper: Arc<dyn Sleeper>,
    config_cache: OnceCell<BucketConfig>,
}

impl Bucket {
    /// Attempts to consume `tokens` atomically; never waits.
    pub async fn try_consume(&self, tokens: u64) -> Result<bool, Error> {
        match self.send(Command::TryConsume { tokens }).await? {
            Outcome::Consumed(true) => {
                self.listener.on_consumed(tokens);
                Ok(true)
            }
            Outcome::Consumed(false) => {
                self.listener.on_rejected(tokens);
                Ok(false)
            }
            other => Err(unexpected("try_consume", other)),
        }
    }

    /// Like [`try_consume`](Self::try_consume) but reports the remaining
    /// tokens and, on rejection, how long until the request could succeed.
    pub async fn try_consume_and_return_remaining(
        &self,
        tokens: u64,
    ) -> Result<ConsumptionProbe, Error> {
        match self.send(Command::TryConsumeAndReturnRemaining { tokens }).await? {
            Outcome::Probe(probe) => {
                if probe.consumed {
                    self.listener.on_consumed(tokens);
                } else {
                    self.listener.on_rejected(tokens);
                }
                Ok(probe)
            }
            other => Err(unexpected("try_consume_and_return_remaining", other)),
        }
    }

    /// Drains every available token and returns how many were taken.
    pub async fn try_consume_as_much_as_possible(&self) -> Result<u64, Error> {
        self.try_consume_up_to(u64::MAX).await
    }

    /// Drains up to `limit` tokens and returns how many were taken.
    pub async fn try_consume_up_to(&self, limit: u64) -> Result<u64, Error> {
        match self.send(Command::ConsumeUpTo { limit }).await? {
            Outcome::Tokens(taken) => {
                if taken > 0 {
                    self.listener.on_consumed(taken);
                }
                Ok(taken)
            }
            other => Err(unexpected("try_consume_up_to", other)),
        }
    }

    /// Consumes `tokens`, waiting for refill as long as necessary. Fails
    /// with a configuration error when the request exceeds capacity.
    pub async fn consume(&self, tokens: u64) -> Result<(), Error> {
        match self.reserve(tokens, u64::MAX).await? {
            NEVER => Err(Error::configuration(format!(
                "cannot consume {tokens} tokens: request exceeds bucket capacity"
            ))),
            wait => {
                self.settle(tokens, wait).await;
                Ok(())
            }
        }
    }

    /// Consumes `tokens` if the necessary refill arrives within `max_wait`,
    /// sleeping until the reservation matures. Returns `false` without
    /// consuming anything when the wait would be longer.
    pub async fn try_consume_with_wait(
        &self,
        tokens: u64,
        max_wait: Duration,
    ) -> Result<bool, Error> {
        let max_wait_nanos = u64::try_from(max_wait.as_nanos()).unwrap_or(u64::MAX);
        match self.reserve(tokens, max_wait_nanos).await? {
            NEVER => {
                self.listener.on_rejected(tokens);
                Ok(false)
            }
            wait => {
                self.settle(tokens, wait).await;
                Ok(true)
            }
        }
    }

    /// Credits `tokens`, clamped so the balance never exceeds capacity.
    pub async fn add_tokens(&self, tokens: u64) -> Result<(), Error> {
        self.expect_done("add_tokens", Command::AddTokens { tokens }).await
    }

    /// Credits `tokens` with no capacity clamp; the bucket may go overfull
    /// and will not refill until drained back below capacity.
    pub async fn force_add_tokens(&self, tokens: u64) -> Result<(), Error> {
        self.expect_done("force_add_tokens", Command::ForceAddTokens { tokens }).await
    }

    /// Restores the bucket to its configured initial tokens.
    pub async fn reset(&self) -> Result<(), Error> {
        self.expect_done("reset", Command::Reset).await
    }

    /// Current balance across all bandwidths; negative while reservations
    /// are outstanding.
    pub async fn available_tokens(&self) -> Result<i64, Error> {
        match self.send(Command::AvailableTokens).await? {
            Outcome::Available(tokens) => Ok(tokens),
            other => Err(unexpected("available_tokens", other)),
        }
    }

    /// Replaces the configuration in place, keeping the recorded version.
    pub async fn replace_configuration(
        &self,
        config: BucketConfig,
        inheritance: TokensInheritance,
    ) -> Result<(), Error> {
        self.expect_done(
            "replace_configuration",
            Command::ReplaceConfiguration { config, inheritance },
        )
        .await
    }

    /// Wraps this handle for use from blocking code. `runtime` drives the
    /// async pipeline; see [`BlockingBucket`].
    pub fn into_blocking(self, runtime: Handle) -> BlockingBucket {
        BlockingBucket::new(Arc::new(self), runtime)
    }

    async fn reserve(&self, tokens: u64, max_wait_nanos: u64) -> Result<u64, Error> {
        match self.send(Command::Reserve { tokens, max_wait_nanos }).await? {
            Outcome::Wait(wait) => Ok(wait),
            other => Err(unexpected("reserve", other)),
        }
    }

    /// Reports a matured reservation and sleeps out its wait.
    async fn settle(&self, tokens: u64, wait_nanos: u64) {
        self.listener.on_consumed(tokens);
        if wait_nanos > 0 {
            self.listener.on_delayed(wait_nanos);
            self.sleeper.sleep(Duration::from_nanos(wait_nanos)).await;
        }
    }

    async fn expect_done(&self, operation: &'static str, command: Command) -> Result<(), Error> {
        match self.send(command).await? {
            Outcome::Done => Ok(()),
            other => Err(unexpected(operation, other)),
        }
    }

    /// Sends one command, materializing the bucket on first touch.
    async fn send(&self, command: Command) -> Result<Outcome, Error> {
        if let Some(replacement) = self.replacement {
            let config = self.config().await?;
            let wrapped = Command::EnsureConfiguration {
                config,
                desired_version: replacement.version,
                inheritance: replacement.inheritance,
                inner: Box::new(command),
            };
            return Ok(self.executor.execute(wrapped).await?.outcome);
        }

        let result = self.executor.execute(command.clone()).await?;
        if !matches!(result.outcome, Outcome::NotFound) {
            return Ok(result.outcome);
        }

        // first touch: materialize and retry once. Insert-if-absent keeps
        // racing creators convergent, whichever configuration lands first
        // wins and the retried command applies to it.
        let config = self.config().await?;
        let wrapped = Command::CreateIfAbsent {
            config,
            version: INITIAL_CONFIG_VERSION,
            inner: Box::new(command),
        };
        Ok(self.executor.execute(wrapped).await?.outcome)
    }

    async fn config(&self) -> Result<BucketConfig, Error> {
        let config = self
            .config_cache
            .get_or_try_init(|| self.supplier.bucket_config())
            .await?;
        Ok(config.clone())
    }
}

fn unexpected(operation: &'static str, outcome: Outcome) -> Error {
    Error::codec(format!("unexpected outcome for {operation}: {outcome:?}"))
}

/// Blocking facade over [`Bucket`] for callers outside async code.
///
/// Inside a runtime the call is shifted onto a blocking thread first, so it
/// requires the multi-thread runtime flavor; plain threads just block on the
/// provided handle.
pub struct BlockingBucket {
    inner: Arc<Bucket>,
    runtime: Handle,
}

fn block_on_bucket<F, T>(runtime: &Handle, future: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| runtime.block_on(future)),
        Err(_) => runtime.block_on(future),
    }
}

impl BlockingBucket {
    pub fn new(inner: Arc<Bucket>, runtime: Handle) -> Self {
        BlockingBucket { inner, runtime }
    }

    pub fn try_consume(&self, tokens: u64) -> Result<bool, Error> {
        block_on_bucket(&self.runtime, self.inner.try_consume(tokens))
    }

    pub fn try_consume_and_return_remaining(
        &self,
        tokens: u64,
    ) -> Result<ConsumptionProbe, Error> {
        block_on_bucket(&self.runtime, self.inner.try_consume_and_return_remaining(tokens))
    }

    pub fn try_consume_as_much_as_possible(&self) -> Result<u64, Error> {
        block_on_bucket(&self.runtime, self.inner.try_consume_as_much_as_possible())
    }

    pub fn try_consume_up_to(&self, limit: u64) -> Result<u64, Error> {
        block_on_bucket(&self.runtime, self.inner.try_consume_up_to(limit))
    }

    pub fn consume(&self, tokens: u64) -> Result<(), Error> {
        block_on_bucket(&self.runtime, self.inner.consume(tokens))
    }

    pub fn try_consume_with_wait(&self, tokens: u64, max_wait: Duration) -> Result<bool, Error> {
        block_on_bucket(&self.runtime, self.inner.try_consume_with_wait(tokens, max_wait))
    }

    pub fn add_tokens(&self, tokens: u64) -> Result<(), Error> {
        block_on_bucket(&self.runtime, self.inner.add_tokens(tokens))
    }

    pub fn force_add_tokens(&self, tokens: u64) -> Result<(), Error> {
        block_on_bucket(&self.runtime, self.inner.force_add_tokens(tokens))
    }

    pub fn reset(&self) -> Result<(), Error> {
        block_on_bucket(&self.runtime, self.inner.reset())
    }

    pub fn available_tokens(&self) -> Result<i64, Error> {
        block_on_bucket(&self.runtime, self.inner.available_tokens())
    }

    pub fn replace_configuration(
        &self,
        config: BucketConfig,
        inheritance: TokensInheritance,
    ) -> Result<(), Error> {
        block_on_bucket(&self.runtime, self.inner.replace_configuration(config, inheritance))
    }
}
