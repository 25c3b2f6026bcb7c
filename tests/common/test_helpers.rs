#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Arc;
use std::time::Duration;

use spillway::{
    Backend, Bandwidth, Bucket, BucketConfig, ClientConfig, ManualTimeSource, MemoryStore,
    ProxyManager, TransactionalBackend,
};
use tracing_subscriber::filter::LevelFilter;

/// Routes crate logs to the test writer; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

/// Fans `calls` concurrent one-token consumes at `bucket` and tallies the
/// (granted, rejected) verdicts.
pub async fn spawn_wave(bucket: &Arc<Bucket>, calls: usize) -> (usize, usize) {
    let mut handles = Vec::with_capacity(calls);
    for _ in 0..calls {
        let bucket = Arc::clone(bucket);
        handles.push(tokio::spawn(async move { bucket.try_consume(1).await }));
    }
    let results: Vec<_> = futures::future::join_all(handles).await;
    let mut granted = 0;
    let mut rejected = 0;
    for result in results {
        if result.unwrap().unwrap() {
            granted += 1;
        } else {
            rejected += 1;
        }
    }
    (granted, rejected)
}

/// Single bandwidth refilling `capacity` tokens per second, starting full.
pub fn simple_config(capacity: u64) -> BucketConfig {
    let bandwidth = Bandwidth::simple(capacity, Duration::from_secs(1)).unwrap();
    BucketConfig::builder().add_bandwidth(bandwidth).build().unwrap()
}

/// Same rate as [`simple_config`] but the bucket starts with zero tokens.
pub fn empty_config(capacity: u64) -> BucketConfig {
    let bandwidth = Bandwidth::builder()
        .capacity(capacity)
        .refill_greedy(capacity, Duration::from_secs(1))
        .initial_tokens(0)
        .build()
        .unwrap();
    BucketConfig::builder().add_bandwidth(bandwidth).build().unwrap()
}

/// One shared in-memory store plus the manual clock every participant reads.
///
/// Both driver flavors can be layered over the same rows, which is how the
/// equivalence tests compare them byte for byte.
pub struct Cluster {
    pub store: MemoryStore<String>,
    pub clock: ManualTimeSource,
}

impl Cluster {
    pub fn new() -> Self {
        let clock = ManualTimeSource::new(0);
        let store = MemoryStore::with_time_source(Arc::new(clock.clone()));
        Cluster { store, clock }
    }

    /// Client config pinning request time to the cluster clock.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            client_time: Some(Arc::new(self.clock.clone())),
            ..ClientConfig::default()
        }
    }

    /// Manager over the lock-then-write driver.
    pub fn locking_manager(&self) -> ProxyManager<String> {
        let backend = TransactionalBackend::new(self.store.locking())
            .with_time_source(Arc::new(self.clock.clone()));
        self.manager_over(Arc::new(backend))
    }

    /// Manager over the compare-and-swap driver.
    pub fn cas_manager(&self) -> ProxyManager<String> {
        let backend = TransactionalBackend::new(self.store.compare_and_swap())
            .with_time_source(Arc::new(self.clock.clone()));
        self.manager_over(Arc::new(backend))
    }

    fn manager_over(&self, backend: Arc<dyn Backend<String>>) -> ProxyManager<String> {
        ProxyManager::new(backend).with_client_config(self.client_config())
    }
}
