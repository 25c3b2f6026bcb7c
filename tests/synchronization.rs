#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::test_helpers::{init_tracing, simple_config, spawn_wave, Cluster};
use spillway::{CountingSynchronizationListener, Synchronization};

async fn run_wave(synchronization: Synchronization) -> usize {
    let cluster = Cluster::new();
    let manager = cluster.locking_manager();
    let bucket = Arc::new(
        manager
            .builder()
            .synchronization(synchronization)
            .build("gate".to_string(), || simple_config(10)),
    );
    let (granted, _) = spawn_wave(&bucket, 40).await;
    granted
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batching_grants_exactly_what_direct_execution_grants() {
    init_tracing();
    assert_eq!(run_wave(Synchronization::None).await, 10);
    assert_eq!(run_wave(Synchronization::Batching).await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skip_on_zero_never_over_admits() {
    init_tracing();
    let cluster = Cluster::new();
    let manager = cluster.locking_manager();
    let listener = Arc::new(CountingSynchronizationListener::new());
    let bucket = Arc::new(
        manager
            .builder()
            .synchronization(Synchronization::SkipOnZero)
            .synchronization_listener(listener.clone())
            .build("gate".to_string(), || simple_config(10)),
    );

    assert_eq!(bucket.try_consume_as_much_as_possible().await.unwrap(), 10);

    // Rejection storm against the drained bucket: every call is refused and
    // none of them needs the store once the shadow is in place.
    let (granted, rejected) = spawn_wave(&bucket, 50).await;
    assert_eq!((granted, rejected), (0, 50));
    assert_eq!(listener.skipped(), 50);

    cluster.clock.advance(Duration::from_secs(1));

    // After the refill the shadow falls through and the store admits exactly
    // the configured rate again.
    let (granted, rejected) = spawn_wave(&bucket, 40).await;
    assert_eq!((granted, rejected), (10, 30));
}
