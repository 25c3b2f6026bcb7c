#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Spillway 🌊
//!
//! Distributed token-bucket rate limiting for Rust: one command protocol,
//! pluggable transactional backends, and per-key bucket handles that work
//! the same against an in-memory store or a remote database.
//!
//! ## Features
//!
//! - **Token buckets** with multiple bandwidths, greedy or interval refill,
//!   and reservation-based waiting
//! - **Transactional backends** behind one driver: select-for-update locking
//!   and compare-and-swap retries share the execution protocol
//! - **Synchronization decorators** that batch concurrent commands and
//!   answer doomed requests locally while a bucket is empty
//! - **Versioned configuration replacement** with pluggable
//!   tokens-inheritance, safe under rolling deploys
//! - **Versioned wire format** so old persisted state stays readable
//!
//! ## Quick Start
//!
//! ```rust
//! use spillway::{
//!     Backend, Bandwidth, BucketConfig, MemoryStore, ProxyManager,
//!     TransactionalBackend,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), spillway::Error> {
//!     let store: MemoryStore<String> = MemoryStore::new();
//!     let backend: Arc<dyn Backend<String>> =
//!         Arc::new(TransactionalBackend::new(store.locking()));
//!     let manager = ProxyManager::new(backend);
//!
//!     let bucket = manager.builder().build("api:42".to_string(), || {
//!         BucketConfig::builder()
//!             .add_bandwidth(Bandwidth::simple(100, Duration::from_secs(1)).unwrap())
//!             .build()
//!             .unwrap()
//!     });
//!
//!     assert!(bucket.try_consume(1).await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod proxy;
pub mod state;
pub mod sync;
pub mod time;
pub mod transaction;
pub mod wire;

// Re-exports
pub use backend::memory::MemoryStore;
pub use backend::sql::{SqlStatements, TableSettings};
pub use backend::{
    Backend, MappedBackend, RemoteStore, TransactionalBackend, DEFAULT_RETRY_BUDGET,
};
pub use command::{Command, CommandResult, ConsumptionProbe, Outcome, StateCell};
pub use config::{
    Bandwidth, BandwidthBuilder, BucketConfig, BucketConfigBuilder, ConfigError, Refill,
    TokensInheritance,
};
pub use error::Error;
pub use executor::{BackendExecutor, ClientConfig, CommandExecutor};
pub use proxy::{
    BlockingBucket, Bucket, BucketBuilder, BucketListener, ConfigSupplier,
    CountingBucketListener, NopBucketListener, ProxyManager,
};
pub use state::{RemoteState, NEVER};
pub use sync::{
    BatchingExecutor, CountingSynchronizationListener, NopSynchronizationListener,
    SkipOnZeroExecutor, Synchronization, SynchronizationListener,
};
pub use time::{
    ManualTimeSource, Sleeper, SystemTimeSource, TimeSource, TokioSleeper, TrackingSleeper,
};
pub use transaction::{Deadline, LockedRow, StateWrite, StoreTransaction, UpdateOutcome};
pub use wire::{ExpirationPolicy, Request, WireVersion};
