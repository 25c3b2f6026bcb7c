//! Time abstractions used throughout the engine.
//!
//! Every piece of token arithmetic is parameterized on a nanosecond reading so
//! tests (and clients that want to override the backend's notion of "now") can
//! inject a fake clock instead of sleeping for real.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" in nanoseconds.
///
/// Implementations must be monotone enough for rate limiting: small backwards
/// jumps are tolerated by the refill arithmetic, but a source that jumps
/// around freely will produce surprising token counts.
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    fn now_nanos(&self) -> u64;
}

/// Wall clock reporting nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_nanos(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
    }
}

/// Manually driven clock for deterministic tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    nanos: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start_nanos: u64) -> Self {
        Self { nanos: Arc::new(AtomicU64::new(start_nanos)) }
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Abstraction over waiting, so blocking consumption can be tested without
/// real delays.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that records requested durations and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_source_advances() {
        let clock = ManualTimeSource::new(5);
        assert_eq!(clock.now_nanos(), 5);
        clock.advance(Duration::from_nanos(10));
        assert_eq!(clock.now_nanos(), 15);
        clock.set(1_000);
        assert_eq!(clock.now_nanos(), 1_000);
    }

    #[test]
    fn manual_source_clones_share_state() {
        let clock = ManualTimeSource::new(0);
        let other = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(other.now_nanos(), 1_000_000_000);
    }

    #[test]
    fn system_source_is_roughly_epoch_now() {
        let now = SystemTimeSource.now_nanos();
        // Sometime after 2020-01-01.
        assert!(now > 1_577_836_800_000_000_000);
    }

    #[tokio::test]
    async fn tracking_sleeper_records_without_sleeping() {
        let sleeper = TrackingSleeper::new();
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(30)).await;
        sleeper.sleep(Duration::from_millis(250)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_secs(30), Duration::from_millis(250)]
        );
    }
}
