//! Bucket configuration: bandwidth limits, refill policies, and the
//! tokens-inheritance policy used when a configuration is replaced.
//!
//! A configuration is immutable once a bucket has been created with it; the
//! only sanctioned way to change limits afterwards is a configuration
//! replacement (explicit or implicit), which states how existing tokens carry
//! over via [`TokensInheritance`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors raised while building configuration objects. These fail fast at
/// build time; they never surface from a running bucket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("bandwidth capacity must be greater than zero")]
    ZeroCapacity,
    #[error("refill must add at least one token per period")]
    ZeroRefillTokens,
    #[error("refill period must be greater than zero")]
    ZeroRefillPeriod,
    #[error("refill period {0:?} does not fit into 64-bit nanoseconds")]
    PeriodTooLong(Duration),
    #[error("bandwidth is missing a refill policy")]
    MissingRefill,
    #[error("bucket configuration needs at least one bandwidth")]
    NoBandwidths,
    #[error("'{0}' is not a valid SQL identifier")]
    InvalidSqlIdentifier(String),
}

/// How a bandwidth regains tokens.
///
/// Periods are stored as nanoseconds so persisted state is independent of
/// `Duration`'s encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refill {
    /// Tokens become available continuously, proportionally to elapsed time.
    Greedy { tokens: u64, period_nanos: u64 },
    /// Tokens become available in whole-period steps, the full amount at
    /// each boundary.
    Interval { tokens: u64, period_nanos: u64 },
}

impl Refill {
    pub fn tokens(&self) -> u64 {
        match self {
            Refill::Greedy { tokens, .. } | Refill::Interval { tokens, .. } => *tokens,
        }
    }

    pub fn period_nanos(&self) -> u64 {
        match self {
            Refill::Greedy { period_nanos, .. } | Refill::Interval { period_nanos, .. } => {
                *period_nanos
            }
        }
    }

    pub fn is_interval(&self) -> bool {
        matches!(self, Refill::Interval { .. })
    }
}

/// One capacity + refill rule within a bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    capacity: u64,
    refill: Refill,
    initial_tokens: u64,
}

impl Bandwidth {
    pub fn builder() -> BandwidthBuilder {
        BandwidthBuilder::new()
    }

    /// Shorthand for the common case: greedy refill of the full capacity per
    /// `period`, starting full.
    pub fn simple(capacity: u64, period: Duration) -> Result<Self, ConfigError> {
        Bandwidth::builder().capacity(capacity).refill_greedy(capacity, period).build()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill(&self) -> Refill {
        self.refill
    }

    /// Tokens a freshly created bucket starts with. May exceed capacity; an
    /// overfull bucket simply drains before refill matters again.
    pub fn initial_tokens(&self) -> u64 {
        self.initial_tokens
    }
}

/// Builder for [`Bandwidth`]. Capacity and a refill policy are mandatory;
/// `initial_tokens` defaults to the capacity.
#[derive(Debug, Clone, Default)]
pub struct BandwidthBuilder {
    capacity: Option<u64>,
    refill_tokens: Option<u64>,
    refill_period: Option<Duration>,
    interval: bool,
    initial_tokens: Option<u64>,
}

impl BandwidthBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn refill_greedy(mut self, tokens: u64, period: Duration) -> Self {
        self.refill_tokens = Some(tokens);
        self.refill_period = Some(period);
        self.interval = false;
        self
    }

    pub fn refill_interval(mut self, tokens: u64, period: Duration) -> Self {
        self.refill_tokens = Some(tokens);
        self.refill_period = Some(period);
        self.interval = true;
        self
    }

    pub fn initial_tokens(mut self, tokens: u64) -> Self {
        self.initial_tokens = Some(tokens);
        self
    }

    pub fn build(self) -> Result<Bandwidth, ConfigError> {
        let capacity = self.capacity.ok_or(ConfigError::ZeroCapacity)?;
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let tokens = self.refill_tokens.ok_or(ConfigError::MissingRefill)?;
        let period = self.refill_period.ok_or(ConfigError::MissingRefill)?;
        if tokens == 0 {
            return Err(ConfigError::ZeroRefillTokens);
        }
        if period.is_zero() {
            return Err(ConfigError::ZeroRefillPeriod);
        }
        let period_nanos =
            u64::try_from(period.as_nanos()).map_err(|_| ConfigError::PeriodTooLong(period))?;
        let refill = if self.interval {
            Refill::Interval { tokens, period_nanos }
        } else {
            Refill::Greedy { tokens, period_nanos }
        };
        Ok(Bandwidth {
            capacity,
            refill,
            initial_tokens: self.initial_tokens.unwrap_or(capacity),
        })
    }
}

/// Ordered set of bandwidth limits. Consumption must satisfy every limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    bandwidths: Vec<Bandwidth>,
}

impl BucketConfig {
    pub fn builder() -> BucketConfigBuilder {
        BucketConfigBuilder::default()
    }

    pub fn bandwidths(&self) -> &[Bandwidth] {
        &self.bandwidths
    }
}

/// Builder for [`BucketConfig`].
#[derive(Debug, Clone, Default)]
pub struct BucketConfigBuilder {
    bandwidths: Vec<Bandwidth>,
}

impl BucketConfigBuilder {
    pub fn add_bandwidth(mut self, bandwidth: Bandwidth) -> Self {
        self.bandwidths.push(bandwidth);
        self
    }

    pub fn build(self) -> Result<BucketConfig, ConfigError> {
        if self.bandwidths.is_empty() {
            return Err(ConfigError::NoBandwidths);
        }
        Ok(BucketConfig { bandwidths: self.bandwidths })
    }
}

/// How existing tokens carry over when a bucket's configuration is replaced.
///
/// This is deliberately a policy the caller picks, not a hard-coded rule;
/// reasonable systems disagree about what a capacity change means for the
/// tokens already in the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TokensInheritance {
    /// Keep the current token count, clamped to the new capacity.
    AsIs,
    /// Scale the current count by `new_capacity / old_capacity`, rounding
    /// half up.
    Proportional,
    /// Credit capacity growth on top of the current count
    /// (`tokens + (new_capacity - old_capacity)`); behaves like `AsIs` when
    /// capacity shrank.
    Additive,
    /// Discard the current count and start from the new initial tokens.
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_simple_bandwidth() {
        let bw = Bandwidth::simple(10, Duration::from_secs(1)).unwrap();
        assert_eq!(bw.capacity(), 10);
        assert_eq!(bw.initial_tokens(), 10);
        assert_eq!(bw.refill(), Refill::Greedy { tokens: 10, period_nanos: 1_000_000_000 });
    }

    #[test]
    fn initial_tokens_default_to_capacity() {
        let bw = Bandwidth::builder()
            .capacity(50)
            .refill_greedy(5, Duration::from_secs(60))
            .build()
            .unwrap();
        assert_eq!(bw.initial_tokens(), 50);
    }

    #[test]
    fn initial_tokens_can_be_zero_or_overfull() {
        let empty = Bandwidth::builder()
            .capacity(10)
            .refill_greedy(10, Duration::from_secs(1))
            .initial_tokens(0)
            .build()
            .unwrap();
        assert_eq!(empty.initial_tokens(), 0);

        let overfull = Bandwidth::builder()
            .capacity(10)
            .refill_greedy(10, Duration::from_secs(1))
            .initial_tokens(25)
            .build()
            .unwrap();
        assert_eq!(overfull.initial_tokens(), 25);
    }

    #[test]
    fn rejects_invalid_bandwidths() {
        assert_eq!(
            Bandwidth::builder().refill_greedy(1, Duration::from_secs(1)).build(),
            Err(ConfigError::ZeroCapacity)
        );
        assert_eq!(
            Bandwidth::builder().capacity(0).refill_greedy(1, Duration::from_secs(1)).build(),
            Err(ConfigError::ZeroCapacity)
        );
        assert_eq!(
            Bandwidth::builder().capacity(1).build(),
            Err(ConfigError::MissingRefill)
        );
        assert_eq!(
            Bandwidth::builder().capacity(1).refill_greedy(0, Duration::from_secs(1)).build(),
            Err(ConfigError::ZeroRefillTokens)
        );
        assert_eq!(
            Bandwidth::builder().capacity(1).refill_greedy(1, Duration::ZERO).build(),
            Err(ConfigError::ZeroRefillPeriod)
        );
        assert_eq!(
            Bandwidth::builder()
                .capacity(1)
                .refill_greedy(1, Duration::from_secs(u64::MAX))
                .build(),
            Err(ConfigError::PeriodTooLong(Duration::from_secs(u64::MAX)))
        );
    }

    #[test]
    fn config_requires_at_least_one_bandwidth() {
        assert_eq!(BucketConfig::builder().build(), Err(ConfigError::NoBandwidths));

        let config = BucketConfig::builder()
            .add_bandwidth(Bandwidth::simple(10, Duration::from_secs(1)).unwrap())
            .add_bandwidth(Bandwidth::simple(100, Duration::from_secs(3600)).unwrap())
            .build()
            .unwrap();
        assert_eq!(config.bandwidths().len(), 2);
    }

    #[test]
    fn interval_refill_is_tagged() {
        let bw = Bandwidth::builder()
            .capacity(10)
            .refill_interval(10, Duration::from_secs(1))
            .build()
            .unwrap();
        assert!(bw.refill().is_interval());
    }
}
