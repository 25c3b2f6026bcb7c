//! Persisted per-key bucket state and the pure transitions over it.
//!
//! Everything here is deterministic: given the same state, the same command
//! arguments, and the same clock reading, every node computes the same next
//! state. That property is what lets lock-based and CAS-based backends share
//! one execution path and still agree bit-for-bit.
//!
//! Token counts are signed. A reservation may drive a limit negative; the
//! deficit is repaid by refill before any further consumption succeeds.

use serde::{Deserialize, Serialize};

use crate::config::{Bandwidth, BucketConfig, Refill, TokensInheritance};

/// Wait-time sentinel for requests that can never be satisfied, such as
/// asking for more tokens than a limit's capacity.
pub const NEVER: u64 = u64::MAX;

/// Live counters for one bandwidth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitState {
    /// Available tokens. Negative while a reservation is being repaid.
    tokens: i64,
    /// Clock reading of the last refill, in nanoseconds. For interval refill
    /// this sits on the most recent period boundary.
    last_refill_nanos: u64,
    /// Sub-token refill progress in token-nanoseconds, always below the
    /// refill period. Only greedy refill banks a remainder.
    carry: u64,
}

impl LimitState {
    fn initial(bandwidth: &Bandwidth, now_nanos: u64) -> Self {
        LimitState {
            tokens: saturate_i64(bandwidth.initial_tokens()),
            last_refill_nanos: now_nanos,
            carry: 0,
        }
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    fn refill(&mut self, bandwidth: &Bandwidth, now_nanos: u64) {
        if now_nanos <= self.last_refill_nanos {
            // A stale clock reading must not rewind refill progress.
            return;
        }
        let capacity = saturate_i64(bandwidth.capacity());
        if self.tokens >= capacity {
            // Full (or overfull) buckets bank nothing; they drain first.
            self.last_refill_nanos = now_nanos;
            self.carry = 0;
            return;
        }
        let elapsed = now_nanos - self.last_refill_nanos;
        match bandwidth.refill() {
            Refill::Greedy { tokens, period_nanos } => {
                let total = u128::from(elapsed) * u128::from(tokens) + u128::from(self.carry);
                let added = total / u128::from(period_nanos);
                let remainder = (total % u128::from(period_nanos)) as u64;
                self.apply_refill(added, capacity, remainder);
                self.last_refill_nanos = now_nanos;
            }
            Refill::Interval { tokens, period_nanos } => {
                let periods = elapsed / period_nanos;
                if periods == 0 {
                    return;
                }
                let added = u128::from(periods) * u128::from(tokens);
                self.apply_refill(added, capacity, 0);
                self.last_refill_nanos += periods * period_nanos;
            }
        }
    }

    fn apply_refill(&mut self, added: u128, capacity: i64, remainder: u64) {
        // Caller guarantees tokens < capacity, so headroom is positive.
        let headroom = (i128::from(capacity) - i128::from(self.tokens)) as u128;
        if added >= headroom {
            self.tokens = capacity;
            self.carry = 0;
        } else {
            self.tokens = (i128::from(self.tokens) + added as i128) as i64;
            self.carry = remainder;
        }
    }

    /// Nanoseconds of further refill needed before `requested` tokens are
    /// available on this limit, assuming [`refill`](Self::refill) just ran
    /// with the same `now_nanos`. Returns [`NEVER`] if the request exceeds
    /// capacity.
    fn nanos_until_available(&self, bandwidth: &Bandwidth, requested: u64, now_nanos: u64) -> u64 {
        if requested > bandwidth.capacity() {
            return NEVER;
        }
        let requested = saturate_i64(requested);
        if self.tokens >= requested {
            return 0;
        }
        let deficit = (requested - self.tokens) as u128;
        match bandwidth.refill() {
            Refill::Greedy { tokens, period_nanos } => {
                let needed = deficit * u128::from(period_nanos) - u128::from(self.carry);
                let wait = needed.div_ceil(u128::from(tokens));
                u64::try_from(wait).unwrap_or(NEVER)
            }
            Refill::Interval { tokens, period_nanos } => {
                let periods = deficit.div_ceil(u128::from(tokens));
                let boundary = periods * u128::from(period_nanos);
                let since_boundary = u128::from(now_nanos.saturating_sub(self.last_refill_nanos));
                u64::try_from(boundary.saturating_sub(since_boundary)).unwrap_or(NEVER)
            }
        }
    }
}

/// Full persisted state of one bucket: the configuration it was created (or
/// last replaced) with, the version number that configuration carries, and
/// one [`LimitState`] per bandwidth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    config_version: u64,
    config: BucketConfig,
    limits: Vec<LimitState>,
}

impl RemoteState {
    /// State of a bucket freshly created at `now_nanos` under configuration
    /// version `config_version`.
    pub fn initial(config: BucketConfig, config_version: u64, now_nanos: u64) -> Self {
        let limits = config
            .bandwidths()
            .iter()
            .map(|bw| LimitState::initial(bw, now_nanos))
            .collect();
        RemoteState { config_version, config, limits }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Version number of the configuration this state was created or last
    /// replaced under. Drives implicit configuration replacement.
    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    pub fn limits(&self) -> &[LimitState] {
        &self.limits
    }

    /// Advances every limit's refill to `now_nanos`.
    pub fn refill(&mut self, now_nanos: u64) {
        for (limit, bandwidth) in self.limits.iter_mut().zip(self.config.bandwidths()) {
            limit.refill(bandwidth, now_nanos);
        }
    }

    /// Tokens available right now: the minimum across all limits.
    pub fn available(&self) -> i64 {
        self.limits.iter().map(LimitState::tokens).min().unwrap_or(0)
    }

    /// All-or-nothing consumption. Either every limit has `tokens` available
    /// and all are debited, or nothing changes.
    pub fn try_consume(&mut self, tokens: u64) -> bool {
        let tokens = saturate_i64(tokens);
        if self.limits.iter().all(|l| l.tokens >= tokens) {
            for limit in &mut self.limits {
                limit.tokens -= tokens;
            }
            true
        } else {
            false
        }
    }

    /// Consumes whatever is available, capped at `limit`. Returns the amount
    /// actually taken.
    pub fn consume_up_to(&mut self, limit: u64) -> u64 {
        let available = self.available().max(0) as u64;
        let take = available.min(limit);
        if take > 0 {
            let take_signed = saturate_i64(take);
            for l in &mut self.limits {
                l.tokens -= take_signed;
            }
        }
        take
    }

    /// Debits `tokens` from every limit unconditionally, allowing counts to
    /// go negative. Used by reservation-based consumption.
    pub fn reserve(&mut self, tokens: u64) {
        let tokens = saturate_i64(tokens);
        for limit in &mut self.limits {
            limit.tokens -= tokens;
        }
    }

    /// Credits tokens, clamping each limit at its capacity.
    pub fn add_tokens(&mut self, tokens: u64) {
        let tokens = saturate_i64(tokens);
        for (limit, bandwidth) in self.limits.iter_mut().zip(self.config.bandwidths()) {
            let capacity = saturate_i64(bandwidth.capacity());
            limit.tokens = limit.tokens.saturating_add(tokens).min(capacity.max(limit.tokens));
        }
    }

    /// Credits tokens with no capacity clamp. The bucket may become overfull
    /// and will not refill again until it drains below capacity.
    pub fn force_add_tokens(&mut self, tokens: u64) {
        let tokens = saturate_i64(tokens);
        for limit in &mut self.limits {
            limit.tokens = limit.tokens.saturating_add(tokens);
        }
    }

    /// Puts every limit back to its configured initial token count.
    pub fn reset(&mut self, now_nanos: u64) {
        for (limit, bandwidth) in self.limits.iter_mut().zip(self.config.bandwidths()) {
            *limit = LimitState::initial(bandwidth, now_nanos);
        }
    }

    /// Nanoseconds until `requested` tokens are available on every limit.
    /// Zero when they already are; [`NEVER`] when some limit's capacity is
    /// below the request.
    pub fn nanos_until_available(&self, requested: u64, now_nanos: u64) -> u64 {
        self.limits
            .iter()
            .zip(self.config.bandwidths())
            .map(|(limit, bw)| limit.nanos_until_available(bw, requested, now_nanos))
            .max()
            .unwrap_or(0)
    }

    /// Nanoseconds of refill until every limit is back at capacity. Used to
    /// size refill-based expiration.
    pub fn nanos_to_full(&self, now_nanos: u64) -> u64 {
        self.limits
            .iter()
            .zip(self.config.bandwidths())
            .map(|(limit, bw)| limit.nanos_until_available(bw, bw.capacity(), now_nanos))
            .max()
            .unwrap_or(0)
    }

    /// Swaps in a new configuration, carrying tokens over per `inheritance`
    /// and recording `new_version` as the configuration version.
    ///
    /// Limits are matched by position. A new limit with no predecessor
    /// starts from its initial tokens. Refill progress is not carried; each
    /// limit restarts its refill clock at `now_nanos`.
    pub fn replace_config(
        &mut self,
        new_config: BucketConfig,
        new_version: u64,
        inheritance: TokensInheritance,
        now_nanos: u64,
    ) {
        self.refill(now_nanos);
        let mut limits = Vec::with_capacity(new_config.bandwidths().len());
        for (position, bandwidth) in new_config.bandwidths().iter().enumerate() {
            let inherited = match (self.limits.get(position), self.config.bandwidths().get(position))
            {
                (Some(old_limit), Some(old_bw)) => {
                    inherit_tokens(old_limit.tokens, old_bw, bandwidth, inheritance)
                }
                _ => None,
            };
            let tokens = inherited.unwrap_or_else(|| saturate_i64(bandwidth.initial_tokens()));
            limits.push(LimitState { tokens, last_refill_nanos: now_nanos, carry: 0 });
        }
        self.config_version = new_version;
        self.config = new_config;
        self.limits = limits;
    }
}

fn inherit_tokens(
    old_tokens: i64,
    old_bw: &Bandwidth,
    new_bw: &Bandwidth,
    inheritance: TokensInheritance,
) -> Option<i64> {
    let new_capacity = saturate_i64(new_bw.capacity());
    let old_capacity = saturate_i64(old_bw.capacity());
    let tokens = match inheritance {
        TokensInheritance::AsIs => old_tokens.min(new_capacity),
        TokensInheritance::Proportional => {
            scale_proportionally(old_tokens, old_capacity, new_capacity).min(new_capacity)
        }
        TokensInheritance::Additive => {
            if new_capacity >= old_capacity {
                old_tokens.saturating_add(new_capacity - old_capacity)
            } else {
                old_tokens.min(new_capacity)
            }
        }
        TokensInheritance::Reset => return None,
    };
    Some(tokens)
}

/// `tokens * new_capacity / old_capacity`, rounding half away from zero.
fn scale_proportionally(tokens: i64, old_capacity: i64, new_capacity: i64) -> i64 {
    let scaled = i128::from(tokens) * i128::from(new_capacity);
    let half = i128::from(old_capacity) / 2;
    let biased = if scaled >= 0 { scaled + half } else { scaled - half };
    let rounded = biased / i128::from(old_capacity);
    i64::try_from(rounded).unwrap_or(if rounded > 0 { i64::MAX } else { i64::MIN })
}

fn saturate_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
