//! Commands and their deterministic application to bucket state.
//!
//! A [`Command`] is the unit of work shipped to a backend. Its entire effect
//! is expressed by [`Command::apply`], a pure function over a [`StateCell`];
//! backends differ only in how they fetch and persist the cell, never in
//! what a command means. Wrapper commands ([`Command::CreateIfAbsent`],
//! [`Command::EnsureConfiguration`]) fold bucket creation and configuration
//! replacement into the same round trip as the operation they carry, and
//! [`Command::Batch`] folds several operations into one.

use serde::{Deserialize, Serialize};

use crate::config::{BucketConfig, TokensInheritance};
use crate::state::{RemoteState, NEVER};

/// A state transition request against one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// All-or-nothing consumption of `tokens`.
    TryConsume { tokens: u64 },
    /// Like [`Command::TryConsume`], but reports remaining tokens and the
    /// wait until the request could succeed.
    TryConsumeAndReturnRemaining { tokens: u64 },
    /// Consumes whatever is available, capped at `limit`.
    ConsumeUpTo { limit: u64 },
    /// Credits tokens, clamped at capacity.
    AddTokens { tokens: u64 },
    /// Credits tokens with no clamp; the bucket may become overfull.
    ForceAddTokens { tokens: u64 },
    /// Restores every limit to its initial token count.
    Reset,
    /// Reports currently available tokens without consuming.
    AvailableTokens,
    /// Reports the bucket's current configuration.
    GetConfiguration,
    /// Swaps in a new configuration, carrying tokens per `inheritance`. The
    /// recorded configuration version is kept; version bumps belong to
    /// implicit replacement.
    ReplaceConfiguration {
        config: BucketConfig,
        inheritance: TokensInheritance,
    },
    /// Consumes `tokens` immediately if available, otherwise books them
    /// against future refill when the implied wait fits `max_wait_nanos`.
    Reserve { tokens: u64, max_wait_nanos: u64 },
    /// Creates the bucket from `config` at `version` if it does not exist,
    /// then applies `inner`. Never touches an existing bucket.
    CreateIfAbsent {
        config: BucketConfig,
        version: u64,
        inner: Box<Command>,
    },
    /// Creates the bucket if absent; replaces its configuration if the
    /// recorded version is older than `desired_version`; then applies
    /// `inner`. A newer recorded version is left alone so stale clients
    /// cannot roll a configuration back.
    EnsureConfiguration {
        config: BucketConfig,
        desired_version: u64,
        inheritance: TokensInheritance,
        inner: Box<Command>,
    },
    /// Applies `commands` in order within a single round trip.
    Batch { commands: Vec<Command> },
}

/// Result of applying a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// The bucket does not exist and the command cannot create it.
    NotFound,
    /// Whether an all-or-nothing consumption succeeded.
    Consumed(bool),
    /// Detailed consumption verdict.
    Probe(ConsumptionProbe),
    /// Tokens actually taken by a capped consumption.
    Tokens(u64),
    /// Currently available tokens, negative while a reservation is repaid.
    Available(i64),
    /// The bucket's configuration.
    Configuration(BucketConfig),
    /// Nanoseconds the caller must sleep for a reservation, `0` when tokens
    /// were taken immediately, [`NEVER`] when the wait limit was exceeded.
    Wait(u64),
    /// The command completed and returns nothing.
    Done,
    /// Per-command outcomes of a batch, in submission order.
    Batch(Vec<Outcome>),
}

/// What an executor hands back: the outcome plus the bucket state as stored
/// after execution and the clock reading the transition used. The snapshot
/// feeds synchronization layers and listeners; it is absent only when the
/// bucket does not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub outcome: Outcome,
    pub snapshot: Option<RemoteState>,
    pub time_nanos: u64,
}

/// Verdict of [`Command::TryConsumeAndReturnRemaining`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionProbe {
    pub consumed: bool,
    /// Tokens left after the attempt (or currently, when rejected).
    pub remaining_tokens: i64,
    /// Refill time until the rejected request would succeed. Zero when
    /// consumed; [`NEVER`] when the request exceeds capacity.
    pub nanos_to_wait_for_refill: u64,
}

/// Mutable bucket state as seen by one command application.
///
/// Tracks whether the command actually changed anything. Rejections leave
/// the cell untouched, so a failed `try_consume` costs a read but never a
/// write, and refill progress is recomputed rather than persisted on its
/// own.
#[derive(Debug, Clone)]
pub struct StateCell {
    state: Option<RemoteState>,
    modified: bool,
}

impl StateCell {
    pub fn new(state: Option<RemoteState>) -> Self {
        StateCell { state, modified: false }
    }

    pub fn empty() -> Self {
        StateCell::new(None)
    }

    pub fn is_present(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&RemoteState> {
        self.state.as_ref()
    }

    /// Whether a command wrote through this cell.
    pub fn modified(&self) -> bool {
        self.modified
    }

    pub fn into_state(self) -> Option<RemoteState> {
        self.state
    }

    fn put(&mut self, state: RemoteState) {
        self.state = Some(state);
        self.modified = true;
    }
}

impl Command {
    /// Applies this command to `cell` at clock reading `now_nanos`.
    ///
    /// Deterministic: identical inputs produce identical outcomes and
    /// identical final cells on every node.
    pub fn apply(&self, cell: &mut StateCell, now_nanos: u64) -> Outcome {
        match self {
            Command::CreateIfAbsent { config, version, inner } => {
                if !cell.is_present() {
                    cell.put(RemoteState::initial(config.clone(), *version, now_nanos));
                }
                inner.apply(cell, now_nanos)
            }
            Command::EnsureConfiguration { config, desired_version, inheritance, inner } => {
                match cell.state() {
                    None => {
                        cell.put(RemoteState::initial(config.clone(), *desired_version, now_nanos))
                    }
                    Some(state) if state.config_version() < *desired_version => {
                        let mut next = state.clone();
                        next.replace_config(
                            config.clone(),
                            *desired_version,
                            *inheritance,
                            now_nanos,
                        );
                        cell.put(next);
                    }
                    Some(_) => {}
                }
                inner.apply(cell, now_nanos)
            }
            Command::Batch { commands } => Outcome::Batch(
                commands.iter().map(|command| command.apply(cell, now_nanos)).collect(),
            ),
            _ => match cell.state() {
                None => Outcome::NotFound,
                Some(state) => self.apply_present(state.clone(), cell, now_nanos),
            },
        }
    }

    fn apply_present(&self, mut state: RemoteState, cell: &mut StateCell, now_nanos: u64) -> Outcome {
        state.refill(now_nanos);
        match self {
            Command::TryConsume { tokens } => {
                if state.try_consume(*tokens) {
                    cell.put(state);
                    Outcome::Consumed(true)
                } else {
                    Outcome::Consumed(false)
                }
            }
            Command::TryConsumeAndReturnRemaining { tokens } => {
                if state.try_consume(*tokens) {
                    let probe = ConsumptionProbe {
                        consumed: true,
                        remaining_tokens: state.available(),
                        nanos_to_wait_for_refill: 0,
                    };
                    cell.put(state);
                    Outcome::Probe(probe)
                } else {
                    Outcome::Probe(ConsumptionProbe {
                        consumed: false,
                        remaining_tokens: state.available(),
                        nanos_to_wait_for_refill: state.nanos_until_available(*tokens, now_nanos),
                    })
                }
            }
            Command::ConsumeUpTo { limit } => {
                let taken = state.consume_up_to(*limit);
                if taken > 0 {
                    cell.put(state);
                }
                Outcome::Tokens(taken)
            }
            Command::AddTokens { tokens } => {
                state.add_tokens(*tokens);
                cell.put(state);
                Outcome::Done
            }
            Command::ForceAddTokens { tokens } => {
                state.force_add_tokens(*tokens);
                cell.put(state);
                Outcome::Done
            }
            Command::Reset => {
                state.reset(now_nanos);
                cell.put(state);
                Outcome::Done
            }
            Command::AvailableTokens => Outcome::Available(state.available()),
            Command::GetConfiguration => Outcome::Configuration(state.config().clone()),
            Command::ReplaceConfiguration { config, inheritance } => {
                let version = state.config_version();
                state.replace_config(config.clone(), version, *inheritance, now_nanos);
                cell.put(state);
                Outcome::Done
            }
            Command::Reserve { tokens, max_wait_nanos } => {
                let wait = state.nanos_until_available(*tokens, now_nanos);
                // NEVER first: an unbounded max_wait must not reserve an
                // impossible debt
                if wait == NEVER || wait > *max_wait_nanos {
                    Outcome::Wait(NEVER)
                } else {
                    state.reserve(*tokens);
                    cell.put(state);
                    Outcome::Wait(wait)
                }
            }
            Command::CreateIfAbsent { .. }
            | Command::EnsureConfiguration { .. }
            | Command::Batch { .. } => unreachable!("wrappers handled in apply"),
        }
    }

    /// Tokens this command would like to consume. An upper-bound hint used
    /// by synchronization layers; reads and credits report zero.
    pub fn estimated_demand(&self) -> u64 {
        match self {
            Command::TryConsume { tokens }
            | Command::TryConsumeAndReturnRemaining { tokens }
            | Command::Reserve { tokens, .. } => *tokens,
            Command::ConsumeUpTo { limit } => *limit,
            Command::CreateIfAbsent { inner, .. }
            | Command::EnsureConfiguration { inner, .. } => inner.estimated_demand(),
            Command::Batch { commands } => commands
                .iter()
                .map(Command::estimated_demand)
                .fold(0u64, u64::saturating_add),
            _ => 0,
        }
    }

    /// Whether applying this command to an absent row can create state.
    /// Drivers claim a row first only when this holds; otherwise a missing
    /// bucket is reported without writing anything.
    pub fn initializes(&self) -> bool {
        match self {
            Command::CreateIfAbsent { .. } | Command::EnsureConfiguration { .. } => true,
            Command::Batch { commands } => commands.iter().any(Command::initializes),
            _ => false,
        }
    }
}
