//! Error types for the engine.
//!
//! The taxonomy mirrors the failure modes of remote execution:
//! configuration misuse fails fast, storage failures abort the transaction
//! and propagate, CAS contention is retried up to a budget before
//! surfacing, and timeouts force a rollback first.
//!
//! `Error` is `Clone` on purpose: the batching layer merges many callers into
//! one remote call, and a failed composite must deliver the identical error
//! to every waiter.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigError;

/// Unified runtime error for bucket operations.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The engine was configured in a way the backend cannot honor.
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable description of the misuse.
        message: String,
    },
    /// The underlying store failed while executing a transaction step.
    #[error("storage execution failed: {source}")]
    StorageExecution {
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// A compare-and-swap backend kept observing concurrent writes until the
    /// retry budget ran out.
    #[error("compare-and-swap contention persisted after {retries} retries")]
    Contention {
        /// Number of conflicting attempts before giving up.
        retries: usize,
    },
    /// The request deadline expired; the in-flight transaction was rolled
    /// back before this surfaced.
    #[error("request timed out after {elapsed:?} (budget {budget:?})")]
    Timeout { elapsed: Duration, budget: Duration },
    /// Persisted state could not be decoded (truncated bytes or a wire
    /// version this build does not understand).
    #[error("undecodable remote state: {detail}")]
    Codec {
        /// What went wrong while decoding.
        detail: String,
    },
}

impl Error {
    /// Wrap a store/driver failure.
    pub fn storage<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::StorageExecution { source: Arc::new(source) }
    }

    /// Build a configuration error from anything displayable.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration { message: message.into() }
    }

    /// Build a codec error from anything displayable.
    pub fn codec(detail: impl Into<String>) -> Self {
        Error::Codec { detail: detail.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Contention { .. })
    }

    /// True for failures originating in the storage layer, including the
    /// timeout variant (a timeout is a storage execution failure that was
    /// preceded by a forced rollback).
    pub fn is_storage_related(&self) -> bool {
        matches!(self, Error::StorageExecution { .. } | Error::Timeout { .. })
    }
}

/// Lets configuration suppliers build limits with `?`.
impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::configuration(err.to_string())
    }
}
