//! Command executors: the seam between bucket handles and backends.
//!
//! A [`CommandExecutor`] is bound to one key. The direct implementation,
//! [`BackendExecutor`], wraps each command in a [`Request`] envelope and
//! performs exactly one backend round trip; it adds no batching and no
//! caching, which is what makes it the correctness baseline the
//! synchronization decorators must preserve.

use async_trait::async_trait;
use std::sync::Arc;

use crate::backend::Backend;
use crate::command::{Command, CommandResult};
use crate::error::Error;
use crate::time::TimeSource;
use crate::wire::{ExpirationPolicy, Request, WireVersion};

/// Client-side knobs shaping every request an executor sends.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Wire version backends are asked to write.
    pub version: WireVersion,
    /// Clock shipped with each request. `None` defers to the backend's
    /// clock; tests pin this to a manual source.
    pub client_time: Option<Arc<dyn TimeSource>>,
    /// TTL policy attached to every write.
    pub expiration: Option<ExpirationPolicy>,
}

/// Executes commands against one bucket.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> Result<CommandResult, Error>;
}

/// Direct executor: one command, one round trip.
pub struct BackendExecutor<K> {
    backend: Arc<dyn Backend<K>>,
    key: K,
    config: ClientConfig,
}

impl<K> BackendExecutor<K>
where
    K: Send + Sync,
{
    pub fn new(backend: Arc<dyn Backend<K>>, key: K, config: ClientConfig) -> Self {
        BackendExecutor { backend, key, config }
    }
}

#[async_trait]
impl<K> CommandExecutor for BackendExecutor<K>
where
    K: Send + Sync,
{
    async fn execute(&self, command: Command) -> Result<CommandResult, Error> {
        let mut request = Request::new(command);
        request.version = self.config.version;
        request.client_time_nanos =
            self.config.client_time.as_ref().map(|clock| clock.now_nanos());
        request.expiration = self.config.expiration;
        self.backend.execute(&self.key, request).await
    }
}
