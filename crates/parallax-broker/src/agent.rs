//! Location-transparent worker handles.

use serde_json::Value;
use std::sync::Weak;

use crate::broker::Shared;
use crate::error::{BrokerError, Result};

/// A lightweight, location-transparent handle to one worker.
///
/// Agents funnel through their broker's ask/tell machinery and work the
/// same whether the worker is local or on a peer. They become unusable
/// once the broker is destroyed.
#[derive(Clone)]
pub struct Agent {
    worker_id: String,
    name: String,
    shared: Weak<Shared>,
}

impl Agent {
    pub(crate) fn new(worker_id: String, name: String, shared: Weak<Shared>) -> Self {
        Self {
            worker_id,
            name,
            shared,
        }
    }

    /// The worker's system-wide identifier.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The worker's class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request/response exchange with the worker, under the broker's
    /// retry policy and RPC deadline.
    pub async fn ask(&self, method: &str, data: Value) -> Result<Value> {
        self.shared()?.ask(&self.worker_id, method, data).await
    }

    /// Fire-and-forget message; complete once the frame is flushed.
    pub async fn tell(&self, method: &str, data: Value) -> Result<()> {
        self.shared()?.tell(&self.worker_id, method, data).await
    }

    fn shared(&self) -> Result<std::sync::Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| BrokerError::InvalidState("broker is gone".to_owned()))
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("worker_id", &self.worker_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
