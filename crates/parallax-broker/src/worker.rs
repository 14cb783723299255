//! The worker contract.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Weak;

use parallax_registry::WorkerAttributes;

use crate::broker::Shared;
use crate::error::{AskError, BrokerError, Result};

/// Why a worker instance is being constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateCause {
    /// A fresh create.
    New,
    /// Re-creation of a salvaged worker on a surviving broker.
    Recovery,
}

/// Why a worker instance is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyCause {
    /// The worker destroyed itself.
    SelfRequested,
    /// The owning broker is shutting the worker down.
    System,
}

/// Context passed to `on_create`.
#[derive(Debug, Clone, Copy)]
pub struct CreateInfo {
    pub cause: CreateCause,
}

/// Context passed to `on_destroy`.
#[derive(Debug, Clone, Copy)]
pub struct DestroyInfo {
    pub cause: DestroyCause,
}

/// Worker instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Inactive = 0,
    Activating = 1,
    Active = 2,
    Destroying = 3,
    Destroyed = 4,
}

impl WorkerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Inactive,
            1 => Self::Activating,
            2 => Self::Active,
            3 => Self::Destroying,
            _ => Self::Destroyed,
        }
    }
}

/// Application error type for worker hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// The application side of a worker.
///
/// Hooks run serialised per worker: `on_create` completes before any
/// `on_ask`/`on_tell` dispatch, and `on_destroy` runs behind in-flight
/// asks. Errors from `on_create`, `on_destroy`, and `on_tell` are logged
/// and swallowed; an [`AskError`] from `on_ask` travels back to the
/// asking agent with its name and message preserved.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Called once after construction, before any message dispatch.
    async fn on_create(
        &self,
        ctx: &WorkerContext,
        info: CreateInfo,
    ) -> std::result::Result<(), HookError> {
        let _ = (ctx, info);
        Ok(())
    }

    /// Called once before the instance is dropped.
    async fn on_destroy(
        &self,
        ctx: &WorkerContext,
        info: DestroyInfo,
    ) -> std::result::Result<(), HookError> {
        let _ = (ctx, info);
        Ok(())
    }

    /// Handles a request/response exchange.
    async fn on_ask(
        &self,
        ctx: &WorkerContext,
        method: &str,
        data: Value,
    ) -> std::result::Result<Value, AskError> {
        let _ = (ctx, data);
        Err(AskError::new(
            "NotImplemented",
            format!("no ask handler for method {method}"),
        ))
    }

    /// Handles a fire-and-forget message.
    async fn on_tell(
        &self,
        ctx: &WorkerContext,
        method: &str,
        data: Value,
    ) -> std::result::Result<(), HookError> {
        let _ = (ctx, method, data);
        Ok(())
    }
}

/// A worker's handle onto itself and its broker.
///
/// Workers refer to their broker through a validity-checked weak handle
/// rather than a raw back-pointer; a context outlives broker destroy but
/// every operation on it then fails with an invalid-state error.
pub struct WorkerContext {
    pub(crate) worker_id: String,
    pub(crate) attributes: WorkerAttributes,
    pub(crate) state: AtomicU8,
    pub(crate) load: AtomicU32,
    pub(crate) pending_destroy: AtomicBool,
    pub(crate) broker: Weak<Shared>,
}

impl WorkerContext {
    /// The worker's system-wide identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.worker_id
    }

    /// The attribute bag the worker was created with.
    #[must_use]
    pub fn attributes(&self) -> &WorkerAttributes {
        &self.attributes
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current load value.
    #[must_use]
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Acquire)
    }

    /// Replaces the worker's load value.
    ///
    /// Rejected once the worker is destroyed. A changed value marks the
    /// broker's aggregate dirty and triggers a single-shot score update;
    /// if that write fails, the periodic tick recomputes.
    pub fn set_load(&self, load: u32) -> Result<()> {
        if self.state() == WorkerState::Destroyed {
            return Err(BrokerError::InvalidState(format!(
                "worker {} is destroyed",
                self.worker_id
            )));
        }
        let previous = self.load.swap(load, Ordering::AcqRel);
        if previous != load {
            if let Some(shared) = self.broker.upgrade() {
                shared.mark_load_dirty();
                tokio::spawn(async move {
                    shared.flush_load().await;
                });
            }
        }
        Ok(())
    }

    /// Destroys this worker.
    ///
    /// While the worker is still activating the destroy is deferred and
    /// performed at the end of `on_create`. While active the teardown is
    /// scheduled behind whatever dispatch is in flight, so a worker may
    /// destroy itself from inside its own handlers. Self-destruction is
    /// non-recoverable.
    pub fn destroy(&self) -> Result<()> {
        match self.state() {
            WorkerState::Inactive | WorkerState::Activating => {
                self.pending_destroy.store(true, Ordering::Release);
                Ok(())
            }
            WorkerState::Active => {
                let shared = self.broker.upgrade().ok_or_else(|| {
                    BrokerError::InvalidState("broker is gone".to_owned())
                })?;
                let worker_id = self.worker_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = shared
                        .destroy_local_worker(&worker_id, DestroyCause::SelfRequested)
                        .await
                    {
                        tracing::warn!(worker_id = %worker_id, error = %e, "self-destroy failed");
                    }
                });
                Ok(())
            }
            WorkerState::Destroying | WorkerState::Destroyed => Err(BrokerError::InvalidState(
                format!("worker {} is already destroyed", self.worker_id),
            )),
        }
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.worker_id)
            .field("state", &self.state())
            .field("load", &self.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context(state: WorkerState) -> WorkerContext {
        WorkerContext {
            worker_id: "W#1".to_owned(),
            attributes: WorkerAttributes::default(),
            state: AtomicU8::new(state as u8),
            load: AtomicU32::new(0),
            pending_destroy: AtomicBool::new(false),
            broker: Weak::new(),
        }
    }

    #[test]
    fn state_roundtrip() {
        for state in [
            WorkerState::Inactive,
            WorkerState::Activating,
            WorkerState::Active,
            WorkerState::Destroying,
            WorkerState::Destroyed,
        ] {
            assert_eq!(WorkerState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn set_load_rejected_when_destroyed() {
        let ctx = make_context(WorkerState::Destroyed);
        assert!(matches!(
            ctx.set_load(5),
            Err(BrokerError::InvalidState(_))
        ));

        let ctx = make_context(WorkerState::Active);
        ctx.set_load(5).unwrap();
        assert_eq!(ctx.load(), 5);
    }

    #[test]
    fn destroy_while_activating_is_deferred() {
        let ctx = make_context(WorkerState::Activating);
        ctx.destroy().unwrap();
        assert!(ctx.pending_destroy.load(Ordering::Acquire));
        assert_eq!(ctx.state(), WorkerState::Activating);
    }

    #[test]
    fn destroy_twice_is_rejected() {
        let ctx = make_context(WorkerState::Destroyed);
        assert!(matches!(ctx.destroy(), Err(BrokerError::InvalidState(_))));
    }
}
