//! Error types for the broker.

use parallax_registry::RegistryError;
use parallax_router::RouterError;
use thiserror::Error;

/// Broker errors, reported by category.
///
/// Transient script conditions are retried inside the backoff drivers and
/// never surface here.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No such worker, no broker in the cluster, or the owner could not
    /// be determined within the retry budget.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target broker was invalidated or the connection failed; a
    /// health/salvage cycle is typically already in motion.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// An ask exceeded its deadline, or retries exhausted their budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation is not permitted in the current broker/worker state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed script reply or registry connection loss.
    #[error("registry fault: {0}")]
    Registry(#[from] RegistryError),

    /// An application error raised by a worker's ask handler, with its
    /// name and message preserved across the wire.
    #[error("{name}: {message}")]
    Application { name: String, message: String },
}

impl From<RouterError> for BrokerError {
    fn from(error: RouterError) -> Self {
        Self::Unreachable(error.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// An error raised by a worker's `on_ask` handler.
///
/// The name and message travel to the asking agent verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskError {
    pub name: String,
    pub message: String,
}

impl AskError {
    /// Creates an application error.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for AskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_errors_surface_as_unreachable() {
        let error: BrokerError = RouterError::Closed.into();
        assert!(matches!(error, BrokerError::Unreachable(_)));
    }

    #[test]
    fn ask_error_display() {
        let error = AskError::new("RangeError", "out of bounds");
        assert_eq!(error.to_string(), "RangeError: out of bounds");
    }
}
