//! Error types for the router.

use parallax_proto::ProtocolError;
use thiserror::Error;

/// Router errors.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The router was closed.
    #[error("router is closed")]
    Closed,

    /// Connecting to a peer failed.
    #[error("connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// A write on an established connection failed.
    #[error("write to {addr} failed: {reason}")]
    Write { addr: String, reason: String },

    /// The connection died before a queued request was written.
    #[error("connection to {addr} closed before the request was written")]
    Dropped { addr: String },

    /// Frame encode/decode failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;
