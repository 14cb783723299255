//! Error types for the protocol.

use thiserror::Error;

/// Protocol errors.
///
/// Any of these on a live peer socket is fatal to that connection: the
/// receiver tears the stream down and the other side reacts through its
/// normal close path.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload exceeds the 16-bit frame length field.
    #[error("frame payload too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Payload decode failure.
    #[error("deserialisation error: {0}")]
    Deserialisation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
