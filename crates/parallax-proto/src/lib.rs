//! Wire protocol for Parallax peer traffic and control signals.
//!
//! Peer brokers exchange single-payload frames over TCP: each frame is a
//! JSON-serialised [`PeerMessage`] prefixed by a big-endian `u16` byte
//! count. The registry's pub/sub channels carry only the control
//! [`Signal`] grammar and empty liveness probes, never request data.

pub mod error;
pub mod frame;
pub mod message;
pub mod signal;

pub use error::ProtocolError;
pub use frame::{encode_frame, FrameDecoder, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use message::{ErrorBody, PeerMessage, ResponseBody};
pub use signal::Signal;
