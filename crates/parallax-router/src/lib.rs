//! Peer-to-peer message router for the Parallax worker runtime.
//!
//! Owns every peer socket: an inbound listener whose accepted connections
//! are tagged with a monotonic requester id, and a table of outbound
//! connections reused across requests. Inbound frames surface as
//! [`RouterEvent::Request`], frames on outbound connections as
//! [`RouterEvent::Response`]; connection loss surfaces as
//! [`RouterEvent::Disconnect`].

pub mod connection;
pub mod error;
pub mod router;

pub use error::{Result, RouterError};
pub use router::{Router, RouterConfig, RouterEvent};
