//! Registry scripts and client for the Parallax worker runtime.
//!
//! The registry (any Redis/Valkey-compatible store) is the single central
//! coordination point of a Parallax fleet. Every multi-key mutation runs
//! inside one of eight server-side atomic scripts: broker join, broker
//! selection, find-or-create, find, health-check, salvage,
//! fetch-for-recovery, and worker destroy. Peer traffic itself never
//! touches the registry; its pub/sub channels carry only control signals
//! and liveness probes.
//!
//! [`Registry`] wraps a connection pool, the script set, key derivation,
//! server-time access, and the administrative single commands used for
//! load updates and teardown.

pub mod client;
pub mod error;
pub mod keys;
pub mod records;
pub mod reply;
pub mod scripts;

pub use client::{DestroyWorkerMode, FindOrCreateArgs, JoinArgs, Registry, RegistryConfig, SalvageMode};
pub use error::{RegistryError, Result};
pub use keys::Keys;
pub use records::{BrokerRecord, BrokerState, WorkerAttributes, WorkerRecord};
pub use reply::{
    FindBrokerReply, FindOrCreateReply, HealthCheckReply, PickedBroker, RecoveryBatch,
};
