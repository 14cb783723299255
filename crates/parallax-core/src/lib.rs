//! Shared utilities for the Parallax worker runtime.
//!
//! Small, dependency-light building blocks used across the workspace:
//!
//! - [`CyclicSeq`]: a concurrent sequence counter wrapping below 2^53
//! - [`hash_key`]: stable 53-bit numeric derivation from an identifier
//! - [`AddressCache`]: an LRU cache of broker addresses with max-age expiry
//! - [`Backoff`]: exponential retry delays with a ceiling and a total budget

pub mod backoff;
pub mod cache;
pub mod hashkey;
pub mod seq;

pub use backoff::{Backoff, RetryPolicy};
pub use cache::{AddressCache, CacheConfig};
pub use hashkey::hash_key;
pub use seq::{CyclicSeq, SEQ_LIMIT};
