//! Broker core for the Parallax worker runtime.
//!
//! A broker is one peer of the fleet: it hosts worker instances, joins the
//! shared registry, listens for peer traffic, and cooperates in salvage
//! and recovery when peers die. Applications implement the [`Worker`]
//! trait, register classes on a [`BrokerBuilder`], and address any worker
//! in the fleet through an [`Agent`] regardless of where it lives.
//!
//! # Example
//!
//! ```ignore
//! use parallax_broker::{Broker, BrokerConfig, WorkerClass};
//!
//! let broker = Broker::builder(BrokerConfig::default())
//!     .register(WorkerClass::new("Greeter", || Arc::new(Greeter)))
//!     .build();
//! broker.start().await?;
//! let agent = broker.create("Greeter", CreateOptions::default()).await?;
//! let reply = agent.ask("greet", serde_json::json!({"name": "ada"})).await?;
//! ```

pub mod agent;
pub mod broker;
pub mod class;
pub mod config;
pub mod error;
pub mod rpc;
pub mod worker;

pub use agent::Agent;
pub use broker::{Broker, BrokerBuilder, BrokerState, CreateOptions, DestroyMode};
pub use class::WorkerClass;
pub use config::{BrokerCacheConfig, BrokerConfig, RetryConfig};
pub use error::{AskError, BrokerError, Result};
pub use worker::{
    CreateCause, CreateInfo, DestroyCause, DestroyInfo, HookError, Worker, WorkerContext,
    WorkerState,
};

pub use parallax_registry::{RegistryConfig, WorkerAttributes};
