//! # raft-runtime
//!
//! why: run a raft node for real, with timers, persistence and a network underneath
//! relations: drives raft-core, persists through raft-storage, talks over raft-net
//! what: Raft engine handle, NodeConfig, ScheduledTask, tracing setup

pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;
pub mod timer;

pub use config::NodeConfig;
pub use engine::{launch, Proposal, Raft, Status};
pub use error::RuntimeError;
pub use telemetry::init_tracing;
pub use timer::ScheduledTask;
