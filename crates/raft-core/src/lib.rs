//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime, persisted via raft-storage, carried by raft-net
//! what: state machine, election logic, log management, snapshots, message types

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state;

pub use config::RaftConfig;
pub use error::RaftError;
pub use log::{Log, LogEntry};
pub use message::RaftMessage;
pub use node::{NodeState, RaftNode};
pub use state::{ApplyMsg, HardState, PersistentState, Snapshot};
