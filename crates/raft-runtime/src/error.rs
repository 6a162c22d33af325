//! # error
//!
//! why: one error for bringing a node up from configuration
//! relations: returned by config.rs and engine::launch
//! what: RuntimeError enum

use raft_core::RaftError;
use raft_net::NetworkError;
use thiserror::Error;

/// Errors from loading configuration or starting a node
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Raft(#[from] RaftError),
}
