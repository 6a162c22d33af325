//! # error
//!
//! why: one error type for transport, routing and rpc failures
//! relations: returned by network.rs and transport.rs, mapped into RaftError by raft-runtime
//! what: NetworkError enum

use thiserror::Error;

use crate::NodeId;

/// Errors surfaced by the network substrate
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No reply arrived before the request deadline
    #[error("request timed out")]
    Timeout,

    /// Destination is neither a neighbor nor reachable through one
    #[error("no route to node {0}")]
    NoRoute(NodeId),

    /// A reply arrived but does not answer the request that was sent
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The link or the network was shut down while the request was in flight
    #[error("network closed")]
    Closed,
}
