//! # error
//!
//! why: one error type for everything the consensus layer can report
//! relations: returned by log.rs and node.rs, wrapped by raft-runtime
//! what: RaftError enum

use thiserror::Error;

/// Errors surfaced by the consensus layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// This node cannot accept proposals; `leader` is the best known leader
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    /// Compaction was asked for an index that is not retained in the log
    #[error("cannot compact to index {index}: retained range is ({first}, {last}]")]
    CompactionOutOfRange { index: u64, first: u64, last: u64 },

    /// Entry indices do not line up with their log positions
    #[error("corrupt log: expected index {expected}, found {found}")]
    CorruptLog { expected: u64, found: u64 },

    /// A command or snapshot too large to ever fit in one message
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    /// Timing or batching values that cannot drive a node
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Durable storage failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Forwarding or another network round trip failed
    #[error("network error: {0}")]
    Network(String),
}
