//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried inside raft-net envelopes
//! what: vote, replication, snapshot and forwarding requests with their replies

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    RequestVote {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    /// Response to a vote request
    RequestVoteReply {
        term: u64,
        vote_granted: bool,
        voter_id: u64,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        timestep: u64,
    },
    /// Response to AppendEntries; `conflict_index` lets the leader skip a whole term
    AppendEntriesReply {
        term: u64,
        success: bool,
        conflict_index: u64,
    },
    /// Replace a lagging follower's log prefix with the leader's snapshot
    InstallSnapshot {
        term: u64,
        leader_id: u64,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    },
    /// Response to InstallSnapshot
    InstallSnapshotReply {
        term: u64,
    },
    /// A proposal relayed by a non-leader to the leader it knows about
    ForwardedStart {
        command: Vec<u8>,
    },
    /// Where the leader placed a forwarded proposal
    ForwardedStartReply {
        index: u64,
        term: u64,
        accepted: bool,
    },
}

impl RaftMessage {
    /// Replies are matched to a waiting request instead of being handled
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            RaftMessage::RequestVoteReply { .. }
                | RaftMessage::AppendEntriesReply { .. }
                | RaftMessage::InstallSnapshotReply { .. }
                | RaftMessage::ForwardedStartReply { .. }
        )
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::RequestVoteReply { .. } => "RequestVoteReply",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendEntriesReply { .. } => "AppendEntriesReply",
            RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
            RaftMessage::InstallSnapshotReply { .. } => "InstallSnapshotReply",
            RaftMessage::ForwardedStart { .. } => "ForwardedStart",
            RaftMessage::ForwardedStartReply { .. } => "ForwardedStartReply",
        }
    }
}
