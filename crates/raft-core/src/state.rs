//! # state
//!
//! why: name the pieces of node state that cross the persistence and application seams
//! relations: produced by node.rs, stored by raft-storage, delivered by raft-runtime
//! what: HardState, PersistentState, Snapshot, ApplyMsg

use serde::{Deserialize, Serialize};

use crate::Log;

/// Term and vote, written together on every term transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
}

/// Everything a node must get back after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub log: Log,
    pub snapshot: Option<Snapshot>,
}

/// Opaque application state covering the log up to `last_included_index`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

/// Delivered to the application, strictly in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed command
    Command {
        command: Vec<u8>,
        index: u64,
        timestep: u64,
    },
    /// Restore from a snapshot before any later command is applied
    Snapshot {
        data: Vec<u8>,
        index: u64,
        term: u64,
    },
}

impl ApplyMsg {
    /// Log index this message brings the application up to
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}
