//! # config
//!
//! why: keep protocol timing and batching knobs in one serializable place
//! relations: held by node.rs, read by raft-runtime timers
//! what: RaftConfig with defaults tuned for a lossy game mesh

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::log::{ENCODED_BYTE_WIDTH, ENTRY_OVERHEAD};

/// Timing and batching configuration (all durations in milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// How often a leader sends AppendEntries even with nothing new
    pub heartbeat_interval: u64,
    /// Window in which proposals are coalesced into one replication round
    pub batch_interval: u64,
    /// Cap on entries per AppendEntries
    pub max_entries_per_append: usize,
    /// Cap on the encoded entry bytes per AppendEntries so a message fits in one datagram
    pub max_append_bytes: usize,
    /// If set, the node advances its logical timestep on this period
    pub timestep_period: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 600,
            election_timeout_max: 900,
            heartbeat_interval: 100,
            batch_interval: 10,
            max_entries_per_append: 64,
            max_append_bytes: 48 * 1024,
            timestep_period: None,
        }
    }
}

impl RaftConfig {
    /// Check internal consistency of the timing values
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(format!(
                "election timeout range {}..{} is invalid",
                self.election_timeout_min, self.election_timeout_max
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err("heartbeat_interval must be below election_timeout_min".to_string());
        }
        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }
        if self.max_append_bytes <= ENTRY_OVERHEAD {
            return Err(format!("max_append_bytes must exceed {ENTRY_OVERHEAD}"));
        }
        Ok(())
    }

    /// Largest command or snapshot that still fits in a single message
    pub fn max_payload_len(&self) -> usize {
        self.max_append_bytes.saturating_sub(ENTRY_OVERHEAD) / ENCODED_BYTE_WIDTH
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn batch(&self) -> Duration {
        Duration::from_millis(self.batch_interval)
    }
}
