//! # config
//!
//! why: keep transport and rpc timing knobs in one serializable place
//! relations: read by network.rs, embedded in raft-runtime's NodeConfig
//! what: NetworkConfig with defaults for a small lossy mesh

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Network configuration (durations in milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address to bind; port 0 picks a free one
    pub listen_addr: SocketAddr,
    /// Distributors relay traffic but are never reported as cluster peers
    pub distributor: bool,
    /// Deadline for a single request/reply round trip
    pub request_timeout_ms: u64,
    /// How often each neighbor is pinged
    pub keepalive_interval_ms: u64,
    /// Consecutive unanswered pings before a neighbor is dropped
    pub keepalive_max_misses: u32,
    /// Period of unsolicited routing announcements
    pub announce_interval_ms: u64,
    /// Relays after which an envelope is discarded
    pub max_hops: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            distributor: false,
            request_timeout_ms: 1000,
            keepalive_interval_ms: 500,
            keepalive_max_misses: 5,
            announce_interval_ms: 1000,
            max_hops: 16,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be > 0".to_string());
        }
        if self.keepalive_interval_ms == 0 || self.announce_interval_ms == 0 {
            return Err("keepalive and announce intervals must be > 0".to_string());
        }
        if self.keepalive_max_misses == 0 {
            return Err("keepalive_max_misses must be > 0".to_string());
        }
        if self.max_hops == 0 {
            return Err("max_hops must be > 0".to_string());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }
}
