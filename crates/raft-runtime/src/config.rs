//! # config
//!
//! why: describe a whole node (identity, cluster, timing, network, storage) in one file
//! relations: consumed by engine::launch
//! what: NodeConfig with json loading and validation

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use raft_core::RaftConfig;
use raft_net::transport::MAX_DATAGRAM;
use raft_net::NetworkConfig;
use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Room in a datagram for the envelope and message fields around the entries
const ENVELOPE_HEADROOM: usize = 1024;

/// Everything needed to launch one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Every node id in the cluster, this one included
    pub cluster: Vec<u64>,
    /// Addresses dialed at startup to join the mesh
    #[serde(default)]
    pub seeds: Vec<SocketAddr>,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Durable state lives here; in memory when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new(node_id: u64, cluster: Vec<u64>) -> Self {
        Self {
            node_id,
            cluster,
            seeds: Vec::new(),
            raft: RaftConfig::default(),
            network: NetworkConfig::default(),
            data_dir: None,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !self.cluster.contains(&self.node_id) {
            return Err(RuntimeError::Config(format!(
                "node {} is not a member of cluster {:?}",
                self.node_id, self.cluster
            )));
        }
        let mut members = self.cluster.clone();
        members.sort_unstable();
        members.dedup();
        if members.len() != self.cluster.len() {
            return Err(RuntimeError::Config("cluster lists a node twice".to_string()));
        }
        self.raft.validate().map_err(RuntimeError::Config)?;
        if self.raft.max_append_bytes + ENVELOPE_HEADROOM > MAX_DATAGRAM {
            return Err(RuntimeError::Config(format!(
                "max_append_bytes {} leaves no room for the envelope in a {} byte datagram",
                self.raft.max_append_bytes, MAX_DATAGRAM
            )));
        }
        self.network.validate().map_err(RuntimeError::Config)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: NodeConfig = serde_json::from_str(r#"{"node_id": 2, "cluster": [1, 2, 3]}"#).unwrap();
        assert_eq!(config, NodeConfig::new(2, vec![1, 2, 3]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn node_outside_cluster_is_rejected() {
        let config = NodeConfig::new(4, vec![1, 2, 3]);
        assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let config = NodeConfig::new(1, vec![1, 2, 2]);
        assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn bad_timing_is_rejected() {
        let mut config = NodeConfig::new(1, vec![1]);
        config.raft.heartbeat_interval = config.raft.election_timeout_min;
        assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn append_batch_larger_than_a_datagram_is_rejected() {
        let mut config = NodeConfig::new(1, vec![1]);
        config.raft.max_append_bytes = MAX_DATAGRAM;
        assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));

        config.raft.max_append_bytes = MAX_DATAGRAM - ENVELOPE_HEADROOM;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node_id": 1,
                "cluster": [1, 2, 3],
                "seeds": ["127.0.0.1:7001"],
                "raft": {{"heartbeat_interval": 50}},
                "data_dir": "/var/lib/raft/1"
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.seeds, vec!["127.0.0.1:7001".parse::<SocketAddr>().unwrap()]);
        assert_eq!(config.raft.heartbeat_interval, 50);
        assert_eq!(config.raft.election_timeout_min, 600);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/raft/1")));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = NodeConfig::from_json_file("/nonexistent/raft.json");
        assert!(matches!(result, Err(RuntimeError::Io(_))));
    }
}
