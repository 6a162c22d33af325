//! Cluster harness over real UDP sockets on localhost.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raft_core::{ApplyMsg, RaftConfig};
use raft_net::{Network, NetworkConfig};
use raft_runtime::{init_tracing, Raft};
use raft_storage::FileStorage;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEADLINE: Duration = Duration::from_secs(8);

pub fn fast_raft() -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 30,
        batch_interval: 5,
        max_entries_per_append: 64,
        max_append_bytes: 48 * 1024,
        timestep_period: None,
    }
}

pub fn fast_network() -> NetworkConfig {
    NetworkConfig {
        request_timeout_ms: 150,
        keepalive_interval_ms: 100,
        // an isolation longer than 300ms tears the mesh down and heals by redial
        keepalive_max_misses: 3,
        announce_interval_ms: 200,
        ..NetworkConfig::default()
    }
}

/// Poll `condition` every 10ms until it holds or `DEADLINE` passes
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Drain an apply stream into a shared list, checking index order on the way
pub fn collect(mut rx: mpsc::UnboundedReceiver<ApplyMsg>) -> (Arc<Mutex<Vec<ApplyMsg>>>, JoinHandle<()>) {
    let applied: Arc<Mutex<Vec<ApplyMsg>>> = Arc::default();
    let sink = applied.clone();
    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut applied = sink.lock();
            if let Some(last) = applied.last() {
                match &msg {
                    ApplyMsg::Command { index, .. } => assert_eq!(*index, last.index() + 1, "apply gap"),
                    ApplyMsg::Snapshot { index, .. } => assert!(*index > last.index(), "snapshot went backwards"),
                }
            }
            applied.push(msg);
        }
    });
    (applied, handle)
}

pub struct TestNode {
    pub id: u64,
    pub raft: Raft,
    pub network: Arc<Network>,
    pub applied: Arc<Mutex<Vec<ApplyMsg>>>,
    collector: JoinHandle<()>,
    dir: TempDir,
}

impl TestNode {
    /// Commands applied so far, in order
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.applied
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                ApplyMsg::Command { command, .. } => Some(command.clone()),
                ApplyMsg::Snapshot { .. } => None,
            })
            .collect()
    }

    pub fn last_applied(&self) -> u64 {
        self.applied.lock().last().map_or(0, ApplyMsg::index)
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    members: Vec<u64>,
    config: RaftConfig,
}

#[allow(dead_code)]
impl TestCluster {
    /// `size` nodes with ids 1..=size, fully meshed, each with file storage
    pub async fn new(size: u64) -> Self {
        Self::with_config(size, fast_raft()).await
    }

    pub async fn with_config(size: u64, config: RaftConfig) -> Self {
        init_tracing("warn");
        let members: Vec<u64> = (1..=size).collect();

        let mut networks = Vec::new();
        for id in &members {
            networks.push(Network::bind(*id, fast_network()).await.unwrap());
        }
        for (i, network) in networks.iter().enumerate() {
            for other in &networks[i + 1..] {
                network.connect(other.local_addr()).await.unwrap();
            }
        }

        let mut nodes = Vec::new();
        for (id, network) in members.iter().zip(networks) {
            let dir = TempDir::new().unwrap();
            let storage = FileStorage::new(dir.path()).unwrap();
            let (raft, rx) = Raft::start(*id, members.clone(), config.clone(), network.clone(), Box::new(storage)).unwrap();
            let (applied, collector) = collect(rx);
            nodes.push(TestNode {
                id: *id,
                raft,
                network,
                applied,
                collector,
                dir,
            });
        }

        Self { nodes, members, config }
    }

    pub fn node(&self, id: u64) -> &TestNode {
        &self.nodes[(id - 1) as usize]
    }

    /// The live leader with the highest term, if any
    pub fn leader(&self) -> Option<u64> {
        self.nodes
            .iter()
            .filter(|n| !n.raft.is_dead())
            .map(|n| (n.raft.state(), n.id))
            .filter(|((_, is_leader), _)| *is_leader)
            .max_by_key(|((term, _), _)| *term)
            .map(|(_, id)| id)
    }

    pub async fn wait_for_leader(&self) -> u64 {
        assert!(eventually(|| self.leader().is_some()).await, "no leader elected");
        self.leader().unwrap()
    }

    /// A leader different from `old`, elected by the others
    pub async fn wait_for_new_leader(&self, old: u64) -> u64 {
        assert!(
            eventually(|| self.leader().is_some_and(|l| l != old)).await,
            "no replacement leader"
        );
        self.leader().unwrap()
    }

    /// Block until every listed node applied through `index`
    pub async fn wait_applied(&self, ids: &[u64], index: u64) {
        let done = eventually(|| ids.iter().all(|id| self.node(*id).last_applied() >= index)).await;
        let progress: Vec<u64> = ids.iter().map(|id| self.node(*id).last_applied()).collect();
        assert!(done, "nodes {ids:?} stuck at {progress:?}, wanted {index}");
    }

    pub fn others(&self, id: u64) -> Vec<u64> {
        self.members.iter().copied().filter(|m| *m != id).collect()
    }

    pub fn isolate(&self, id: u64) {
        self.node(id).network.set_drop_rate(1.0);
    }

    pub fn heal(&self, id: u64) {
        self.node(id).network.set_drop_rate(0.0);
    }

    /// Kill node `id` and start it again from its files on the same network
    pub fn restart(&mut self, id: u64) {
        let config = self.config.clone();
        let members = self.members.clone();
        let node = &mut self.nodes[(id - 1) as usize];
        node.raft.kill();
        node.collector.abort();

        let storage = FileStorage::new(node.dir.path()).unwrap();
        let (raft, rx) = Raft::start(id, members, config, node.network.clone(), Box::new(storage)).unwrap();
        let (applied, collector) = collect(rx);
        node.raft = raft;
        node.applied = applied;
        node.collector = collector;
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.raft.kill();
            node.network.shutdown();
        }
    }
}
