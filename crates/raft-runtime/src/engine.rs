//! # engine
//!
//! why: turn the pure raft state machine into a running node
//! relations: wraps raft_core::RaftNode, persists through raft_storage::Storage,
//!            registers itself with raft_net::Network as the MessageHandler
//! what: Raft handle, election/heartbeat/batch/apply/timestep tasks, proposal
//!       forwarding, launch from NodeConfig

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use raft_core::{ApplyMsg, LogEntry, NodeState, RaftConfig, RaftError, RaftMessage, RaftNode};
use raft_net::{MessageHandler, Network, NodeId};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::timer::{election_timeout, ScheduledTask};
use crate::{NodeConfig, RuntimeError};

/// Replication rounds one catch-up pass may take before leaving the rest to the heartbeat
const MAX_CATCH_UP_ROUNDS: usize = 32;

/// Where a proposal landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
    /// False when the proposal was forwarded to the leader
    pub is_leader: bool,
}

/// Point-in-time view of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: NodeId,
    pub role: NodeState,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
    pub dead: bool,
}

/// Who should take a proposal
enum Route {
    Local,
    Forward(NodeId),
    Unknown,
}

/// Shared state behind every `Raft` handle
struct Engine {
    id: NodeId,
    me: Weak<Engine>,
    config: RaftConfig,
    // lock order: node before storage
    node: Mutex<RaftNode>,
    storage: Mutex<Box<dyn Storage + Send>>,
    network: Arc<Network>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    apply_ready: Arc<Notify>,
    dead: AtomicBool,
    election_deadline: Mutex<Instant>,
    batch_armed: AtomicBool,
    tasks: Mutex<Vec<ScheduledTask>>,
    heartbeat: Mutex<Option<ScheduledTask>>,
    batch: Mutex<Option<ScheduledTask>>,
}

fn peers_of(node: &RaftNode) -> Vec<NodeId> {
    node.cluster_nodes.iter().copied().filter(|n| *n != node.id).collect()
}

impl Engine {
    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn reset_election_timer(&self) {
        *self.election_deadline.lock() = Instant::now() + election_timeout(&self.config);
    }

    /// Write whatever the last mutation asked for; false means the node is now dead.
    ///
    /// Called with the node lock held so nothing leaves before it is durable.
    fn persist(&self, node: &mut RaftNode) -> bool {
        let snapshot = node.take_snapshot_request();
        let state = node.take_persist_request();
        if !snapshot && !state {
            return true;
        }

        let mut storage = self.storage.lock();
        let result = match (snapshot, node.snapshot.as_ref()) {
            (true, Some(snap)) => storage.save_snapshot(snap),
            _ => Ok(()),
        }
        .and_then(|()| {
            if state {
                storage.save_state(&node.hard_state(), &node.log)
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(node_id = self.id, term = node.current_term, error = %e, "persisting raft state failed, stopping node");
                self.die();
                false
            }
        }
    }

    fn die(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.stop_tasks();
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().iter() {
            task.stop();
        }
        if let Some(task) = self.heartbeat.lock().take() {
            task.stop();
        }
        if let Some(task) = self.batch.lock().take() {
            task.stop();
        }
        self.apply_ready.notify_one();
    }

    fn spawn_tasks(&self) {
        let mut tasks = vec![
            ScheduledTask::spawn("election", Self::election_loop(self.me.clone())),
            ScheduledTask::spawn("apply", Self::apply_loop(self.me.clone(), self.apply_ready.clone())),
        ];

        if let Some(period) = self.config.timestep_period {
            let me = self.me.clone();
            tasks.push(ScheduledTask::every("timestep", Duration::from_millis(period), move || {
                me.upgrade().is_some_and(|engine| engine.tick_timestep())
            }));
        }

        *self.tasks.lock() = tasks;
    }

    // -- election --

    async fn election_loop(me: Weak<Self>) {
        loop {
            let deadline = match me.upgrade() {
                Some(engine) if !engine.is_dead() => *engine.election_deadline.lock(),
                _ => return,
            };
            tokio::time::sleep_until(deadline).await;

            let Some(engine) = me.upgrade() else {
                return;
            };
            if engine.is_dead() {
                return;
            }
            // a reset while asleep pushed the deadline out
            if Instant::now() < *engine.election_deadline.lock() {
                continue;
            }
            engine.start_election();
        }
    }

    fn start_election(&self) {
        self.reset_election_timer();

        let (request, term, peers, won) = {
            let mut node = self.node.lock();
            if node.is_leader() {
                return;
            }
            let request = node.start_election();
            // a single-node cluster already has its quorum
            let won = node.has_quorum();
            if won {
                node.become_leader();
            }
            if !self.persist(&mut node) {
                return;
            }
            (request, node.current_term, peers_of(&node), won)
        };

        info!(node_id = self.id, term, "starting election");
        if won {
            self.lead(term);
            return;
        }

        let Some(engine) = self.me.upgrade() else {
            return;
        };
        for peer in peers {
            tokio::spawn(engine.clone().request_vote(peer, request.clone()));
        }
    }

    async fn request_vote(self: Arc<Self>, peer: NodeId, request: RaftMessage) {
        let reply = match self.network.send_and_receive(peer, request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(node_id = self.id, peer, error = %e, "vote request failed");
                return;
            }
        };
        let RaftMessage::RequestVoteReply { term, vote_granted, .. } = reply else {
            warn!(node_id = self.id, peer, kind = reply.kind(), "unexpected answer to a vote request");
            return;
        };
        if self.is_dead() {
            return;
        }

        let elected = {
            let mut node = self.node.lock();
            let elected = node.handle_vote_response(term, vote_granted, peer);
            if !self.persist(&mut node) {
                return;
            }
            elected.then_some(node.current_term)
        };
        if let Some(term) = elected {
            self.lead(term);
        }
    }

    // -- leadership --

    fn lead(&self, term: u64) {
        info!(node_id = self.id, term, "became leader");
        let me = self.me.clone();
        let task = ScheduledTask::every("heartbeat", self.config.heartbeat(), move || {
            let Some(engine) = me.upgrade() else {
                return false;
            };
            if engine.is_dead() {
                return false;
            }
            if !engine.leads_term(term) {
                info!(node_id = engine.id, term, "no longer leader");
                return false;
            }
            engine.replicate_all();
            true
        });
        *self.heartbeat.lock() = Some(task);
    }

    fn leads_term(&self, term: u64) -> bool {
        let node = self.node.lock();
        node.is_leader() && node.current_term == term
    }

    fn replicate_all(&self) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        let peers = peers_of(&self.node.lock());
        for peer in peers {
            tokio::spawn(engine.clone().replicate(peer));
        }
    }

    /// Send `peer` what it is missing, repeating while it is still behind
    async fn replicate(self: Arc<Self>, peer: NodeId) {
        for _ in 0..MAX_CATCH_UP_ROUNDS {
            if self.is_dead() || !self.replicate_once(peer).await {
                return;
            }
        }
    }

    /// One AppendEntries or InstallSnapshot round trip; true if `peer` still lags
    async fn replicate_once(&self, peer: NodeId) -> bool {
        let (request, request_term) = {
            let node = self.node.lock();
            match node.create_append_entries(peer) {
                Some(request) => (request, node.current_term),
                None => return false,
            }
        };
        // the index the follower will have matched once this request succeeds
        let covered = match &request {
            RaftMessage::AppendEntries {
                prev_log_index,
                entries,
                ..
            } => prev_log_index + entries.len() as u64,
            RaftMessage::InstallSnapshot {
                last_included_index, ..
            } => *last_included_index,
            _ => return false,
        };
        let kind = request.kind();

        let reply = match self.network.send_and_receive(peer, request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(node_id = self.id, peer, kind, error = %e, "replication request failed");
                return false;
            }
        };
        if self.is_dead() {
            return false;
        }

        let mut node = self.node.lock();
        let committed = match reply {
            RaftMessage::AppendEntriesReply {
                term,
                success,
                conflict_index,
            } => node.handle_append_entries_response(peer, request_term, term, success, conflict_index, covered),
            RaftMessage::InstallSnapshotReply { term } => {
                node.handle_install_snapshot_response(peer, request_term, term, covered);
                false
            }
            other => {
                warn!(node_id = self.id, peer, kind = other.kind(), "unexpected answer to replication");
                return false;
            }
        };
        if !self.persist(&mut node) {
            return false;
        }
        if committed {
            debug!(node_id = self.id, commit_index = node.commit_index, "commit index advanced");
            self.apply_ready.notify_one();
        }

        node.is_leader() && node.next_index.get(&peer).is_some_and(|next| *next <= node.log.last_index())
    }

    // -- proposals --

    fn route(&self) -> Route {
        let node = self.node.lock();
        if node.is_leader() {
            return Route::Local;
        }
        match node.current_leader.filter(|leader| *leader != self.id) {
            Some(leader) => Route::Forward(leader),
            None => Route::Unknown,
        }
    }

    /// Append on this node if it leads; otherwise the best known leader
    fn append_local(&self, command: Vec<u8>) -> Result<LogEntry, Option<NodeId>> {
        let entry = {
            let mut node = self.node.lock();
            if !node.is_leader() {
                return Err(node.current_leader.filter(|leader| *leader != self.id));
            }
            if let Err(e) = node.check_payload(command.len()) {
                warn!(node_id = self.id, error = %e, "refusing proposal");
                return Err(None);
            }
            let entry = node.append_entry(command);
            let committed = node.advance_commit_index();
            if !self.persist(&mut node) {
                return Err(None);
            }
            if committed {
                self.apply_ready.notify_one();
            }
            entry
        };
        self.arm_batch();
        Ok(entry)
    }

    /// Coalesce proposals arriving within one batch interval into one replication round
    fn arm_batch(&self) {
        if self.batch_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.me.clone();
        let task = ScheduledTask::after("batch", self.config.batch(), move || {
            if let Some(engine) = me.upgrade() {
                engine.batch_armed.store(false, Ordering::SeqCst);
                engine.replicate_all();
            }
        });
        *self.batch.lock() = Some(task);
    }

    fn accept_forwarded(&self, from: NodeId, command: Vec<u8>) -> RaftMessage {
        match self.append_local(command) {
            Ok(entry) => {
                debug!(node_id = self.id, from, index = entry.index, "accepted forwarded proposal");
                RaftMessage::ForwardedStartReply {
                    index: entry.index,
                    term: entry.term,
                    accepted: true,
                }
            }
            Err(_) => RaftMessage::ForwardedStartReply {
                index: 0,
                term: self.node.lock().current_term,
                accepted: false,
            },
        }
    }

    // -- background work --

    async fn apply_loop(me: Weak<Self>, ready: Arc<Notify>) {
        loop {
            let delivered = {
                let Some(engine) = me.upgrade() else {
                    return;
                };
                if engine.is_dead() {
                    return;
                }
                let committed: Vec<ApplyMsg> = {
                    let mut node = engine.node.lock();
                    std::iter::from_fn(|| node.next_apply()).collect()
                };
                for msg in &committed {
                    if engine.apply_tx.send(msg.clone()).is_err() {
                        debug!(node_id = engine.id, "apply receiver dropped, stopping delivery");
                        return;
                    }
                }
                !committed.is_empty()
            };
            if !delivered {
                ready.notified().await;
            }
        }
    }

    fn tick_timestep(&self) -> bool {
        if self.is_dead() {
            return false;
        }
        let mut node = self.node.lock();
        if node.is_leader() {
            node.timestep += 1;
        }
        true
    }
}

impl MessageHandler for Engine {
    fn handle(&self, from: NodeId, message: RaftMessage) -> Option<RaftMessage> {
        if self.is_dead() {
            return None;
        }

        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let (reply, granted) = {
                    let mut node = self.node.lock();
                    let outcome = node.handle_vote_request(term, candidate_id, last_log_index, last_log_term);
                    if !self.persist(&mut node) {
                        return None;
                    }
                    outcome
                };
                if granted {
                    debug!(node_id = self.id, candidate = candidate_id, term, "granted vote");
                    self.reset_election_timer();
                }
                Some(reply)
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                timestep,
            } => {
                let (reply, from_leader, committed) = {
                    let mut node = self.node.lock();
                    let before = node.commit_index;
                    let (reply, from_leader) = node.handle_append_entries(
                        term,
                        leader_id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit,
                        timestep,
                    );
                    if !self.persist(&mut node) {
                        return None;
                    }
                    (reply, from_leader, node.commit_index > before)
                };
                if from_leader {
                    self.reset_election_timer();
                }
                if committed {
                    self.apply_ready.notify_one();
                }
                Some(reply)
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
            } => {
                let (reply, from_leader) = {
                    let mut node = self.node.lock();
                    let outcome =
                        node.handle_install_snapshot(term, leader_id, last_included_index, last_included_term, data);
                    if !self.persist(&mut node) {
                        return None;
                    }
                    outcome
                };
                if from_leader {
                    info!(node_id = self.id, leader = leader_id, last_included_index, "installed snapshot");
                    self.reset_election_timer();
                    self.apply_ready.notify_one();
                }
                Some(reply)
            }
            RaftMessage::ForwardedStart { command } => Some(self.accept_forwarded(from, command)),
            reply => {
                debug!(node_id = self.id, from, kind = reply.kind(), "reply delivered as a request, ignoring");
                None
            }
        }
    }
}

/// Handle to a running raft node; clones share the node
#[derive(Clone)]
pub struct Raft {
    engine: Arc<Engine>,
}

impl Raft {
    /// Restore from `storage`, register with `network` and start the node's tasks.
    ///
    /// Must be called from within a tokio runtime.
    /// Committed entries come out of the returned receiver in log order,
    /// starting with the persisted snapshot if there is one.
    pub fn start(
        id: NodeId,
        cluster: Vec<NodeId>,
        config: RaftConfig,
        network: Arc<Network>,
        storage: Box<dyn Storage + Send>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ApplyMsg>), RaftError> {
        config.validate().map_err(RaftError::Config)?;
        let persisted = storage.load().map_err(|e| RaftError::Storage(e.to_string()))?;
        let node = RaftNode::restore(id, cluster, config.clone(), persisted);
        let (term, last_index, single) = (node.current_term, node.log.last_index(), node.cluster_nodes.len() == 1);

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let engine = Arc::new_cyclic(|me| Engine {
            id,
            me: me.clone(),
            election_deadline: Mutex::new(Instant::now() + election_timeout(&config)),
            config,
            node: Mutex::new(node),
            storage: Mutex::new(storage),
            network,
            apply_tx,
            apply_ready: Arc::new(Notify::new()),
            dead: AtomicBool::new(false),
            batch_armed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            heartbeat: Mutex::new(None),
            batch: Mutex::new(None),
        });

        let handler: Weak<Engine> = Arc::downgrade(&engine);
        engine.network.set_handler(handler);
        engine.spawn_tasks();
        info!(node_id = id, term, last_index, "raft node started");

        if single {
            engine.start_election();
        }
        Ok((Self { engine }, apply_rx))
    }

    pub fn id(&self) -> NodeId {
        self.engine.id
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.engine.network
    }

    /// Append `command` to the replicated log.
    ///
    /// A follower that knows the leader forwards the command there and
    /// reports where it landed with `is_leader == false`.
    pub async fn propose(&self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        if self.engine.is_dead() {
            return Err(RaftError::NotLeader { leader: None });
        }
        self.engine.node.lock().check_payload(command.len())?;

        match self.engine.route() {
            Route::Local => {
                let entry = self
                    .engine
                    .append_local(command)
                    .map_err(|leader| RaftError::NotLeader { leader })?;
                Ok(Proposal {
                    index: entry.index,
                    term: entry.term,
                    is_leader: true,
                })
            }
            Route::Forward(leader) => self.forward(leader, command).await,
            Route::Unknown => Err(RaftError::NotLeader { leader: None }),
        }
    }

    async fn forward(&self, leader: NodeId, command: Vec<u8>) -> Result<Proposal, RaftError> {
        debug!(node_id = self.engine.id, leader, "forwarding proposal");
        let reply = self
            .engine
            .network
            .send_and_receive(leader, RaftMessage::ForwardedStart { command })
            .await
            .map_err(|e| RaftError::Network(e.to_string()))?;

        match reply {
            RaftMessage::ForwardedStartReply {
                index,
                term,
                accepted: true,
            } => Ok(Proposal {
                index,
                term,
                is_leader: false,
            }),
            RaftMessage::ForwardedStartReply { accepted: false, .. } => Err(RaftError::NotLeader {
                leader: self.status().leader.filter(|l| *l != leader),
            }),
            other => Err(RaftError::Network(format!(
                "unexpected {} to a forwarded proposal",
                other.kind()
            ))),
        }
    }

    /// Replace the log through `index` with the application's `snapshot`
    pub fn compact(&self, index: u64, snapshot: Vec<u8>) -> Result<(), RaftError> {
        let mut node = self.engine.node.lock();
        node.compact(index, snapshot)?;
        if !self.engine.persist(&mut node) {
            return Err(RaftError::Storage("snapshot was not persisted".to_string()));
        }
        info!(node_id = self.engine.id, index, "compacted log");
        Ok(())
    }

    /// Stop every task of this node; it no longer answers or sends.
    ///
    /// The network stays up so a restarted node can take it over.
    pub fn kill(&self) {
        if self.engine.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = self.engine.id, "killing node");
        self.engine.stop_tasks();
    }

    pub fn is_dead(&self) -> bool {
        self.engine.is_dead()
    }

    pub fn status(&self) -> Status {
        let node = self.engine.node.lock();
        Status {
            id: self.engine.id,
            role: node.state,
            term: node.current_term,
            leader: node.current_leader,
            commit_index: node.commit_index,
            last_applied: node.last_applied,
            last_index: node.log.last_index(),
            dead: self.engine.is_dead(),
        }
    }

    /// Current term and whether this node believes it leads
    pub fn state(&self) -> (u64, bool) {
        let node = self.engine.node.lock();
        (node.current_term, node.is_leader())
    }

    pub fn timestep(&self) -> u64 {
        self.engine.node.lock().timestep
    }

    /// Stamp entries appended from now on with `timestep`
    pub fn set_timestep(&self, timestep: u64) {
        self.engine.node.lock().timestep = timestep;
    }
}

/// Bind the network, dial the seeds, open storage and start the node
pub async fn launch(config: NodeConfig) -> Result<(Raft, mpsc::UnboundedReceiver<ApplyMsg>), RuntimeError> {
    config.validate()?;

    let network = Network::bind(config.node_id, config.network.clone()).await?;
    for seed in &config.seeds {
        match network.connect(*seed).await {
            Ok(peer) => info!(node_id = config.node_id, peer, addr = %seed, "joined mesh"),
            Err(e) => {
                warn!(node_id = config.node_id, addr = %seed, error = %e, "seed unreachable, will retry");
                network.dial_later(*seed);
            }
        }
    }

    let storage: Box<dyn Storage + Send> = match &config.data_dir {
        Some(dir) => Box::new(FileStorage::new(dir.clone())?),
        None => Box::new(InMemoryStorage::new()),
    };

    Ok(Raft::start(config.node_id, config.cluster, config.raft, network, storage)?)
}
