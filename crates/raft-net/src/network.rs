//! # network
//!
//! why: give the consensus layer "send to node n" and "ask node n and wait"
//!      over a mesh where most nodes are reached through others
//! relations: owns transport.rs, routing.rs and peer.rs; calls back into
//!            raft-runtime through MessageHandler
//! what: Network with handshake, keepalive, redial of lost neighbors,
//!       routing announcements, relaying, correlated request/reply with
//!       deadlines, peer events

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use raft_core::RaftMessage;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::transport::{Datagram, Transport};
use crate::{Envelope, NetworkConfig, NetworkError, NodeId, Payload, Peer, PeerRegistry, RoutingPath, RoutingTable};

/// Cost of every direct link
const NEIGHBOR_COST: f64 = 1.0;

/// Receives raft requests addressed to this node
pub trait MessageHandler: Send + Sync {
    /// Handle a request from `from`; a returned message goes back as the reply
    fn handle(&self, from: NodeId, message: RaftMessage) -> Option<RaftMessage>;
}

/// Changes in the set of directly connected, non-distributor peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
}

/// A reply matched to a pending request
struct Reply {
    from: NodeId,
    payload: Payload,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Reply>>>;

/// Removes the pending slot however the request ends
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

/// One node's view of the mesh
pub struct Network {
    id: NodeId,
    config: NetworkConfig,
    transport: Transport,
    // lock order: routing before peers
    routing: RwLock<RoutingTable>,
    peers: RwLock<PeerRegistry>,
    pending: PendingMap,
    next_correlation: AtomicU64,
    announce_seq: AtomicU64,
    last_seen_seq: Mutex<HashMap<NodeId, u64>>,
    handler: RwLock<Option<Weak<dyn MessageHandler>>>,
    /// Lost neighbors and unreachable seeds, with whether a dial is in flight
    redial: Mutex<BTreeMap<SocketAddr, bool>>,
    events: broadcast::Sender<NetworkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    /// Bind the configured address and start the dispatch, keepalive and announce tasks
    pub async fn bind(id: NodeId, config: NetworkConfig) -> Result<Arc<Self>, NetworkError> {
        config
            .validate()
            .map_err(|e| NetworkError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let (transport, inbound) = Transport::bind(config.listen_addr).await?;
        let (events, _) = broadcast::channel(64);
        // announcements from a restarted node must outrank its earlier ones
        let first_seq = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        let network = Arc::new(Self {
            id,
            config,
            transport,
            routing: RwLock::new(RoutingTable::new()),
            peers: RwLock::new(PeerRegistry::new()),
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            announce_seq: AtomicU64::new(first_seq),
            last_seen_seq: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            redial: Mutex::new(BTreeMap::new()),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        info!(
            node_id = id,
            addr = %network.local_addr(),
            distributor = network.config.distributor,
            "network listening"
        );

        let weak = Arc::downgrade(&network);
        *network.tasks.lock() = vec![
            tokio::spawn(Self::dispatch_loop(weak.clone(), inbound)),
            tokio::spawn(Self::keepalive_loop(weak.clone())),
            tokio::spawn(Self::announce_loop(weak)),
        ];

        Ok(network)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Register the receiver of raft requests; held weakly so it can go away first
    pub fn set_handler(&self, handler: Weak<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Fault injection, see `Transport::set_drop_rate`
    pub fn set_drop_rate(&self, rate: f64) {
        info!(node_id = self.id, rate, "drop rate set");
        self.transport.set_drop_rate(rate);
    }

    // -- background tasks --

    async fn dispatch_loop(network: Weak<Self>, mut inbound: mpsc::UnboundedReceiver<Datagram>) {
        while let Some(datagram) = inbound.recv().await {
            let Some(network) = network.upgrade() else {
                break;
            };
            network.dispatch(datagram);
        }
    }

    async fn keepalive_loop(network: Weak<Self>) {
        let Some(period) = network.upgrade().map(|n| n.config.keepalive_interval()) else {
            return;
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(network) = network.upgrade() else {
                break;
            };
            let neighbors = network.peers.read().neighbors();
            for peer in neighbors {
                let network = network.clone();
                tokio::spawn(async move { network.probe(peer.id).await });
            }

            let due: Vec<SocketAddr> = network
                .redial
                .lock()
                .iter_mut()
                .filter(|(_, dialing)| !**dialing)
                .map(|(addr, dialing)| {
                    *dialing = true;
                    *addr
                })
                .collect();
            for addr in due {
                let network = network.clone();
                tokio::spawn(async move { network.redial(addr).await });
            }

            network.prune_links();
        }
    }

    async fn announce_loop(network: Weak<Self>) {
        let Some(period) = network.upgrade().map(|n| n.config.announce_interval()) else {
            return;
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(network) = network.upgrade() else {
                break;
            };
            network.announce_routes();
        }
    }

    /// Ping one neighbor and drop it after too many silent rounds
    async fn probe(&self, id: NodeId) {
        let Some(addr) = self.neighbor_addr(id) else {
            return;
        };
        let answered = matches!(
            self.request(addr, Envelope::new(self.id, Some(id), Payload::Ping)).await,
            Ok(Reply { payload: Payload::Pong, .. })
        );
        let missed = self.peers.write().record_keepalive(id, answered);
        if missed >= self.config.keepalive_max_misses {
            warn!(node_id = self.id, peer = id, missed, "neighbor stopped answering keepalives");
            if let Some(addr) = self.drop_neighbor(id) {
                self.dial_later(addr);
            }
        }
    }

    /// One handshake attempt towards a remembered address
    async fn redial(&self, addr: SocketAddr) {
        match self.connect(addr).await {
            Ok(peer) => info!(node_id = self.id, peer, %addr, "redial succeeded"),
            Err(e) => {
                debug!(node_id = self.id, %addr, error = %e, "redial failed");
                if let Some(dialing) = self.redial.lock().get_mut(&addr) {
                    *dialing = false;
                }
            }
        }
    }

    /// Close links that carry no neighbor and sat unused past the linger time
    fn prune_links(&self) {
        let linger = self.config.request_timeout() * 2;
        let closed = {
            let peers = self.peers.read();
            self.transport.retain_links(|addr, idle| {
                idle < linger || peers.by_addr(addr).is_some_and(|p| p.neighbor)
            })
        };
        if closed > 0 {
            debug!(node_id = self.id, closed, "closed idle links");
        }
    }

    // -- connections --

    /// Dial `addr` and handshake; returns the id of the node found there
    pub async fn connect(&self, addr: SocketAddr) -> Result<NodeId, NetworkError> {
        let hello = Payload::Hello {
            distributor: self.config.distributor,
        };
        let reply = self.request(addr, Envelope::new(self.id, None, hello)).await?;

        let Payload::HelloReply { distributor } = reply.payload else {
            return Err(NetworkError::UnexpectedReply(reply.payload.kind().to_string()));
        };
        if reply.from == self.id {
            return Err(NetworkError::UnexpectedReply(format!("{addr} is this node")));
        }

        self.add_neighbor(reply.from, addr, distributor);
        Ok(reply.from)
    }

    /// Keep handshaking with `addr` from the keepalive loop until it answers
    pub fn dial_later(&self, addr: SocketAddr) {
        if self.peers.read().by_addr(addr).is_some_and(|p| p.neighbor) {
            return;
        }
        if self.redial.lock().insert(addr, false).is_none() {
            debug!(node_id = self.id, %addr, "address queued for redial");
        }
    }

    /// Addresses waiting to be dialed again
    pub fn pending_redials(&self) -> Vec<SocketAddr> {
        self.redial.lock().keys().copied().collect()
    }

    /// Close the link to a neighbor and forget its edge
    pub fn disconnect(&self, id: NodeId) {
        self.drop_neighbor(id);
    }

    /// Disconnect `id`, returning the address it was reached at
    fn drop_neighbor(&self, id: NodeId) -> Option<SocketAddr> {
        let removed = {
            let mut routing = self.routing.write();
            let mut peers = self.peers.write();
            let removed = peers.remove_neighbor(id);
            if removed.is_some() {
                routing.remove_edge(self.id, id);
                peers.refresh(self.id, &routing);
            }
            removed
        };
        let peer = removed?;

        if let Some(addr) = peer.addr {
            self.transport.close(addr);
        }
        info!(node_id = self.id, peer = id, "neighbor disconnected");
        if !peer.distributor {
            let _ = self.events.send(NetworkEvent::PeerDisconnected(id));
        }
        self.announce_routes();
        peer.addr
    }

    fn add_neighbor(&self, id: NodeId, addr: SocketAddr, distributor: bool) {
        self.redial.lock().remove(&addr);
        let is_new = {
            let mut routing = self.routing.write();
            let mut peers = self.peers.write();
            let is_new = peers.add_neighbor(id, addr, distributor);
            routing.update(self.id, &BTreeMap::from([(id, NEIGHBOR_COST)]));
            peers.refresh(self.id, &routing);
            is_new
        };
        if !is_new {
            return;
        }

        info!(node_id = self.id, peer = id, %addr, distributor, "neighbor connected");
        if !distributor {
            let _ = self.events.send(NetworkEvent::PeerConnected(id));
        }
        self.announce_routes();
    }

    // -- routing --

    fn own_row(peers: &PeerRegistry) -> BTreeMap<NodeId, f64> {
        peers.neighbors().iter().map(|p| (p.id, NEIGHBOR_COST)).collect()
    }

    /// Tell every neighbor who this node can reach directly
    pub fn announce_routes(&self) {
        let neighbors = self.peers.read().neighbors();
        let neighbor_costs: BTreeMap<NodeId, f64> = neighbors.iter().map(|p| (p.id, NEIGHBOR_COST)).collect();
        let seq = self.announce_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let payload = Payload::RoutingAnnounce {
            origin: self.id,
            seq,
            neighbor_costs,
        };

        for peer in neighbors {
            if let Some(addr) = peer.addr {
                self.send_envelope(addr, Envelope::new(self.id, Some(peer.id), payload.clone()));
            }
        }
    }

    fn handle_announce(&self, sender: NodeId, origin: NodeId, seq: u64, mut neighbor_costs: BTreeMap<NodeId, f64>) {
        if origin == self.id {
            return;
        }
        {
            let mut seen = self.last_seen_seq.lock();
            if seen.get(&origin).is_some_and(|last| seq <= *last) {
                return;
            }
            seen.insert(origin, seq);
        }

        let relay_to = {
            let mut routing = self.routing.write();
            let mut peers = self.peers.write();
            // edges touching this node are only believed from its own neighbor list
            if !peers.get(origin).is_some_and(|p| p.neighbor) {
                neighbor_costs.remove(&self.id);
            }
            routing.replace_row(origin, &neighbor_costs);
            routing.replace_row(self.id, &Self::own_row(&peers));
            peers.refresh(self.id, &routing);
            peers.neighbors()
        };
        debug!(node_id = self.id, origin, seq, from = sender, "routes updated");

        let payload = Payload::RoutingAnnounce {
            origin,
            seq,
            neighbor_costs,
        };
        for peer in relay_to {
            if peer.id == sender || peer.id == origin {
                continue;
            }
            if let Some(addr) = peer.addr {
                self.send_envelope(addr, Envelope::new(self.id, Some(peer.id), payload.clone()));
            }
        }
    }

    fn neighbor_addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.peers.read().get(id).filter(|p| p.neighbor).and_then(|p| p.addr)
    }

    /// Address of the neighbor that carries traffic for `to`
    fn route(&self, to: NodeId) -> Result<SocketAddr, NetworkError> {
        let routing = self.routing.read();
        let peers = self.peers.read();

        if let Some(addr) = peers.get(to).filter(|p| p.neighbor).and_then(|p| p.addr) {
            return Ok(addr);
        }
        routing
            .next_hop(self.id, to)
            .and_then(|hop| peers.get(hop))
            .filter(|p| p.neighbor)
            .and_then(|p| p.addr)
            .ok_or(NetworkError::NoRoute(to))
    }

    // -- sending --

    fn send_envelope(&self, addr: SocketAddr, envelope: Envelope) {
        let result = envelope.encode().and_then(|bytes| self.transport.send_to(addr, bytes));
        if let Err(e) = result {
            debug!(node_id = self.id, %addr, kind = envelope.payload.kind(), error = %e, "send failed");
        }
    }

    fn send_routed(&self, to: NodeId, envelope: Envelope) -> Result<(), NetworkError> {
        let addr = self.route(to)?;
        self.transport.send_to(addr, envelope.encode()?)
    }

    /// Fire-and-forget delivery to `to`, relayed if it is not a neighbor
    pub fn send(&self, to: NodeId, message: RaftMessage) -> Result<(), NetworkError> {
        self.send_routed(to, Envelope::new(self.id, Some(to), Payload::Raft(message)))
    }

    /// Send a request to `to` and wait for its reply or the request deadline
    pub async fn send_and_receive(&self, to: NodeId, message: RaftMessage) -> Result<RaftMessage, NetworkError> {
        let addr = self.route(to)?;
        let reply = self
            .request(addr, Envelope::new(self.id, Some(to), Payload::Raft(message)))
            .await?;

        match reply.payload {
            Payload::Raft(message) if message.is_reply() && reply.from == to => Ok(message),
            other => Err(NetworkError::UnexpectedReply(format!("{} from {}", other.kind(), reply.from))),
        }
    }

    async fn request(&self, addr: SocketAddr, envelope: Envelope) -> Result<Reply, NetworkError> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        let bytes = envelope.with_correlation(Some(correlation_id)).encode()?;
        self.transport.send_to(addr, bytes)?;

        match timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    // -- receiving --

    fn dispatch(self: &Arc<Self>, datagram: Datagram) {
        let envelope = match Envelope::decode(&datagram.bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(node_id = self.id, from = %datagram.from, error = %e, "malformed datagram");
                return;
            }
        };

        if let Some(recipient) = envelope.recipient_id.filter(|r| *r != self.id) {
            self.relay(envelope, recipient);
            return;
        }

        let Envelope {
            sender_id,
            correlation_id,
            payload,
            ..
        } = envelope;

        match payload {
            Payload::Hello { distributor } => {
                if sender_id == self.id {
                    return;
                }
                let reply = Payload::HelloReply {
                    distributor: self.config.distributor,
                };
                self.send_envelope(
                    datagram.from,
                    Envelope::new(self.id, Some(sender_id), reply).with_correlation(correlation_id),
                );
                self.add_neighbor(sender_id, datagram.from, distributor);
            }
            Payload::Ping => {
                self.send_envelope(
                    datagram.from,
                    Envelope::new(self.id, Some(sender_id), Payload::Pong).with_correlation(correlation_id),
                );
            }
            Payload::RoutingAnnounce {
                origin,
                seq,
                neighbor_costs,
            } => self.handle_announce(sender_id, origin, seq, neighbor_costs),
            Payload::Raft(message) if !message.is_reply() => self.handle_raft(sender_id, correlation_id, message),
            reply => self.complete(sender_id, correlation_id, reply),
        }
    }

    fn relay(&self, mut envelope: Envelope, recipient: NodeId) {
        if envelope.hops >= self.config.max_hops {
            warn!(node_id = self.id, recipient, hops = envelope.hops, "hop limit reached, dropping");
            return;
        }
        envelope.hops += 1;
        let kind = envelope.payload.kind();
        if let Err(e) = self.send_routed(recipient, envelope) {
            debug!(node_id = self.id, recipient, kind, error = %e, "relay failed");
        }
    }

    /// Run the handler on the blocking pool; it may write to disk before answering
    fn handle_raft(self: &Arc<Self>, from: NodeId, correlation_id: Option<u64>, message: RaftMessage) {
        let handler = self.handler.read().as_ref().and_then(|h| h.upgrade());
        let Some(handler) = handler else {
            debug!(node_id = self.id, from, kind = message.kind(), "no handler registered");
            return;
        };

        let network = self.clone();
        tokio::task::spawn_blocking(move || {
            let Some(reply) = handler.handle(from, message) else {
                return;
            };
            let envelope = Envelope::new(network.id, Some(from), Payload::Raft(reply)).with_correlation(correlation_id);
            if let Err(e) = network.send_routed(from, envelope) {
                debug!(node_id = network.id, to = from, error = %e, "reply not sent");
            }
        });
    }

    fn complete(&self, from: NodeId, correlation_id: Option<u64>, payload: Payload) {
        let waiter = correlation_id.and_then(|id| self.pending.lock().remove(&id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Reply { from, payload });
            }
            None => debug!(node_id = self.id, from, kind = payload.kind(), "reply without a waiting request"),
        }
    }

    // -- inspection --

    pub fn peer(&self, id: NodeId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().all()
    }

    pub fn neighbors(&self) -> Vec<Peer> {
        self.peers.read().neighbors()
    }

    pub fn shortest_path(&self, to: NodeId) -> Option<RoutingPath> {
        self.routing.read().get_shortest_path(self.id, to).cloned()
    }

    pub fn topology(&self) -> BTreeMap<NodeId, BTreeMap<NodeId, f64>> {
        self.routing.read().topology().clone()
    }

    /// Stop background tasks, close every link and fail waiting requests
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.shutdown();
        self.pending.lock().clear();
        info!(node_id = self.id, "network shut down");
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
