//! # peer
//!
//! why: remember who this node can talk to and how
//! relations: owned by network.rs, refreshed from routing.rs after every topology change
//! what: Peer record, PeerState, PeerRegistry keyed by node id

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::{NodeId, RoutingTable};

/// Liveness of a peer as seen from this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Direct neighbor answering keepalives
    Connected,
    /// Direct neighbor that missed the last `missed` keepalives
    Unresponsive { missed: u32 },
    /// Known only through routing announcements
    Routed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: NodeId,
    /// Set for direct neighbors only
    pub addr: Option<SocketAddr>,
    pub neighbor: bool,
    /// Neighbor to hand envelopes for this peer to
    pub next_hop: Option<NodeId>,
    /// Cost of the cheapest known path
    pub distance: f64,
    pub distributor: bool,
    pub state: PeerState,
}

impl Peer {
    fn neighbor(id: NodeId, addr: SocketAddr, distributor: bool) -> Self {
        Self {
            id,
            addr: Some(addr),
            neighbor: true,
            next_hop: Some(id),
            distance: 1.0,
            distributor,
            state: PeerState::Connected,
        }
    }

    fn routed(id: NodeId) -> Self {
        Self {
            id,
            addr: None,
            neighbor: false,
            next_hop: None,
            distance: f64::INFINITY,
            distributor: false,
            state: PeerState::Routed,
        }
    }
}

/// Every peer this node knows, neighbor or not
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<NodeId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a direct neighbor; true if it was not a neighbor before
    pub fn add_neighbor(&mut self, id: NodeId, addr: SocketAddr, distributor: bool) -> bool {
        let was_neighbor = self.peers.get(&id).is_some_and(|p| p.neighbor);
        self.peers.insert(id, Peer::neighbor(id, addr, distributor));
        !was_neighbor
    }

    /// Forget a neighbor; it may come back as a routed peer on the next refresh
    pub fn remove_neighbor(&mut self, id: NodeId) -> Option<Peer> {
        match self.peers.get(&id) {
            Some(peer) if peer.neighbor => self.peers.remove(&id),
            _ => None,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers.values().find(|p| p.addr == Some(addr))
    }

    pub fn all(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn neighbors(&self) -> Vec<Peer> {
        self.peers.values().filter(|p| p.neighbor).cloned().collect()
    }

    /// Record a keepalive outcome; returns the consecutive miss count
    pub fn record_keepalive(&mut self, id: NodeId, answered: bool) -> u32 {
        let Some(peer) = self.peers.get_mut(&id).filter(|p| p.neighbor) else {
            return 0;
        };
        let missed = match (answered, peer.state) {
            (true, _) => 0,
            (false, PeerState::Unresponsive { missed }) => missed + 1,
            (false, _) => 1,
        };
        peer.state = if missed == 0 {
            PeerState::Connected
        } else {
            PeerState::Unresponsive { missed }
        };
        missed
    }

    /// Re-derive distances and next hops from the routing table.
    ///
    /// Routed peers that are no longer reachable are dropped; neighbors stay
    /// until they are disconnected explicitly.
    pub fn refresh(&mut self, local: NodeId, routing: &RoutingTable) {
        for node in routing.nodes() {
            if node != local && routing.get_shortest_path(local, node).is_some() {
                self.peers.entry(node).or_insert_with(|| Peer::routed(node));
            }
        }

        self.peers.retain(|id, peer| {
            let path = routing.get_shortest_path(local, *id);
            if !peer.neighbor {
                let Some(path) = path else {
                    return false;
                };
                peer.distance = path.cost;
                peer.next_hop = routing.next_hop(local, *id);
                return true;
            }
            if let Some(path) = path {
                peer.distance = path.cost;
            }
            true
        });
    }
}
