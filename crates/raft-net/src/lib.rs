//! # raft-net
//!
//! why: carry raft messages across a mesh where not every node sees every other
//! relations: wraps raft-core messages in envelopes, driven by raft-runtime
//! what: udp transport with per-neighbor links, distance-vector routing,
//!       peer registry, request/reply rpc with correlation ids and timeouts

pub mod config;
pub mod error;
pub mod message;
pub mod network;
pub mod peer;
pub mod routing;
pub mod transport;

/// Node identity shared with raft-core
pub type NodeId = u64;

pub use config::NetworkConfig;
pub use error::NetworkError;
pub use message::{Envelope, Payload};
pub use network::{MessageHandler, Network, NetworkEvent};
pub use peer::{Peer, PeerRegistry, PeerState};
pub use routing::{RoutingPath, RoutingTable};
pub use transport::{Datagram, Link, Transport};
