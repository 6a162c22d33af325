//! # message
//!
//! why: define what travels in one datagram
//! relations: wraps raft-core's RaftMessage, encoded by network.rs, carried by transport.rs
//! what: Envelope header, closed Payload enum, json codec

use std::collections::BTreeMap;

use raft_core::RaftMessage;
use serde::{Deserialize, Serialize};

use crate::{NetworkError, NodeId};

/// Header plus payload for a single datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: NodeId,
    /// None only for handshake traffic, before the far side's id is known
    pub recipient_id: Option<NodeId>,
    /// Set on requests that expect a reply and echoed by the reply
    pub correlation_id: Option<u64>,
    /// Relays so far
    pub hops: u32,
    pub payload: Payload,
}

/// Everything a node can say to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Opens a link; the dialer says whether it is a distributor
    Hello { distributor: bool },
    HelloReply { distributor: bool },
    Ping,
    Pong,
    /// `origin`'s current neighbor row
    RoutingAnnounce {
        origin: NodeId,
        seq: u64,
        neighbor_costs: BTreeMap<NodeId, f64>,
    },
    Raft(RaftMessage),
}

impl Payload {
    /// Replies complete a pending request instead of being dispatched
    pub fn is_reply(&self) -> bool {
        match self {
            Payload::HelloReply { .. } | Payload::Pong => true,
            Payload::Raft(message) => message.is_reply(),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Hello { .. } => "Hello",
            Payload::HelloReply { .. } => "HelloReply",
            Payload::Ping => "Ping",
            Payload::Pong => "Pong",
            Payload::RoutingAnnounce { .. } => "RoutingAnnounce",
            Payload::Raft(message) => message.kind(),
        }
    }
}

impl Envelope {
    pub fn new(sender_id: NodeId, recipient_id: Option<NodeId>, payload: Payload) -> Self {
        Self {
            sender_id,
            recipient_id,
            correlation_id: None,
            hops: 0,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<u64>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
