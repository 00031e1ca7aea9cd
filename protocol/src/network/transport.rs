//! # Transport Abstraction
//!
//! A [`Transport`] moves signed envelopes between nodes identified by their
//! hex public key. It knows nothing about gossip or consensus. Inbound
//! traffic arrives on the `mpsc::Receiver<Inbound>` handed out when the
//! transport is created.
//!
//! Two implementations:
//!
//! - [`MemoryNetwork`] / [`MemoryTransport`]: an in-process hub for
//!   simulations and tests. Frames are still encoded and decoded so the
//!   wire path is exercised, and the hub can partition and heal the
//!   network on demand.
//! - [`TcpTransport`](super::tcp::TcpTransport): length-prefixed frames
//!   over tokio TCP.
//!
//! A send either hands the frame to the peer's inbound queue or returns an
//! error. Nothing is dropped silently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

use super::wire::{decode_frame, encode_frame, Envelope, WireError};
use crate::error::{Classify, FaultClass};

/// Hex public key of a node.
pub type PeerId = String;

/// Capacity of each node's inbound queue.
pub const INBOUND_QUEUE_SIZE: usize = 4_096;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("peer {0} is not reachable")]
    Unreachable(PeerId),

    #[error("peer {0} inbound queue is full")]
    Congested(PeerId),

    #[error("request to {peer} timed out")]
    Timeout { peer: PeerId },

    #[error("response channel closed before {peer} answered")]
    Cancelled { peer: PeerId },

    #[error("unexpected response from {peer}: {detail}")]
    UnexpectedResponse { peer: PeerId, detail: String },

    #[error("message kind does not belong to the requested topic")]
    TopicMismatch,

    #[error("transport i/o error: {0}")]
    Io(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl Classify for NetworkError {
    fn fault_class(&self) -> FaultClass {
        match self {
            NetworkError::Wire(e) => e.fault_class(),
            NetworkError::UnexpectedResponse { .. } => FaultClass::ProtocolViolation,
            NetworkError::Congested(_) => FaultClass::ResourceExhausted,
            _ => FaultClass::Network,
        }
    }
}

/// A decoded envelope and the neighbour it arrived from. The neighbour may
/// be a relay, not the envelope's originator.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: PeerId,
    pub envelope: Envelope,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> &str;

    /// Neighbours a send would currently reach.
    fn peers(&self) -> Vec<PeerId>;

    async fn send(&self, peer: &str, envelope: &Envelope) -> Result<(), NetworkError>;
}

// ---------------------------------------------------------------------------
// In-memory hub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerId, mpsc::Sender<Inbound>>,
    /// Partition group per node. `None` means fully connected.
    groups: Option<HashMap<PeerId, usize>>,
}

impl Hub {
    fn reachable(&self, a: &str, b: &str) -> bool {
        match &self.groups {
            None => true,
            Some(groups) => match (groups.get(a), groups.get(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

/// Shared broker that routes frames between [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<RwLock<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its transport and inbound queue. Registering
    /// an id again replaces the previous registration.
    pub fn register(&self, id: impl Into<PeerId>) -> (Arc<MemoryTransport>, mpsc::Receiver<Inbound>) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        self.hub.write().nodes.insert(id.clone(), tx);
        let transport = Arc::new(MemoryTransport {
            id,
            hub: self.hub.clone(),
        });
        (transport, rx)
    }

    /// Removes a node. Sends to it fail from now on.
    pub fn disconnect(&self, id: &str) {
        self.hub.write().nodes.remove(id);
    }

    /// Splits the network. Nodes in the same group reach each other; nodes
    /// in different groups, or in no group, do not.
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut assignment = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            for id in group.iter() {
                assignment.insert(id.to_string(), index);
            }
        }
        self.hub.write().groups = Some(assignment);
    }

    pub fn heal(&self) {
        self.hub.write().groups = None;
    }

    pub fn node_count(&self) -> usize {
        self.hub.read().nodes.len()
    }
}

pub struct MemoryTransport {
    id: PeerId,
    hub: Arc<RwLock<Hub>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn peers(&self) -> Vec<PeerId> {
        let hub = self.hub.read();
        let mut peers: Vec<PeerId> = hub
            .nodes
            .iter()
            .filter(|(id, tx)| *id != &self.id && !tx.is_closed() && hub.reachable(&self.id, id))
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    async fn send(&self, peer: &str, envelope: &Envelope) -> Result<(), NetworkError> {
        let frame = encode_frame(envelope)?;
        let tx = {
            let hub = self.hub.read();
            if !hub.reachable(&self.id, peer) {
                return Err(NetworkError::Unreachable(peer.to_string()));
            }
            hub.nodes
                .get(peer)
                .cloned()
                .ok_or_else(|| NetworkError::Unreachable(peer.to_string()))?
        };
        let inbound = Inbound {
            from: self.id.clone(),
            envelope: decode_frame(&frame)?,
        };
        tx.try_send(inbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::Congested(peer.to_string()),
            mpsc::error::TrySendError::Closed(_) => NetworkError::Unreachable(peer.to_string()),
        })
    }
}
