//! # P2P Network
//!
//! Ties a [`Transport`] to the gossip rules and the latency monitor, and
//! gives the node four verbs:
//!
//! - `broadcast(topic, message)`: sign, mark seen, send to every neighbour.
//! - `send_to_peer(peer, message)`: one direct send with an explicit error.
//! - `request(peer, SyncRequest)`: a correlated round trip with a timeout.
//! - `ping(peer)`: a correlated round trip that measures latency.
//!
//! The receive loop verifies envelopes, relays gossip, answers pings,
//! completes pending requests, and hands everything else to the node on
//! one channel. Failed sends are reported to the monitor as failed samples.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::gossip::{GossipAction, GossipConfig, GossipProtocol};
use super::monitor::{NetworkMonitor, Pinger};
use super::transport::{Inbound, NetworkError, PeerId, Transport};
use super::wire::{Envelope, Message, Topic};
use crate::config::REQUEST_TIMEOUT;
use crate::crypto::Keypair;
use crate::sync::{SyncRequest, SyncResponse};

#[derive(Debug, Clone)]
pub struct P2pConfig {
    pub request_timeout: Duration,
    pub gossip: GossipConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            gossip: GossipConfig::default(),
        }
    }
}

pub struct P2pNetwork {
    keypair: Keypair,
    transport: Arc<dyn Transport>,
    gossip: GossipProtocol,
    monitor: Arc<NetworkMonitor>,
    config: P2pConfig,
    /// Outstanding pings and sync requests, by nonce.
    pending: DashMap<u64, oneshot::Sender<Message>>,
    next_nonce: AtomicU64,
    local_height: AtomicU64,
    /// Highest committed or consensus height each peer has shown us.
    peer_heights: DashMap<PeerId, u64>,
}

impl P2pNetwork {
    pub fn new(
        keypair: Keypair,
        transport: Arc<dyn Transport>,
        monitor: Arc<NetworkMonitor>,
        config: P2pConfig,
    ) -> Arc<Self> {
        let gossip = GossipProtocol::new(config.gossip.clone());
        Arc::new(Self {
            keypair,
            transport,
            gossip,
            monitor,
            config,
            pending: DashMap::new(),
            next_nonce: AtomicU64::new(1),
            local_height: AtomicU64::new(0),
            peer_heights: DashMap::new(),
        })
    }

    pub fn local_id(&self) -> &str {
        self.transport.local_id()
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.transport.peers()
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peers().len()
    }

    pub fn set_local_height(&self, height: u64) {
        self.local_height.store(height, Ordering::Relaxed);
    }

    pub fn local_height(&self) -> u64 {
        self.local_height.load(Ordering::Relaxed)
    }

    /// The connected peer claiming the greatest height.
    pub fn best_peer(&self) -> Option<(PeerId, u64)> {
        self.transport
            .peers()
            .into_iter()
            .filter_map(|p| self.peer_heights.get(&p).map(|h| (p.clone(), *h)))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }

    fn note_height(&self, peer: &str, height: u64) {
        let mut entry = self.peer_heights.entry(peer.to_string()).or_insert(0);
        if height > *entry {
            *entry = height;
        }
    }

    fn report_failure(&self, peer: &str, error: &NetworkError) {
        debug!(%peer, %error, "send failed");
        self.monitor
            .record_latency(peer, self.config.request_timeout, false);
    }

    // -- Sending ------------------------------------------------------------

    /// Sends `message` to every neighbour. Returns how many sends succeeded.
    pub async fn broadcast(&self, topic: Topic, message: Message) -> Result<usize, NetworkError> {
        if message.kind().topic() != Some(topic) {
            return Err(NetworkError::TopicMismatch);
        }
        let envelope = Envelope::new(&self.keypair, message, self.config.gossip.ttl_for(topic))?;
        let targets = self.gossip.broadcast_targets(&envelope, &self.transport.peers());
        let mut sent = 0;
        for peer in targets {
            match self.transport.send(&peer, &envelope).await {
                Ok(()) => sent += 1,
                Err(e) => self.report_failure(&peer, &e),
            }
        }
        trace!(kind = ?envelope.kind, sent, "broadcast");
        Ok(sent)
    }

    pub async fn send_to_peer(&self, peer: &str, message: Message) -> Result<(), NetworkError> {
        let envelope = Envelope::new(&self.keypair, message, 0)?;
        self.transport.send(peer, &envelope).await.map_err(|e| {
            self.report_failure(peer, &e);
            e
        })
    }

    /// Sends a sync request and waits for the correlated response.
    pub async fn request(&self, peer: &str, request: SyncRequest) -> Result<SyncResponse, NetworkError> {
        let request_id = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let message = Message::SyncRequest {
            request_id,
            request,
        };
        if let Err(e) = self.send_to_peer(peer, message).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match self.await_reply(peer, request_id, rx).await? {
            Message::SyncResponse { response, .. } => Ok(*response),
            other => Err(NetworkError::UnexpectedResponse {
                peer: peer.to_string(),
                detail: format!("{:?} to sync request", other.kind()),
            }),
        }
    }

    /// Answers a sync request received from `peer`.
    pub async fn respond(
        &self,
        peer: &str,
        request_id: u64,
        response: SyncResponse,
    ) -> Result<(), NetworkError> {
        let message = Message::SyncResponse {
            request_id,
            response: Box::new(response),
        };
        self.send_to_peer(peer, message).await
    }

    /// Measures one round trip. Outcomes are left for the caller to record.
    pub async fn ping(&self, peer: &str) -> Result<Duration, NetworkError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(
            &self.keypair,
            Message::Ping {
                nonce,
                height: self.local_height(),
            },
            0,
        )?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(nonce, tx);
        let started = Instant::now();
        if let Err(e) = self.transport.send(peer, &envelope).await {
            self.pending.remove(&nonce);
            return Err(e);
        }
        match self.await_reply(peer, nonce, rx).await? {
            Message::Pong { .. } => Ok(started.elapsed()),
            other => Err(NetworkError::UnexpectedResponse {
                peer: peer.to_string(),
                detail: format!("{:?} to ping", other.kind()),
            }),
        }
    }

    async fn await_reply(
        &self,
        peer: &str,
        nonce: u64,
        rx: oneshot::Receiver<Message>,
    ) -> Result<Message, NetworkError> {
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(NetworkError::Cancelled {
                peer: peer.to_string(),
            }),
            Err(_) => {
                self.pending.remove(&nonce);
                Err(NetworkError::Timeout {
                    peer: peer.to_string(),
                })
            }
        }
    }

    // -- Receiving ----------------------------------------------------------

    /// Processes inbound traffic until shutdown or until the transport
    /// closes. Messages for the node go out on `deliver`.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        deliver: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = tokio::select! {
                next = inbound.recv() => next,
                _ = shutdown.changed() => break,
            };
            let Some(msg) = next else { break };
            if let Some(for_node) = self.handle_inbound(msg).await {
                if deliver.send(for_node).await.is_err() {
                    break;
                }
            }
        }
        debug!("p2p receive loop stopped");
    }

    async fn handle_inbound(&self, inbound: Inbound) -> Option<Inbound> {
        let Inbound { from, envelope } = inbound;
        if let Err(e) = envelope.verify() {
            warn!(peer = %from, error = %e, "rejecting envelope");
            return None;
        }

        match &envelope.payload {
            Message::Ping { height, .. } | Message::Pong { height, .. } => {
                self.note_height(&envelope.sender, *height)
            }
            Message::Proposal(_) | Message::Prevote(_) | Message::Precommit(_) => {
                // A node voting at h has committed h - 1.
                self.note_height(&envelope.sender, envelope.height.saturating_sub(1))
            }
            _ => {}
        }

        let peers = self.transport.peers();
        let mut delivered = None;
        for action in self.gossip.handle_message(&from, envelope, &peers) {
            match action {
                GossipAction::Forward { envelope, targets } => {
                    for peer in targets {
                        if let Err(e) = self.transport.send(&peer, &envelope).await {
                            self.report_failure(&peer, &e);
                        }
                    }
                }
                GossipAction::Deliver(envelope) => delivered = Some(envelope),
                GossipAction::Drop(_) => {}
            }
        }
        let envelope = delivered?;

        let reply_to = match &envelope.payload {
            Message::Ping { nonce, .. } => {
                let pong = Message::Pong {
                    nonce: *nonce,
                    height: self.local_height(),
                };
                if let Err(e) = self.send_to_peer(&from, pong).await {
                    debug!(peer = %from, error = %e, "pong not sent");
                }
                return None;
            }
            Message::Pong { nonce, .. } | Message::SyncResponse { request_id: nonce, .. } => *nonce,
            _ => return Some(Inbound { from, envelope }),
        };
        match self.pending.remove(&reply_to) {
            Some((_, tx)) => {
                let _ = tx.send(envelope.payload);
            }
            None => trace!(peer = %from, nonce = reply_to, "late or unsolicited reply"),
        }
        None
    }
}

#[async_trait]
impl Pinger for P2pNetwork {
    async fn ping(&self, peer: &str) -> Result<Duration, NetworkError> {
        P2pNetwork::ping(self, peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::MemoryNetwork;

    struct TestNode {
        net: Arc<P2pNetwork>,
        delivered: mpsc::Receiver<Inbound>,
    }

    fn spawn_node(hub: &MemoryNetwork, seed: u8, shutdown: &watch::Receiver<bool>) -> TestNode {
        let keypair = Keypair::from_seed(&[seed; 32]);
        let (transport, inbound) = hub.register(keypair.public_key_hex());
        let config = P2pConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let net = P2pNetwork::new(keypair, transport, Arc::new(NetworkMonitor::default()), config);
        let (tx, delivered) = mpsc::channel(64);
        tokio::spawn(net.clone().run(inbound, tx, shutdown.clone()));
        TestNode { net, delivered }
    }

    fn evidence_free_proof(seed: u8) -> Message {
        use crate::proof::{Proof, ProofPayload, Verdict};
        let kp = Keypair::from_seed(&[seed; 32]);
        Message::Proof(Proof::new(
            &kp,
            ProofPayload::Commitment {
                account: "acct".into(),
                commitment: vec![seed],
            },
            Verdict::Proved,
            1,
            vec![],
        ))
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer_once() {
        let hub = MemoryNetwork::new();
        let (_stop, shutdown) = watch::channel(false);
        let a = spawn_node(&hub, 1, &shutdown);
        let mut b = spawn_node(&hub, 2, &shutdown);
        let mut c = spawn_node(&hub, 3, &shutdown);

        let sent = a.net.broadcast(Topic::Proofs, evidence_free_proof(7)).await.unwrap();
        assert_eq!(sent, 2);

        for node in [&mut b, &mut c] {
            let got = tokio::time::timeout(Duration::from_secs(1), node.delivered.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(got.envelope.payload, Message::Proof(_)));
        }
        // Relayed copies are deduplicated.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.delivered.try_recv().is_err());
        assert!(c.delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn topic_must_match_message() {
        let hub = MemoryNetwork::new();
        let (_stop, shutdown) = watch::channel(false);
        let a = spawn_node(&hub, 1, &shutdown);
        assert_eq!(
            a.net.broadcast(Topic::Consensus, evidence_free_proof(1)).await,
            Err(NetworkError::TopicMismatch)
        );
    }

    #[tokio::test]
    async fn ping_round_trip_and_height_exchange() {
        let hub = MemoryNetwork::new();
        let (_stop, shutdown) = watch::channel(false);
        let a = spawn_node(&hub, 1, &shutdown);
        let b = spawn_node(&hub, 2, &shutdown);
        b.net.set_local_height(12);

        let b_id = b.net.local_id().to_string();
        a.net.ping(&b_id).await.unwrap();
        assert_eq!(a.net.best_peer(), Some((b_id, 12)));
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported_to_monitor() {
        let hub = MemoryNetwork::new();
        let (_stop, shutdown) = watch::channel(false);
        let a = spawn_node(&hub, 1, &shutdown);

        let err = a
            .net
            .send_to_peer("nobody", Message::Ping { nonce: 1, height: 0 })
            .await
            .unwrap_err();
        assert_eq!(err, NetworkError::Unreachable("nobody".into()));
        assert_eq!(a.net.monitor().failure_rate("nobody"), Some(1.0));
    }

    #[tokio::test]
    async fn request_times_out_without_answer() {
        let hub = MemoryNetwork::new();
        let (_stop, shutdown) = watch::channel(false);
        let a = spawn_node(&hub, 1, &shutdown);
        // Registered but nobody drains the queue.
        let silent = Keypair::from_seed(&[9; 32]).public_key_hex();
        let (_t, _rx) = hub.register(silent.clone());

        let err = a.net.request(&silent, SyncRequest::Status).await.unwrap_err();
        assert_eq!(err, NetworkError::Timeout { peer: silent });
    }
}
