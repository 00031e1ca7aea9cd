//! # TCP Transport
//!
//! Length-prefixed frames over tokio TCP, one long-lived connection per
//! peer. Each connection opens with a hello frame carrying the node id, so
//! neither side needs to know the other's key up front; configured peers
//! are just socket addresses.
//!
//! ```text
//!  connection := hello(A) hello(B) frame*
//!  frame      := u32 BE length | wire frame (magic | version | bincode)
//! ```
//!
//! Every connection gets a reader task (frames to the shared inbound queue)
//! and a writer task (bounded queue to the socket, per-write timeout). When
//! two nodes dial each other at the same time both connections complete;
//! both sides keep the one dialed by the smaller node id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::transport::{Inbound, NetworkError, PeerId, Transport, INBOUND_QUEUE_SIZE};
use super::wire::{decode_frame, encode_frame, Envelope, WireError};
use crate::config::{
    CONNECT_TIMEOUT, MAX_FRAME_SIZE, PROTOCOL_MAGIC, REDIAL_INTERVAL, WIRE_PROTOCOL_VERSION,
    WRITE_TIMEOUT,
};

/// Frames queued per connection before sends report congestion.
const OUTBOUND_QUEUE_SIZE: usize = 1_024;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub listen: SocketAddr,
    /// Addresses dialed, and redialed while disconnected.
    pub peers: Vec<SocketAddr>,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub redial_interval: Duration,
}

impl TcpConfig {
    pub fn new(listen: SocketAddr, peers: Vec<SocketAddr>) -> Self {
        Self {
            listen,
            peers,
            connect_timeout: CONNECT_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            redial_interval: REDIAL_INTERVAL,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    magic: u32,
    version: u16,
    id: PeerId,
}

struct Connection {
    id: u64,
    outbound: bool,
    tx: mpsc::Sender<Bytes>,
}

pub struct TcpTransport {
    id: PeerId,
    config: TcpConfig,
    local_addr: SocketAddr,
    connections: DashMap<PeerId, Connection>,
    /// Which node answered at each configured address.
    dialed: DashMap<SocketAddr, PeerId>,
    inbound: mpsc::Sender<Inbound>,
    next_conn: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

impl TcpTransport {
    /// Binds the listener and starts the accept and redial loops. Both stop
    /// when `shutdown` flips to true.
    pub async fn start(
        id: PeerId,
        config: TcpConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>), NetworkError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| NetworkError::Io(format!("bind {}: {e}", config.listen)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::Io(e.to_string()))?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);

        let transport = Arc::new(Self {
            id,
            config,
            local_addr,
            connections: DashMap::new(),
            dialed: DashMap::new(),
            inbound: tx,
            next_conn: AtomicU64::new(1),
            shutdown,
        });
        info!(addr = %local_addr, "p2p listener bound");

        tokio::spawn(transport.clone().accept_loop(listener));
        tokio::spawn(transport.clone().dial_loop());
        Ok((transport, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dials `addr` and completes the hello exchange. Returns the remote id.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, NetworkError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout {
                peer: addr.to_string(),
            })?
            .map_err(|e| NetworkError::Io(format!("connect {addr}: {e}")))?;
        let peer = self.establish(stream, true).await?;
        self.dialed.insert(addr, peer.clone());
        Ok(peer)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.establish(stream, false).await {
                                debug!(%addr, error = %e, "inbound handshake failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("accept loop stopped");
    }

    async fn dial_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(self.config.redial_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for addr in self.config.peers.clone() {
                        let connected = self
                            .dialed
                            .get(&addr)
                            .map(|peer| self.connections.contains_key(peer.value()))
                            .unwrap_or(false);
                        if connected || addr == self.local_addr {
                            continue;
                        }
                        if let Err(e) = self.connect(addr).await {
                            debug!(%addr, error = %e, "dial failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.connections.clear();
        debug!("dial loop stopped");
    }

    /// Exchanges hellos, then registers the connection and spawns its tasks.
    async fn establish(self: &Arc<Self>, stream: TcpStream, outbound: bool) -> Result<PeerId, NetworkError> {
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, codec());
        let mut writer = FramedWrite::new(write, codec());

        let hello = Hello {
            magic: PROTOCOL_MAGIC,
            version: WIRE_PROTOCOL_VERSION,
            id: self.id.clone(),
        };
        let bytes = bincode::serialize(&hello).map_err(|e| WireError::Encode(e.to_string()))?;

        let exchange = async {
            writer
                .send(Bytes::from(bytes))
                .await
                .map_err(|e| NetworkError::Io(e.to_string()))?;
            match reader.next().await {
                Some(Ok(frame)) => bincode::deserialize::<Hello>(&frame)
                    .map_err(|e| NetworkError::Wire(WireError::Decode(e.to_string()))),
                Some(Err(e)) => Err(NetworkError::Io(e.to_string())),
                None => Err(NetworkError::Io("closed during handshake".into())),
            }
        };
        let theirs = tokio::time::timeout(self.config.connect_timeout, exchange)
            .await
            .map_err(|_| NetworkError::Timeout {
                peer: "handshake".into(),
            })??;

        if theirs.magic != PROTOCOL_MAGIC {
            return Err(WireError::BadMagic(theirs.magic).into());
        }
        if theirs.version != WIRE_PROTOCOL_VERSION {
            return Err(WireError::IncompatibleVersion {
                ours: WIRE_PROTOCOL_VERSION,
                theirs: theirs.version,
            }
            .into());
        }
        if theirs.id == self.id {
            return Err(NetworkError::Io("connected to self".into()));
        }

        self.attach(theirs.id.clone(), outbound, reader, writer);
        Ok(theirs.id)
    }

    fn attach(
        self: &Arc<Self>,
        peer: PeerId,
        outbound: bool,
        reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
        writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    ) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

        // Simultaneous dials: keep the connection dialed by the smaller id.
        let keep_new = match self.connections.get(&peer) {
            Some(existing) if existing.outbound != outbound => {
                let new_dialer = if outbound { &self.id } else { &peer };
                new_dialer == std::cmp::min(&self.id, &peer)
            }
            _ => true,
        };
        if !keep_new {
            debug!(%peer, "dropping duplicate connection");
            return;
        }

        self.connections.insert(
            peer.clone(),
            Connection {
                id: conn_id,
                outbound,
                tx,
            },
        );
        info!(%peer, outbound, "peer connected");

        tokio::spawn(self.clone().write_loop(peer.clone(), conn_id, writer, rx));
        tokio::spawn(self.clone().read_loop(peer, conn_id, reader));
    }

    async fn read_loop(
        self: Arc<Self>,
        peer: PeerId,
        conn_id: u64,
        mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let frame = tokio::select! {
                frame = reader.next() => frame,
                _ = shutdown.changed() => break,
            };
            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "read failed");
                    break;
                }
                None => break,
            };
            let envelope = match decode_frame(&bytes) {
                Ok(env) => env,
                Err(e) => {
                    warn!(%peer, error = %e, "undecodable frame, closing connection");
                    break;
                }
            };
            let inbound = Inbound {
                from: peer.clone(),
                envelope,
            };
            if self.inbound.send(inbound).await.is_err() {
                break;
            }
        }
        self.detach(&peer, conn_id);
    }

    async fn write_loop(
        self: Arc<Self>,
        peer: PeerId,
        conn_id: u64,
        mut writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        while let Some(bytes) = rx.recv().await {
            match tokio::time::timeout(self.config.write_timeout, writer.send(bytes)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "write failed");
                    break;
                }
                Err(_) => {
                    warn!(%peer, "write timed out");
                    break;
                }
            }
        }
        self.detach(&peer, conn_id);
    }

    fn detach(&self, peer: &str, conn_id: u64) {
        if self
            .connections
            .remove_if(peer, |_, conn| conn.id == conn_id)
            .is_some()
        {
            info!(%peer, "peer disconnected");
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.iter().map(|c| c.key().clone()).collect();
        peers.sort();
        peers
    }

    async fn send(&self, peer: &str, envelope: &Envelope) -> Result<(), NetworkError> {
        let frame = Bytes::from(encode_frame(envelope)?);
        let tx = self
            .connections
            .get(peer)
            .map(|c| c.tx.clone())
            .ok_or_else(|| NetworkError::Unreachable(peer.to_string()))?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::Congested(peer.to_string()),
            mpsc::error::TrySendError::Closed(_) => NetworkError::Unreachable(peer.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::network::wire::Message;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn wait_for_peer(t: &TcpTransport, peer: &str) {
        for _ in 0..100 {
            if t.peers().iter().any(|p| p == peer) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{peer} never connected");
    }

    #[tokio::test]
    async fn frames_cross_a_real_socket() {
        let (_stop_tx, stop) = watch::channel(false);
        let (a, _rx_a) = TcpTransport::start("node-a".into(), TcpConfig::new(loopback(), vec![]), stop.clone())
            .await
            .unwrap();
        let (b, mut rx_b) = TcpTransport::start("node-b".into(), TcpConfig::new(loopback(), vec![]), stop)
            .await
            .unwrap();

        let remote = a.connect(b.local_addr()).await.unwrap();
        assert_eq!(remote, "node-b");
        wait_for_peer(&b, "node-a").await;

        let kp = Keypair::from_seed(&[4; 32]);
        let env = Envelope::new(&kp, Message::Ping { nonce: 7, height: 3 }, 0).unwrap();
        a.send("node-b", &env).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from, "node-a");
        assert_eq!(got.envelope, env);
    }

    #[tokio::test]
    async fn send_to_unconnected_peer_fails() {
        let (_stop_tx, stop) = watch::channel(false);
        let (a, _rx) = TcpTransport::start("node-a".into(), TcpConfig::new(loopback(), vec![]), stop)
            .await
            .unwrap();
        let kp = Keypair::from_seed(&[4; 32]);
        let env = Envelope::new(&kp, Message::Ping { nonce: 1, height: 0 }, 0).unwrap();
        assert_eq!(
            a.send("node-z", &env).await,
            Err(NetworkError::Unreachable("node-z".into()))
        );
    }

    #[tokio::test]
    async fn configured_peers_are_dialed() {
        let (_stop_tx, stop) = watch::channel(false);
        let (b, _rx_b) = TcpTransport::start("node-b".into(), TcpConfig::new(loopback(), vec![]), stop.clone())
            .await
            .unwrap();
        let mut cfg = TcpConfig::new(loopback(), vec![b.local_addr()]);
        cfg.redial_interval = Duration::from_millis(50);
        let (a, _rx_a) = TcpTransport::start("node-a".into(), cfg, stop).await.unwrap();

        wait_for_peer(&a, "node-b").await;
        wait_for_peer(&b, "node-a").await;
    }
}
