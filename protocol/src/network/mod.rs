//! # Network Module
//!
//! Everything between "a node wants to say something" and "bytes on a
//! socket": the signed wire envelope, transports, gossip relaying,
//! request/response correlation, latency monitoring, and the P2P/HTTP sync
//! mode switch.
//!
//! ## Architecture
//!
//! ```text
//! wire.rs       — Envelope, Message, framing (magic + version + bincode)
//! transport.rs  — Transport trait, NetworkError, in-memory hub
//! tcp.rs        — TcpTransport: length-delimited frames over tokio TCP
//! gossip.rs     — dedup cache, TTL, fanout relay decisions
//! p2p.rs        — P2pNetwork: broadcast, send_to_peer, request, ping
//! monitor.rs    — NetworkMonitor: latency windows, TtlCache, probing
//! sync_mode.rs  — SyncModeController: p2p | http | auto
//! ```
//!
//! ## Design Decisions
//!
//! - Transports are dumb pipes. Signature checks, dedup, and relaying live
//!   in `P2pNetwork`, so the in-memory hub and TCP behave identically above
//!   the transport line.
//! - The in-memory hub still encodes and decodes every frame. Simulations
//!   catch serialization bugs the same way a real network would.
//! - Gossip dedup is keyed by the envelope's signed content hash, which
//!   excludes the TTL. A relayed copy is the same message.
//! - Every wait on a peer is bounded: connect, write, request, and probe
//!   timeouts all come from `config.rs`.

pub mod gossip;
pub mod monitor;
pub mod p2p;
pub mod sync_mode;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use gossip::{GossipAction, GossipConfig, GossipProtocol};
pub use monitor::{MonitorConfig, NetworkHealth, NetworkMonitor, PeerLatency, Pinger, TtlCache};
pub use p2p::{P2pConfig, P2pNetwork};
pub use sync_mode::{SyncMode, SyncModeConfig, SyncModeController, SyncSetting};
pub use tcp::{TcpConfig, TcpTransport};
pub use transport::{Inbound, MemoryNetwork, MemoryTransport, NetworkError, PeerId, Transport};
pub use wire::{Envelope, Message, MessageKind, Topic, WireError};
