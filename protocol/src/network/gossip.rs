//! # Gossip Protocol
//!
//! Epidemic propagation of proofs, consensus messages, and evidence. The
//! originating node sends to every neighbour; each relay that sees a message
//! for the first time delivers it locally and forwards it to a random subset
//! of its neighbours (fanout), never back to the neighbour it came from or
//! to the originator.
//!
//! ## Deduplication
//!
//! Every envelope is identified by its content hash, which excludes the TTL
//! so copies arriving over different paths collapse to one. Nodes keep a
//! bounded set of recently seen hashes (capped at `seen_cache_size`). When
//! the set overflows, the oldest quarter is evicted.
//!
//! ## TTL
//!
//! The envelope TTL decrements on every relay hop. A message arriving with
//! TTL zero is still delivered locally but not forwarded. Point-to-point
//! kinds (ping, sync) are never forwarded.
//!
//! This module does no I/O. It returns [`GossipAction`]s that the P2P
//! layer carries out.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::transport::PeerId;
use super::wire::{Envelope, Topic};
use crate::config::{DEFAULT_GOSSIP_TTL, GOSSIP_FANOUT, SEEN_CACHE_SIZE};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Number of neighbours a relay forwards each message to.
    pub fanout: usize,
    /// Maximum number of message hashes kept for deduplication.
    pub seen_cache_size: usize,
    /// Hop budget for proofs and evidence.
    pub message_ttl: u8,
    /// Hop budget for proposals and votes. Validators are usually directly
    /// connected, so consensus traffic needs few relays.
    pub consensus_ttl: u8,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: GOSSIP_FANOUT,
            seen_cache_size: SEEN_CACHE_SIZE,
            message_ttl: DEFAULT_GOSSIP_TTL,
            consensus_ttl: 2,
        }
    }
}

impl GossipConfig {
    pub fn ttl_for(&self, topic: Topic) -> u8 {
        match topic {
            Topic::Consensus => self.consensus_ttl,
            Topic::Proofs | Topic::Evidence => self.message_ttl,
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    Unhashable,
}

#[derive(Debug, Clone)]
pub enum GossipAction {
    /// Hand the message to the local node.
    Deliver(Envelope),
    /// Relay the envelope (TTL already decremented) to `targets`.
    Forward {
        envelope: Envelope,
        targets: Vec<PeerId>,
    },
    Drop(DropReason),
}

// ---------------------------------------------------------------------------
// Gossip Protocol
// ---------------------------------------------------------------------------

pub struct GossipProtocol {
    config: GossipConfig,
    /// Content hash to insertion sequence, for oldest-first eviction.
    seen_messages: DashMap<[u8; 32], u64>,
    seq: AtomicU64,
}

impl GossipProtocol {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            config,
            seen_messages: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Records `hash`. Returns true if it had not been seen before.
    pub fn mark_seen(&self, hash: [u8; 32]) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let fresh = match self.seen_messages.entry(hash) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(seq);
                true
            }
        };
        if fresh {
            self.maybe_evict_seen_cache();
        }
        fresh
    }

    pub fn has_seen(&self, hash: &[u8; 32]) -> bool {
        self.seen_messages.contains_key(hash)
    }

    /// Targets for a message this node originates: every neighbour. The
    /// envelope is marked seen so echoes are dropped.
    pub fn broadcast_targets(&self, envelope: &Envelope, peers: &[PeerId]) -> Vec<PeerId> {
        if let Ok(hash) = envelope.content_hash() {
            self.mark_seen(hash);
        }
        peers
            .iter()
            .filter(|p| **p != envelope.sender)
            .cloned()
            .collect()
    }

    /// Decides what to do with an envelope received from neighbour `from`.
    pub fn handle_message(&self, from: &str, envelope: Envelope, peers: &[PeerId]) -> Vec<GossipAction> {
        let hash = match envelope.content_hash() {
            Ok(h) => h,
            Err(_) => return vec![GossipAction::Drop(DropReason::Unhashable)],
        };
        if !self.mark_seen(hash) {
            trace!(peer = from, kind = ?envelope.kind, "dropping duplicate gossip message");
            return vec![GossipAction::Drop(DropReason::Duplicate)];
        }

        let mut actions = Vec::with_capacity(2);
        if envelope.kind.topic().is_some() && envelope.ttl > 0 {
            let targets = self.select_relays(peers, &[from, envelope.sender.as_str()]);
            if !targets.is_empty() {
                let mut forwarded = envelope.clone();
                forwarded.ttl -= 1;
                actions.push(GossipAction::Forward {
                    envelope: forwarded,
                    targets,
                });
            }
        }
        actions.push(GossipAction::Deliver(envelope));
        actions
    }

    fn select_relays(&self, peers: &[PeerId], exclude: &[&str]) -> Vec<PeerId> {
        let candidates: Vec<&PeerId> = peers
            .iter()
            .filter(|p| !exclude.contains(&p.as_str()))
            .collect();
        candidates
            .choose_multiple(&mut rand::thread_rng(), self.config.fanout)
            .map(|p| (*p).clone())
            .collect()
    }

    pub fn seen_count(&self) -> usize {
        self.seen_messages.len()
    }

    /// Evicts the oldest entries once the cache exceeds capacity, down to
    /// 75% of it.
    fn maybe_evict_seen_cache(&self) {
        if self.seen_messages.len() <= self.config.seen_cache_size {
            return;
        }
        let target = self.config.seen_cache_size * 3 / 4;
        let mut entries: Vec<([u8; 32], u64)> = self
            .seen_messages
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_by_key(|(_, seq)| *seq);

        let to_remove = entries.len().saturating_sub(target);
        for (hash, _) in entries.iter().take(to_remove) {
            self.seen_messages.remove(hash);
        }
    }
}
