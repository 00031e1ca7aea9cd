//! Priority-ordered proof pool.
//!
//! Holds `Proved` proofs waiting for block inclusion. Proofs are indexed by
//! id for O(1) duplicate detection and sorted by submitter-assigned priority
//! (then arrival order) in a B-tree for proposal selection.
//!
//! ## Design
//!
//! - `DashMap` holds the entries. Duplicate checks on the gossip hot path
//!   never touch the priority index.
//! - `parking_lot::RwLock<BTreeMap>` is the priority index. Proposers read
//!   the top entries; writers are submissions and evictions.
//! - Proofs in a block that is still being voted on are *reserved*: they
//!   stay in the pool (the round may fail) but are not offered to the next
//!   proposal.
//! - Committed ids are remembered in a bounded FIFO so a late gossip copy of
//!   an already-committed proof is not re-admitted.
//! - When full, the lowest-priority, oldest unreserved proof is evicted for
//!   an incoming proof of strictly higher priority. Otherwise the submitter
//!   gets [`MempoolError::Full`].
//! - Admission (limit checks, eviction, insert) runs under the index write
//!   lock, so concurrent submits never overshoot either limit.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{Classify, FaultClass};
use crate::proof::{Proof, ProofError, ProofId};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of proofs the pool holds.
    pub max_size: usize,

    /// Maximum pending proofs per submitter key.
    pub max_per_submitter: usize,

    /// Proofs older than this (by arrival) are dropped by
    /// [`ProofMempool::expire_old`].
    pub expiry: Duration,

    /// How many committed ids to remember.
    pub committed_memory: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: crate::config::MEMPOOL_MAX_PROOFS,
            max_per_submitter: crate::config::MEMPOOL_MAX_PER_SUBMITTER,
            expiry: crate::config::PROOF_EXPIRY,
            committed_memory: crate::config::SEEN_CACHE_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// PriorityKey — B-tree ordering key
// ---------------------------------------------------------------------------

/// Sorted ascending: highest priority first (priority is stored inverted),
/// then earliest arrival, then id for uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    inverted_priority: u64,
    seq: u64,
    id: ProofId,
}

impl PriorityKey {
    fn priority(&self) -> u64 {
        u64::MAX - self.inverted_priority
    }
}

// ---------------------------------------------------------------------------
// MempoolEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub proof: Proof,
    pub priority: u64,
    /// Arrival sequence number, strictly increasing.
    pub seq: u64,
    /// Unix milliseconds at arrival.
    pub added_at_ms: u64,
}

impl MempoolEntry {
    fn key(&self) -> PriorityKey {
        PriorityKey {
            inverted_priority: u64::MAX - self.priority,
            seq: self.seq,
            id: self.proof.id,
        }
    }
}

// ---------------------------------------------------------------------------
// MempoolError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("proof {0} is already in the mempool")]
    Duplicate(ProofId),

    #[error("proof {0} is already committed")]
    AlreadyCommitted(ProofId),

    #[error("proof {0} was not proved")]
    NotProved(ProofId),

    #[error(transparent)]
    Invalid(#[from] ProofError),

    #[error("submitter {submitter} exceeded per-submitter limit of {limit}")]
    SubmitterLimit { submitter: String, limit: usize },

    #[error("mempool is full ({size} proofs)")]
    Full { size: usize },
}

impl Classify for MempoolError {
    fn fault_class(&self) -> FaultClass {
        match self {
            MempoolError::SubmitterLimit { .. } | MempoolError::Full { .. } => {
                FaultClass::ResourceExhausted
            }
            _ => FaultClass::ProtocolViolation,
        }
    }
}

// ---------------------------------------------------------------------------
// Committed memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CommittedMemory {
    ids: HashSet<ProofId>,
    order: VecDeque<ProofId>,
}

impl CommittedMemory {
    fn remember(&mut self, id: ProofId, capacity: usize) {
        if self.ids.insert(id) {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProofMempool
// ---------------------------------------------------------------------------

pub struct ProofMempool {
    entries: DashMap<ProofId, MempoolEntry>,
    index: RwLock<BTreeMap<PriorityKey, ProofId>>,
    reserved: DashSet<ProofId>,
    committed: Mutex<CommittedMemory>,
    submitter_counts: DashMap<String, usize>,
    seq: AtomicU64,
    config: MempoolConfig,
}

impl fmt::Debug for ProofMempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofMempool")
            .field("size", &self.entries.len())
            .field("reserved", &self.reserved.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ProofMempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            entries: DashMap::new(),
            index: RwLock::new(BTreeMap::new()),
            reserved: DashSet::new(),
            committed: Mutex::new(CommittedMemory::default()),
            submitter_counts: DashMap::new(),
            seq: AtomicU64::new(0),
            config,
        }
    }

    /// Admits a proof. Checks, in order:
    ///
    /// 1. **Duplicate** by id, pending or committed.
    /// 2. **Verdict** must be `Proved`.
    /// 3. **Well-formed** id and signature.
    /// 4. **Per-submitter limit.**
    /// 5. **Capacity**, evicting a lower-priority entry if possible.
    pub fn submit(&self, proof: Proof, priority: u64) -> Result<(), MempoolError> {
        let id = proof.id;
        if self.entries.contains_key(&id) {
            return Err(MempoolError::Duplicate(id));
        }
        if self.committed.lock().ids.contains(&id) {
            return Err(MempoolError::AlreadyCommitted(id));
        }
        if !proof.is_proved() {
            return Err(MempoolError::NotProved(id));
        }
        proof.validate()?;

        let submitter = proof.submitter.clone();
        let mut index = self.index.write();
        let count = self.submitter_counts.get(&submitter).map(|c| *c).unwrap_or(0);
        if count >= self.config.max_per_submitter {
            return Err(MempoolError::SubmitterLimit {
                submitter,
                limit: self.config.max_per_submitter,
            });
        }
        if self.entries.contains_key(&id) {
            return Err(MempoolError::Duplicate(id));
        }
        if self.entries.len() >= self.config.max_size && !self.evict_lowest(&mut index, priority) {
            return Err(MempoolError::Full {
                size: self.config.max_size,
            });
        }

        let entry = MempoolEntry {
            proof,
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            added_at_ms: current_timestamp_ms(),
        };
        index.insert(entry.key(), id);
        self.entries.insert(id, entry);
        *self.submitter_counts.entry(submitter).or_insert(0) += 1;
        drop(index);
        trace!(proof = %id, priority, "proof admitted");
        Ok(())
    }

    pub fn get(&self, id: &ProofId) -> Option<Proof> {
        self.entries.get(id).map(|e| e.proof.clone())
    }

    pub fn contains(&self, id: &ProofId) -> bool {
        self.entries.contains_key(id)
    }

    /// True if `id` was committed recently enough to be remembered.
    pub fn is_committed(&self, id: &ProofId) -> bool {
        self.committed.lock().ids.contains(id)
    }

    /// Up to `max_count` unreserved proofs, highest priority first, then
    /// oldest first. Deterministic for a given pool content.
    pub fn select_for_proposal(&self, max_count: usize) -> Vec<Proof> {
        let ids: Vec<ProofId> = {
            let index = self.index.read();
            index.values().copied().collect()
        };
        let mut out = Vec::with_capacity(max_count.min(ids.len()));
        for id in ids {
            if out.len() >= max_count {
                break;
            }
            if self.reserved.contains(&id) {
                continue;
            }
            if let Some(entry) = self.entries.get(&id) {
                out.push(entry.proof.clone());
            }
        }
        out
    }

    /// Marks proofs as part of an in-flight block.
    pub fn reserve(&self, ids: &[ProofId]) {
        for id in ids {
            if self.entries.contains_key(id) {
                self.reserved.insert(*id);
            }
        }
    }

    /// Returns proofs of an abandoned block to the selectable pool.
    pub fn release(&self, ids: &[ProofId]) {
        for id in ids {
            self.reserved.remove(id);
        }
    }

    pub fn release_all(&self) {
        self.reserved.clear();
    }

    /// Removes committed proofs and remembers their ids. Ids not in the
    /// pool are still remembered.
    pub fn evict(&self, ids: &[ProofId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if self.remove(id).is_some() {
                removed += 1;
            }
        }
        {
            let mut committed = self.committed.lock();
            for id in ids {
                committed.remember(*id, self.config.committed_memory);
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "evicted committed proofs");
        }
        removed
    }

    /// Drops proofs that arrived more than `config.expiry` ago.
    pub fn expire_old(&self) -> usize {
        let cutoff = current_timestamp_ms().saturating_sub(self.config.expiry.as_millis() as u64);
        self.expire_before(cutoff)
    }

    /// Drops unreserved proofs that arrived before `cutoff_ms`.
    pub fn expire_before(&self, cutoff_ms: u64) -> usize {
        let expired: Vec<ProofId> = self
            .entries
            .iter()
            .filter(|e| e.value().added_at_ms < cutoff_ms && !self.reserved.contains(e.key()))
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "expired stale proofs");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn remove(&self, id: &ProofId) -> Option<Proof> {
        let (_, entry) = self.entries.remove(id)?;
        self.index.write().remove(&entry.key());
        self.reserved.remove(id);
        self.decrement_submitter(&entry.proof.submitter);
        Some(entry.proof)
    }

    /// Evicts the oldest entry of the lowest priority present among
    /// unreserved entries, if `incoming` is strictly higher. Runs under the
    /// caller's index lock.
    fn evict_lowest(&self, index: &mut BTreeMap<PriorityKey, ProofId>, incoming: u64) -> bool {
        let victim = {
            let Some(lowest) = index
                .keys()
                .rev()
                .find(|k| !self.reserved.contains(&k.id))
                .map(|k| k.inverted_priority)
            else {
                return false;
            };
            if incoming <= u64::MAX - lowest {
                return false;
            }
            let start = PriorityKey {
                inverted_priority: lowest,
                seq: 0,
                id: ProofId::default(),
            };
            let Some(key) = index
                .range(start..)
                .map(|(k, _)| k)
                .find(|k| !self.reserved.contains(&k.id))
                .cloned()
            else {
                return false;
            };
            index.remove(&key);
            key
        };

        if let Some((_, entry)) = self.entries.remove(&victim.id) {
            self.decrement_submitter(&entry.proof.submitter);
        }
        debug!(
            evicted = %victim.id,
            evicted_priority = victim.priority(),
            incoming_priority = incoming,
            "mempool full, evicted lowest-priority proof"
        );
        true
    }

    fn decrement_submitter(&self, submitter: &str) {
        if let Some(mut count) = self.submitter_counts.get_mut(submitter) {
            if *count <= 1 {
                drop(count);
                self.submitter_counts.remove(submitter);
            } else {
                *count -= 1;
            }
        }
    }
}

impl Default for ProofMempool {
    fn default() -> Self {
        Self::new(MempoolConfig::default())
    }
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::Keypair;
    use crate::proof::{BalanceDelta, ProofPayload, Verdict};

    fn make_proof_from(seed: u8, ts: u64, verdict: Verdict) -> Proof {
        let kp = Keypair::from_seed(&[seed; 32]);
        Proof::new(
            &kp,
            ProofPayload::Plaintext {
                entries: vec![BalanceDelta {
                    account: "alice".into(),
                    delta: ts as i64,
                }],
            },
            verdict,
            ts,
            vec![],
        )
    }

    fn make_proof(ts: u64) -> Proof {
        make_proof_from(1, ts, Verdict::Proved)
    }

    fn small_pool(max_size: usize) -> ProofMempool {
        ProofMempool::new(MempoolConfig {
            max_size,
            ..Default::default()
        })
    }

    // -- Admission ----------------------------------------------------------

    #[test]
    fn submit_and_get() {
        let pool = ProofMempool::default();
        let p = make_proof(1);
        pool.submit(p.clone(), 0).unwrap();
        assert_eq!(pool.get(&p.id), Some(p.clone()));
        assert!(pool.contains(&p.id));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let pool = ProofMempool::default();
        let p = make_proof(1);
        pool.submit(p.clone(), 0).unwrap();
        assert_eq!(pool.submit(p.clone(), 99), Err(MempoolError::Duplicate(p.id)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn failed_verdict_rejected() {
        let pool = ProofMempool::default();
        let p = make_proof_from(1, 1, Verdict::Failed);
        assert_eq!(pool.submit(p.clone(), 0), Err(MempoolError::NotProved(p.id)));
        assert!(pool.is_empty());
    }

    #[test]
    fn tampered_proof_rejected() {
        let pool = ProofMempool::default();
        let mut p = make_proof(1);
        p.timestamp += 1;
        assert!(matches!(
            pool.submit(p, 0),
            Err(MempoolError::Invalid(ProofError::IdMismatch { .. }))
        ));
    }

    #[test]
    fn submitter_limit_enforced() {
        let pool = ProofMempool::new(MempoolConfig {
            max_per_submitter: 2,
            ..Default::default()
        });
        pool.submit(make_proof(1), 0).unwrap();
        pool.submit(make_proof(2), 0).unwrap();
        let err = pool.submit(make_proof(3), 0).unwrap_err();
        assert!(matches!(err, MempoolError::SubmitterLimit { limit: 2, .. }));
        assert_eq!(err.fault_class(), FaultClass::ResourceExhausted);
        pool.submit(make_proof_from(2, 3, Verdict::Proved), 0).unwrap();
    }

    // -- Ordering -----------------------------------------------------------

    #[test]
    fn selection_is_priority_then_arrival() {
        let pool = ProofMempool::default();
        let low = make_proof(1);
        let high = make_proof(2);
        let mid_a = make_proof(3);
        let mid_b = make_proof(4);
        pool.submit(low.clone(), 1).unwrap();
        pool.submit(high.clone(), 10).unwrap();
        pool.submit(mid_a.clone(), 5).unwrap();
        pool.submit(mid_b.clone(), 5).unwrap();

        let ids: Vec<ProofId> = pool.select_for_proposal(10).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![high.id, mid_a.id, mid_b.id, low.id]);
        assert_eq!(pool.select_for_proposal(2).len(), 2);
    }

    // -- Reservation --------------------------------------------------------

    #[test]
    fn reserved_proofs_are_not_selected() {
        let pool = ProofMempool::default();
        let a = make_proof(1);
        let b = make_proof(2);
        pool.submit(a.clone(), 0).unwrap();
        pool.submit(b.clone(), 0).unwrap();

        pool.reserve(&[a.id]);
        assert_eq!(pool.reserved_count(), 1);
        let ids: Vec<ProofId> = pool.select_for_proposal(10).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![b.id]);

        pool.release(&[a.id]);
        assert_eq!(pool.select_for_proposal(10).len(), 2);
    }

    // -- Eviction -----------------------------------------------------------

    #[test]
    fn evicted_proofs_are_remembered() {
        let pool = ProofMempool::default();
        let p = make_proof(1);
        pool.submit(p.clone(), 0).unwrap();
        pool.reserve(&[p.id]);
        assert_eq!(pool.evict(&[p.id]), 1);
        assert!(pool.is_empty());
        assert_eq!(pool.reserved_count(), 0);
        assert!(pool.is_committed(&p.id));
        assert_eq!(pool.submit(p.clone(), 0), Err(MempoolError::AlreadyCommitted(p.id)));
    }

    #[test]
    fn full_pool_evicts_lowest_oldest_for_higher_priority() {
        let pool = small_pool(3);
        let old_low = make_proof(1);
        let new_low = make_proof(2);
        let mid = make_proof(3);
        pool.submit(old_low.clone(), 1).unwrap();
        pool.submit(new_low.clone(), 1).unwrap();
        pool.submit(mid.clone(), 5).unwrap();

        let incoming = make_proof(4);
        pool.submit(incoming.clone(), 2).unwrap();
        assert!(!pool.contains(&old_low.id));
        assert!(pool.contains(&new_low.id));
        assert!(pool.contains(&incoming.id));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn full_pool_rejects_equal_priority() {
        let pool = small_pool(2);
        pool.submit(make_proof(1), 3).unwrap();
        pool.submit(make_proof(2), 3).unwrap();
        let err = pool.submit(make_proof(3), 3).unwrap_err();
        assert_eq!(err, MempoolError::Full { size: 2 });
    }

    #[test]
    fn full_pool_never_evicts_reserved() {
        let pool = small_pool(1);
        let p = make_proof(1);
        pool.submit(p.clone(), 0).unwrap();
        pool.reserve(&[p.id]);
        assert!(matches!(pool.submit(make_proof(2), 100), Err(MempoolError::Full { .. })));
        assert!(pool.contains(&p.id));
    }

    // -- Expiry -------------------------------------------------------------

    #[test]
    fn expire_before_drops_old_unreserved() {
        let pool = ProofMempool::default();
        let a = make_proof(1);
        let b = make_proof(2);
        pool.submit(a.clone(), 0).unwrap();
        pool.submit(b.clone(), 0).unwrap();
        pool.reserve(&[b.id]);

        assert_eq!(pool.expire_before(u64::MAX), 1);
        assert!(!pool.contains(&a.id));
        assert!(pool.contains(&b.id));
        assert_eq!(pool.expire_old(), 0);
    }

    // -- Concurrency --------------------------------------------------------

    #[test]
    fn concurrent_duplicate_submissions_admit_once() {
        use std::thread;

        let pool = Arc::new(ProofMempool::default());
        let proofs: Vec<Proof> = (0..50).map(make_proof).collect();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let proofs = proofs.clone();
            handles.push(thread::spawn(move || {
                proofs
                    .into_iter()
                    .filter(|p| pool.submit(p.clone(), 0).is_ok())
                    .count()
            }));
        }
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert_eq!(pool.len(), 50);
        assert_eq!(pool.select_for_proposal(100).len(), 50);
    }

    /// Runs `threads` submitters over disjoint proofs and returns how many
    /// were admitted.
    fn race(pool: &Arc<ProofMempool>, threads: u64, per_thread: u64, seed: impl Fn(u64) -> u8) -> usize {
        let mut handles = Vec::new();
        for t in 0..threads {
            let pool = Arc::clone(pool);
            let proofs: Vec<Proof> = (0..per_thread)
                .map(|i| {
                    let ts = t * per_thread + i;
                    make_proof_from(seed(ts), ts, Verdict::Proved)
                })
                .collect();
            handles.push(std::thread::spawn(move || {
                proofs
                    .into_iter()
                    .filter(|p| pool.submit(p.clone(), 0).is_ok())
                    .count()
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    }

    #[test]
    fn concurrent_submissions_never_exceed_capacity() {
        let pool = Arc::new(small_pool(8));
        let admitted = race(&pool, 8, 10, |ts| (ts % 200) as u8 + 1);
        assert_eq!(admitted, 8);
        assert_eq!(pool.len(), 8);
    }

    #[test]
    fn concurrent_submissions_never_exceed_submitter_limit() {
        let pool = Arc::new(ProofMempool::new(MempoolConfig {
            max_per_submitter: 3,
            ..Default::default()
        }));
        let admitted = race(&pool, 8, 10, |_| 7);
        assert_eq!(admitted, 3);
        assert_eq!(pool.len(), 3);
    }
}
