//! # State Snapshots
//!
//! A snapshot is the full state at one committed height: accounts, the stake
//! table, the applied-proof index, and the tip block with its commit
//! certificate. A node far behind installs a snapshot instead of replaying
//! every block.
//!
//! Snapshots travel in fixed-size byte chunks. The manifest carries the
//! height, the state root, and a BLAKE3 digest of the concatenated chunks,
//! so a receiver can check each transfer before decoding and then check the
//! decoded state against the root.
//!
//! The root alone is self-referential: whoever builds the snapshot also
//! computes it. What anchors it is the tip block. Its header commits to the
//! same state root, and its precommit certificate must be a quorum of the
//! validator set the snapshot says was voting at that height.
//!
//! That set travels inside the snapshot, so it proves nothing by itself. A
//! receiver also runs [`Snapshot::verify_trusted`] against the set it
//! already votes with: the tip certificate must carry more than a third of
//! that set's power, i.e. at least one validator the receiver trusts to be
//! honest signed the tip.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::block::CommittedBlock;
use super::state::{compute_state_root, Account};
use crate::consensus::stake::StakeTable;
use crate::consensus::validator_set::ValidatorSet;
use crate::crypto::blake3_hash;
use crate::error::{Classify, FaultClass};
use crate::proof::ProofId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub height: u64,
    pub root: [u8; 32],
    /// Sorted by account id.
    pub accounts: Vec<(String, Account)>,
    pub stake_table: StakeTable,
    pub applied_proofs: Vec<(ProofId, u64)>,
    /// The block at `height`. Absent only for a genesis snapshot.
    pub tip: Option<CommittedBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub height: u64,
    pub root: [u8; 32],
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
    /// BLAKE3 of all chunks concatenated.
    pub digest: [u8; 32],
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(String),

    #[error("expected {expected} chunks, got {got}")]
    ChunkCount { expected: u32, got: usize },

    #[error("expected {expected} bytes, got {got}")]
    Length { expected: u64, got: u64 },

    #[error("snapshot digest mismatch")]
    DigestMismatch,

    #[error("snapshot accounts are not strictly sorted")]
    Unsorted,

    #[error("snapshot root mismatch: claimed {expected}, computed {computed}")]
    RootMismatch { expected: String, computed: String },

    #[error("snapshot at height {0} has no tip block")]
    MissingTip(u64),

    #[error("snapshot tip does not anchor the state: {0}")]
    BadTip(String),

    #[error("snapshot tip signed by {signed} of {total} trusted power, need more than a third")]
    Untrusted { signed: u64, total: u64 },
}

impl Classify for SnapshotError {
    fn fault_class(&self) -> FaultClass {
        FaultClass::ProtocolViolation
    }
}

impl Snapshot {
    pub fn compute_root(&self) -> [u8; 32] {
        compute_state_root(
            self.accounts.iter().map(|(id, acct)| (id.as_str(), acct)),
            &self.stake_table.digest(),
        )
    }

    /// Checks internal consistency: sorted accounts, root, and the tip's
    /// header and commit certificate.
    pub fn verify(&self) -> Result<(), SnapshotError> {
        if self.accounts.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(SnapshotError::Unsorted);
        }
        let computed = self.compute_root();
        if computed != self.root {
            return Err(SnapshotError::RootMismatch {
                expected: hex::encode(self.root),
                computed: hex::encode(computed),
            });
        }
        if self.height == 0 {
            return Ok(());
        }
        let tip = self.tip.as_ref().ok_or(SnapshotError::MissingTip(self.height))?;
        if tip.height() != self.height {
            return Err(SnapshotError::BadTip(format!(
                "tip is height {}, snapshot is {}",
                tip.height(),
                self.height
            )));
        }
        if tip.block.header.state_root != self.root {
            return Err(SnapshotError::BadTip("tip state_root differs".into()));
        }
        let set = self
            .stake_table
            .set_for_height(self.height)
            .ok_or_else(|| SnapshotError::BadTip("no validator set for tip height".into()))?;
        tip.verify(set).map_err(|e| SnapshotError::BadTip(e.to_string()))
    }

    /// Checks that `trusted`, a validator set the caller already relies on,
    /// vouches for the tip. Call after [`verify`](Self::verify).
    pub fn verify_trusted(&self, trusted: &ValidatorSet) -> Result<(), SnapshotError> {
        let tip = self.tip.as_ref().ok_or(SnapshotError::MissingTip(self.height))?;
        let mut signers: Vec<&str> = tip
            .commit
            .iter()
            .filter(|v| v.round == tip.commit_round && v.block_hash == Some(tip.hash()))
            .map(|v| v.validator.as_str())
            .collect();
        signers.sort_unstable();
        signers.dedup();
        let signed: u64 = signers.iter().map(|v| trusted.power_of(v)).sum();
        if !trusted.exceeds_one_third(signed) {
            return Err(SnapshotError::Untrusted {
                signed,
                total: trusted.total_power(),
            });
        }
        Ok(())
    }

    /// Serializes and splits into chunks of at most `chunk_size` bytes.
    pub fn to_chunks(
        &self,
        chunk_size: usize,
    ) -> Result<(SnapshotManifest, Vec<Vec<u8>>), SnapshotError> {
        let bytes = bincode::serialize(self).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Vec<u8>> = bytes.chunks(chunk_size).map(|c| c.to_vec()).collect();
        let manifest = SnapshotManifest {
            height: self.height,
            root: self.root,
            total_bytes: bytes.len() as u64,
            chunk_size: chunk_size as u64,
            chunk_count: chunks.len() as u32,
            digest: blake3_hash(&bytes),
        };
        Ok((manifest, chunks))
    }

    /// Reassembles chunks, checks them against the manifest, decodes, and
    /// verifies the result.
    pub fn from_chunks(
        manifest: &SnapshotManifest,
        chunks: &[Vec<u8>],
    ) -> Result<Self, SnapshotError> {
        if chunks.len() != manifest.chunk_count as usize {
            return Err(SnapshotError::ChunkCount {
                expected: manifest.chunk_count,
                got: chunks.len(),
            });
        }
        let bytes = chunks.concat();
        if bytes.len() as u64 != manifest.total_bytes {
            return Err(SnapshotError::Length {
                expected: manifest.total_bytes,
                got: bytes.len() as u64,
            });
        }
        if blake3_hash(&bytes) != manifest.digest {
            return Err(SnapshotError::DigestMismatch);
        }
        let snapshot: Snapshot =
            bincode::deserialize(&bytes).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        if snapshot.height != manifest.height || snapshot.root != manifest.root {
            return Err(SnapshotError::RootMismatch {
                expected: hex::encode(manifest.root),
                computed: hex::encode(snapshot.root),
            });
        }
        snapshot.verify()?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::stake::StakeConfig;

    fn genesis_snapshot(n: usize) -> Snapshot {
        let accounts: Vec<(String, Account)> = (0..n)
            .map(|i| {
                (
                    format!("acct-{i:04}"),
                    Account {
                        balance: i as u64 * 10,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let stake_table = StakeTable::genesis(StakeConfig::default(), &[("v".into(), 5_000)]);
        let mut snap = Snapshot {
            height: 0,
            root: [0; 32],
            accounts,
            stake_table,
            applied_proofs: vec![],
            tip: None,
        };
        snap.root = snap.compute_root();
        snap
    }

    #[test]
    fn chunks_reassemble() {
        let snap = genesis_snapshot(200);
        let (manifest, chunks) = snap.to_chunks(512).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 512));
        assert_eq!(Snapshot::from_chunks(&manifest, &chunks).unwrap(), snap);
    }

    #[test]
    fn missing_chunk_rejected() {
        let (manifest, mut chunks) = genesis_snapshot(200).to_chunks(512).unwrap();
        chunks.pop();
        assert!(matches!(
            Snapshot::from_chunks(&manifest, &chunks),
            Err(SnapshotError::ChunkCount { .. })
        ));
    }

    #[test]
    fn corrupted_chunk_rejected() {
        let (manifest, mut chunks) = genesis_snapshot(50).to_chunks(256).unwrap();
        chunks[0][0] ^= 0xff;
        assert_eq!(
            Snapshot::from_chunks(&manifest, &chunks),
            Err(SnapshotError::DigestMismatch)
        );
    }

    #[test]
    fn tampered_balance_breaks_root() {
        let mut snap = genesis_snapshot(5);
        snap.accounts[2].1.balance += 1;
        assert!(matches!(snap.verify(), Err(SnapshotError::RootMismatch { .. })));
    }

    #[test]
    fn unsorted_accounts_rejected() {
        let mut snap = genesis_snapshot(5);
        snap.accounts.swap(0, 1);
        assert_eq!(snap.verify(), Err(SnapshotError::Unsorted));
    }

    #[test]
    fn trust_check_needs_a_tip() {
        let snap = genesis_snapshot(3);
        let trusted = snap.stake_table.set_for_height(1).unwrap().clone();
        assert_eq!(snap.verify_trusted(&trusted), Err(SnapshotError::MissingTip(0)));
    }

    #[test]
    fn non_genesis_snapshot_needs_tip() {
        let mut snap = genesis_snapshot(3);
        snap.height = 7;
        assert_eq!(snap.verify(), Err(SnapshotError::MissingTip(7)));
    }
}
