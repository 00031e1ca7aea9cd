//! # Block Structure
//!
//! A block is an ordered batch of proofs plus everything a validator needs to
//! check it without consulting its own mempool.
//!
//! ## Block Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  BlockHeader                                         │
//! │  ├── height: u64                                     │
//! │  ├── round: u32          (round it was built in)     │
//! │  ├── proposer: String    (hex public key)            │
//! │  ├── parent_root: [u8; 32]  (state root before)      │
//! │  ├── state_root: [u8; 32]   (state root after)       │
//! │  ├── proofs_root: [u8; 32]  (Merkle over proof ids)  │
//! │  ├── witness_root: [u8; 32] (last_commit + evidence) │
//! │  ├── timestamp: u64                                  │
//! │  ├── hash: [u8; 32]                                  │
//! │  └── signature                                       │
//! ├──────────────────────────────────────────────────────┤
//! │  proofs: Vec<Proof>                                  │
//! │  last_commit: Vec<Vote>    (precommits of height-1)  │
//! │  evidence: Vec<EquivocationEvidence>                 │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! The hash covers every header field except `hash` and `signature`. Because
//! `proofs_root` and `witness_root` commit to the body, the hash pins the
//! whole block. The proposer signs the hash.
//!
//! A [`CommittedBlock`] pairs a block with the precommit certificate that
//! finalized it. That pair is what the state store persists and what sync
//! ships between nodes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::validator_set::ValidatorSet;
use crate::consensus::vote::{verify_commit, EquivocationEvidence, Vote, VoteError};
use crate::crypto::{domain_separated_hash, merkle_root, verify_hex, Keypair, Signature};
use crate::error::{Classify, FaultClass};
use crate::proof::{Proof, ProofId};

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub round: u32,
    pub proposer: String,
    pub parent_root: [u8; 32],
    pub state_root: [u8; 32],
    pub proofs_root: [u8; 32],
    pub witness_root: [u8; 32],
    /// Unix milliseconds, proposer's clock.
    pub timestamp: u64,
    pub hash: [u8; 32],
    /// Proposer's signature over `hash`.
    pub signature: Signature,
}

impl BlockHeader {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Recompute the header hash from its fields.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut preimage = Vec::with_capacity(256);
        preimage.extend_from_slice(&self.height.to_le_bytes());
        preimage.extend_from_slice(&self.round.to_le_bytes());
        preimage.extend_from_slice(&(self.proposer.len() as u32).to_le_bytes());
        preimage.extend_from_slice(self.proposer.as_bytes());
        preimage.extend_from_slice(&self.parent_root);
        preimage.extend_from_slice(&self.state_root);
        preimage.extend_from_slice(&self.proofs_root);
        preimage.extend_from_slice(&self.witness_root);
        preimage.extend_from_slice(&self.timestamp.to_le_bytes());
        domain_separated_hash("pop 2026-01 block header", &preimage)
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// The parts of a block chosen by the proposer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockBody {
    pub proofs: Vec<Proof>,
    pub last_commit: Vec<Vote>,
    pub evidence: Vec<EquivocationEvidence>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub proofs: Vec<Proof>,
    pub last_commit: Vec<Vote>,
    pub evidence: Vec<EquivocationEvidence>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block {height} hash mismatch")]
    HashMismatch { height: u64 },

    #[error("block {height} proofs_root does not match its proofs")]
    ProofsRootMismatch { height: u64 },

    #[error("block {height} witness_root does not match last_commit/evidence")]
    WitnessRootMismatch { height: u64 },

    #[error("block {height} has an invalid proposer signature")]
    BadSignature { height: u64 },

    #[error("block contains proof {0} twice")]
    DuplicateProof(ProofId),

    #[error("invalid commit certificate: {0}")]
    InvalidCommit(#[from] VoteError),
}

impl Classify for BlockError {
    fn fault_class(&self) -> FaultClass {
        FaultClass::ProtocolViolation
    }
}

impl Block {
    /// Assemble and sign a block.
    pub fn new(
        keypair: &Keypair,
        height: u64,
        round: u32,
        parent_root: [u8; 32],
        state_root: [u8; 32],
        body: BlockBody,
        timestamp: u64,
    ) -> Self {
        let BlockBody {
            proofs,
            last_commit,
            evidence,
        } = body;
        let mut header = BlockHeader {
            height,
            round,
            proposer: keypair.public_key_hex(),
            parent_root,
            state_root,
            proofs_root: compute_proofs_root(&proofs),
            witness_root: compute_witness_root(&last_commit, &evidence),
            timestamp,
            hash: [0u8; 32],
            signature: Signature::empty(),
        };
        header.hash = header.compute_hash();
        header.signature = keypair.sign(&header.hash);
        Self {
            header,
            proofs,
            last_commit,
            evidence,
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> [u8; 32] {
        self.header.hash
    }

    pub fn proof_ids(&self) -> Vec<ProofId> {
        self.proofs.iter().map(|p| p.id).collect()
    }

    /// Self-contained integrity: hash, body roots, proposer signature, no
    /// duplicated proof. Does not consult state or validator sets.
    pub fn verify_integrity(&self) -> Result<(), BlockError> {
        let height = self.header.height;
        if self.header.compute_hash() != self.header.hash {
            return Err(BlockError::HashMismatch { height });
        }
        if compute_proofs_root(&self.proofs) != self.header.proofs_root {
            return Err(BlockError::ProofsRootMismatch { height });
        }
        if compute_witness_root(&self.last_commit, &self.evidence) != self.header.witness_root {
            return Err(BlockError::WitnessRootMismatch { height });
        }
        if !verify_hex(&self.header.proposer, &self.header.hash, &self.header.signature) {
            return Err(BlockError::BadSignature { height });
        }
        let mut seen = std::collections::HashSet::with_capacity(self.proofs.len());
        for proof in &self.proofs {
            if !seen.insert(proof.id) {
                return Err(BlockError::DuplicateProof(proof.id));
            }
        }
        Ok(())
    }

    /// Validators whose precommits appear in `last_commit`, deduplicated.
    pub fn last_commit_signers(&self) -> Vec<String> {
        let mut signers: Vec<String> = self.last_commit.iter().map(|v| v.validator.clone()).collect();
        signers.sort();
        signers.dedup();
        signers
    }
}

/// Merkle root over the ordered proof ids.
pub fn compute_proofs_root(proofs: &[Proof]) -> [u8; 32] {
    let ids: Vec<[u8; 32]> = proofs.iter().map(|p| p.id.0).collect();
    merkle_root(&ids)
}

/// Commitment to the non-proof parts of the body.
pub fn compute_witness_root(last_commit: &[Vote], evidence: &[EquivocationEvidence]) -> [u8; 32] {
    if last_commit.is_empty() && evidence.is_empty() {
        return [0u8; 32];
    }
    let bytes = bincode::serialize(&(last_commit, evidence)).unwrap_or_default();
    domain_separated_hash("pop 2026-01 block witness", &bytes)
}

// ---------------------------------------------------------------------------
// CommittedBlock
// ---------------------------------------------------------------------------

/// A finalized block with the precommits that finalized it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedBlock {
    pub block: Block,
    /// Round in which the precommit quorum formed.
    pub commit_round: u32,
    pub commit: Vec<Vote>,
}

impl CommittedBlock {
    pub fn height(&self) -> u64 {
        self.block.header.height
    }

    pub fn hash(&self) -> [u8; 32] {
        self.block.header.hash
    }

    /// Checks block integrity and that `commit` is a quorum of `set` in
    /// `commit_round`.
    pub fn verify(&self, set: &ValidatorSet) -> Result<(), BlockError> {
        self.block.verify_integrity()?;
        verify_commit(&self.commit, self.height(), self.commit_round, &self.hash(), set)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::validator_set::ValidatorInfo;
    use crate::consensus::vote::VoteStep;
    use crate::proof::{BalanceDelta, ProofPayload, Verdict};

    fn proof(kp: &Keypair, ts: u64) -> Proof {
        Proof::new(
            kp,
            ProofPayload::Plaintext {
                entries: vec![BalanceDelta {
                    account: "alice".into(),
                    delta: 5,
                }],
            },
            Verdict::Proved,
            ts,
            vec![],
        )
    }

    fn block_with(proofs: Vec<Proof>) -> (Keypair, Block) {
        let kp = Keypair::from_seed(&[1; 32]);
        let block = Block::new(
            &kp,
            1,
            0,
            [0; 32],
            [1; 32],
            BlockBody {
                proofs,
                ..Default::default()
            },
            1_700_000_000_000,
        );
        (kp, block)
    }

    #[test]
    fn new_block_verifies() {
        let prover = Keypair::from_seed(&[9; 32]);
        let (_, block) = block_with(vec![proof(&prover, 1), proof(&prover, 2)]);
        assert!(block.verify_integrity().is_ok());
        assert_eq!(block.proof_ids().len(), 2);
    }

    #[test]
    fn empty_block_has_zero_roots() {
        let (_, block) = block_with(vec![]);
        assert_eq!(block.header.proofs_root, [0; 32]);
        assert_eq!(block.header.witness_root, [0; 32]);
        assert!(block.verify_integrity().is_ok());
    }

    #[test]
    fn tampered_header_fails() {
        let (_, mut block) = block_with(vec![]);
        block.header.state_root = [2; 32];
        assert_eq!(
            block.verify_integrity(),
            Err(BlockError::HashMismatch { height: 1 })
        );
    }

    #[test]
    fn swapped_proof_fails_root_check() {
        let prover = Keypair::from_seed(&[9; 32]);
        let (_, mut block) = block_with(vec![proof(&prover, 1)]);
        block.proofs[0] = proof(&prover, 2);
        assert_eq!(
            block.verify_integrity(),
            Err(BlockError::ProofsRootMismatch { height: 1 })
        );
    }

    #[test]
    fn dropped_evidence_fails_witness_check() {
        let kp = Keypair::from_seed(&[1; 32]);
        let byz = Keypair::from_seed(&[2; 32]);
        let ev = EquivocationEvidence::new(
            Vote::new(&byz, 1, 0, VoteStep::Prevote, Some([1; 32])),
            Vote::new(&byz, 1, 0, VoteStep::Prevote, Some([2; 32])),
        );
        let mut block = Block::new(
            &kp,
            2,
            0,
            [0; 32],
            [0; 32],
            BlockBody {
                evidence: vec![ev],
                ..Default::default()
            },
            5,
        );
        block.evidence.clear();
        assert_eq!(
            block.verify_integrity(),
            Err(BlockError::WitnessRootMismatch { height: 2 })
        );
    }

    #[test]
    fn signature_from_other_key_fails() {
        let (_, mut block) = block_with(vec![]);
        let other = Keypair::from_seed(&[7; 32]);
        block.header.signature = other.sign(&block.header.hash);
        assert_eq!(
            block.verify_integrity(),
            Err(BlockError::BadSignature { height: 1 })
        );
    }

    #[test]
    fn duplicate_proof_detected() {
        let prover = Keypair::from_seed(&[9; 32]);
        let p = proof(&prover, 1);
        let (_, block) = block_with(vec![p.clone(), p]);
        assert!(matches!(
            block.verify_integrity(),
            Err(BlockError::DuplicateProof(_))
        ));
    }

    #[test]
    fn committed_block_requires_quorum() {
        let keys: Vec<Keypair> = (1..=4u8).map(|i| Keypair::from_seed(&[i; 32])).collect();
        let set = ValidatorSet::new(
            0,
            keys.iter()
                .map(|k| ValidatorInfo {
                    address: k.public_key_hex(),
                    stake: 10,
                    power: 10,
                })
                .collect(),
        );
        let (_, block) = block_with(vec![]);
        let commit: Vec<Vote> = keys
            .iter()
            .take(3)
            .map(|k| Vote::new(k, 1, 0, VoteStep::Precommit, Some(block.hash())))
            .collect();
        let committed = CommittedBlock {
            block: block.clone(),
            commit_round: 0,
            commit: commit.clone(),
        };
        assert!(committed.verify(&set).is_ok());

        let weak = CommittedBlock {
            block,
            commit_round: 0,
            commit: commit[..2].to_vec(),
        };
        assert!(matches!(weak.verify(&set), Err(BlockError::InvalidCommit(_))));
    }
}
