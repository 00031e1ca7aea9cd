//! # Votes, Vote Sets, and Equivocation Evidence
//!
//! A vote is a validator's signed statement about one `(height, round, step)`
//! slot: either a block hash or nil. A correct validator signs at most one
//! vote per slot. Two different votes for the same slot from the same key
//! are *equivocation*, and the pair is self-contained proof of misbehaviour
//! that anyone can verify and submit for slashing.
//!
//! [`VoteSet`] tallies one slot's votes by power and detects equivocation
//! as it goes. The conflicting vote is never counted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::validator_set::ValidatorSet;
use crate::crypto::{domain_separated_hash, verify_hex, Keypair, Signature};
use crate::error::{Classify, FaultClass};

const VOTE_CONTEXT: &str = "pop 2026-01 vote";

/// Which half of a round a vote belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteStep {
    Prevote,
    Precommit,
}

/// A signed prevote or precommit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: u64,
    pub round: u32,
    pub step: VoteStep,
    /// `None` is a nil vote.
    pub block_hash: Option<[u8; 32]>,
    /// Hex public key of the voter.
    pub validator: String,
    pub signature: Signature,
}

impl Vote {
    pub fn new(
        keypair: &Keypair,
        height: u64,
        round: u32,
        step: VoteStep,
        block_hash: Option<[u8; 32]>,
    ) -> Self {
        let digest = Self::signing_digest(height, round, step, block_hash.as_ref());
        Self {
            height,
            round,
            step,
            block_hash,
            validator: keypair.public_key_hex(),
            signature: keypair.sign(&digest),
        }
    }

    /// The 32-byte digest a voter signs. Height, round, and step are all
    /// covered so a vote can't be replayed into another slot.
    pub fn signing_digest(
        height: u64,
        round: u32,
        step: VoteStep,
        block_hash: Option<&[u8; 32]>,
    ) -> [u8; 32] {
        let mut buf = Vec::with_capacity(8 + 4 + 1 + 1 + 32);
        buf.extend_from_slice(&height.to_le_bytes());
        buf.extend_from_slice(&round.to_le_bytes());
        buf.push(match step {
            VoteStep::Prevote => 1,
            VoteStep::Precommit => 2,
        });
        match block_hash {
            Some(h) => {
                buf.push(1);
                buf.extend_from_slice(h);
            }
            None => buf.push(0),
        }
        domain_separated_hash(VOTE_CONTEXT, &buf)
    }

    pub fn verify(&self) -> bool {
        let digest =
            Self::signing_digest(self.height, self.round, self.step, self.block_hash.as_ref());
        verify_hex(&self.validator, &digest, &self.signature)
    }

    pub fn is_nil(&self) -> bool {
        self.block_hash.is_none()
    }

    /// Identity of the slot this vote fills.
    pub fn slot(&self) -> (String, u64, u32, VoteStep) {
        (self.validator.clone(), self.height, self.round, self.step)
    }
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// Two conflicting votes signed by the same validator for the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivocationEvidence {
    pub first: Vote,
    pub second: Vote,
}

impl EquivocationEvidence {
    /// Orders the pair canonically so the same misbehaviour observed in a
    /// different order yields identical evidence.
    pub fn new(a: Vote, b: Vote) -> Self {
        if a.block_hash <= b.block_hash {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn validator(&self) -> &str {
        &self.first.validator
    }

    pub fn height(&self) -> u64 {
        self.first.height
    }

    /// Dedup key: one slashing per (validator, height, round, step).
    pub fn key(&self) -> (String, u64, u32, VoteStep) {
        self.first.slot()
    }

    /// Stable digest of the evidence, used as its storage key.
    pub fn id(&self) -> [u8; 32] {
        let (validator, height, round, step) = self.key();
        let mut buf = validator.into_bytes();
        buf.extend_from_slice(&height.to_le_bytes());
        buf.extend_from_slice(&round.to_le_bytes());
        buf.push(step as u8);
        domain_separated_hash("pop 2026-01 evidence", &buf)
    }

    /// Checks the pair really is equivocation: same slot, same signer,
    /// different content, both signatures valid.
    pub fn verify(&self) -> Result<(), VoteError> {
        if self.first.slot() != self.second.slot() {
            return Err(VoteError::InvalidEvidence("votes are for different slots".into()));
        }
        if self.first.block_hash == self.second.block_hash {
            return Err(VoteError::InvalidEvidence("votes do not conflict".into()));
        }
        if !self.first.verify() || !self.second.verify() {
            return Err(VoteError::BadSignature(self.first.validator.clone()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("vote for wrong slot: expected h={expected_height} r={expected_round} {expected_step:?}")]
    WrongSlot {
        expected_height: u64,
        expected_round: u32,
        expected_step: VoteStep,
    },

    #[error("vote from non-validator {0}")]
    UnknownValidator(String),

    #[error("invalid vote signature from {0}")]
    BadSignature(String),

    #[error("invalid evidence: {0}")]
    InvalidEvidence(String),
}

impl Classify for VoteError {
    fn fault_class(&self) -> FaultClass {
        FaultClass::ProtocolViolation
    }
}

// ---------------------------------------------------------------------------
// Vote Set
// ---------------------------------------------------------------------------

/// Result of adding a vote to a [`VoteSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddVoteOutcome {
    /// Counted.
    Added,
    /// Identical to a vote already held; nothing changed.
    Duplicate,
    /// Conflicts with the held vote. Not counted.
    Equivocation(EquivocationEvidence),
}

/// All votes of one step in one round of one height, tallied by power.
#[derive(Debug, Clone)]
pub struct VoteSet {
    height: u64,
    round: u32,
    step: VoteStep,
    votes: HashMap<String, Vote>,
    power_by_hash: HashMap<Option<[u8; 32]>, u64>,
    total_seen: u64,
}

impl VoteSet {
    pub fn new(height: u64, round: u32, step: VoteStep) -> Self {
        Self {
            height,
            round,
            step,
            votes: HashMap::new(),
            power_by_hash: HashMap::new(),
            total_seen: 0,
        }
    }

    /// Verify and count a vote.
    pub fn add_vote(&mut self, vote: Vote, set: &ValidatorSet) -> Result<AddVoteOutcome, VoteError> {
        if vote.height != self.height || vote.round != self.round || vote.step != self.step {
            return Err(VoteError::WrongSlot {
                expected_height: self.height,
                expected_round: self.round,
                expected_step: self.step,
            });
        }
        let power = set.power_of(&vote.validator);
        if power == 0 {
            return Err(VoteError::UnknownValidator(vote.validator.clone()));
        }
        if !vote.verify() {
            return Err(VoteError::BadSignature(vote.validator.clone()));
        }

        if let Some(existing) = self.votes.get(&vote.validator) {
            if existing.block_hash == vote.block_hash {
                return Ok(AddVoteOutcome::Duplicate);
            }
            return Ok(AddVoteOutcome::Equivocation(EquivocationEvidence::new(
                existing.clone(),
                vote,
            )));
        }

        *self.power_by_hash.entry(vote.block_hash).or_insert(0) += power;
        self.total_seen += power;
        self.votes.insert(vote.validator.clone(), vote);
        Ok(AddVoteOutcome::Added)
    }

    /// The value (block hash or nil) holding a >2/3 quorum, if any.
    pub fn quorum_value(&self, set: &ValidatorSet) -> Option<Option<[u8; 32]>> {
        self.power_by_hash
            .iter()
            .find(|(_, power)| set.is_quorum(**power))
            .map(|(hash, _)| *hash)
    }

    /// True if >2/3 of power has voted at all, for any mix of values.
    pub fn has_any_quorum(&self, set: &ValidatorSet) -> bool {
        set.is_quorum(self.total_seen)
    }

    pub fn power_seen(&self) -> u64 {
        self.total_seen
    }

    pub fn power_for(&self, block_hash: Option<&[u8; 32]>) -> u64 {
        self.power_by_hash.get(&block_hash.copied()).copied().unwrap_or(0)
    }

    /// Votes for `block_hash`, sorted by validator so certificates are
    /// byte-identical across nodes holding the same votes.
    pub fn votes_for(&self, block_hash: Option<&[u8; 32]>) -> Vec<Vote> {
        let mut out: Vec<Vote> = self
            .votes
            .values()
            .filter(|v| v.block_hash.as_ref() == block_hash)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.validator.cmp(&b.validator));
        out
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// Checks that `votes` are valid precommits for `(height, round, block_hash)`
/// whose combined power is a quorum of `set`. A quorum only counts within
/// one round. Used for `last_commit` and for certificates received during
/// sync.
pub fn verify_commit(
    votes: &[Vote],
    height: u64,
    round: u32,
    block_hash: &[u8; 32],
    set: &ValidatorSet,
) -> Result<(), VoteError> {
    let mut seen = std::collections::HashSet::new();
    let mut power = 0u64;
    for vote in votes {
        if vote.height != height || vote.round != round || vote.step != VoteStep::Precommit {
            return Err(VoteError::WrongSlot {
                expected_height: height,
                expected_round: round,
                expected_step: VoteStep::Precommit,
            });
        }
        if vote.block_hash.as_ref() != Some(block_hash) {
            return Err(VoteError::InvalidEvidence(format!(
                "commit vote from {} is for a different block",
                vote.validator
            )));
        }
        if !seen.insert(vote.validator.as_str()) {
            continue;
        }
        let p = set.power_of(&vote.validator);
        if p == 0 {
            return Err(VoteError::UnknownValidator(vote.validator.clone()));
        }
        if !vote.verify() {
            return Err(VoteError::BadSignature(vote.validator.clone()));
        }
        power += p;
    }
    if !set.is_quorum(power) {
        return Err(VoteError::InvalidEvidence(format!(
            "commit power {power} of {} is not a quorum",
            set.total_power()
        )));
    }
    Ok(())
}
