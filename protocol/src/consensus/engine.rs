//! # Consensus Engine
//!
//! A Tendermint-style round state machine. One instance drives one validator
//! through successive heights; each height runs rounds until a block gathers
//! a precommit quorum.
//!
//! ```text
//! NewHeight ─► Propose ─► Prevote ─► Precommit ─► Commit
//!                 ▲                      │
//!                 └──── round + 1 ◄──────┘  (timeout, no quorum)
//! ```
//!
//! ## Rules
//!
//! - **Propose.** The stake-weighted proposer for `(height, round)` broadcasts
//!   its valid block if it has one, otherwise a fresh block from the context.
//! - **Prevote.** A validator prevotes the proposal if the block is valid and
//!   it is not locked on a different block. A proposal that re-offers a block
//!   with a polka from round `vr` may unlock validators locked at or before
//!   `vr`. Otherwise it prevotes nil.
//! - **Precommit.** A prevote quorum (>2/3 of power) for the proposal locks
//!   the validator on it and it precommits. A nil quorum, or the prevote
//!   timeout, yields a nil precommit.
//! - **Commit.** A precommit quorum for a block the engine holds decides the
//!   height. The commit certificate is the sorted set of those precommits.
//! - **Round skip.** Messages from >1/3 of power at a later round move the
//!   engine to that round.
//!
//! ## Purity
//!
//! The engine does no I/O and keeps no clocks. Inputs are proposals, votes,
//! and fired timeouts; outputs are [`ConsensusOutput`] actions for the node
//! to carry out. Block building and validation go through
//! [`ConsensusContext`], which the node backs with the state store and the
//! mempool.
//!
//! ## Heights
//!
//! Messages for the next height are buffered (bounded) and replayed when
//! it starts. Older heights are ignored. Anything further ahead is reported
//! as [`ConsensusError::FutureHeight`]: the node is behind and must sync.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BLOCK_INTERVAL, MAX_BUFFERED_MESSAGES};
use crate::consensus::timeout::{TimeoutConfig, TimeoutPolicy};
use crate::consensus::validator_set::ValidatorSet;
use crate::consensus::vote::{AddVoteOutcome, EquivocationEvidence, Vote, VoteError, VoteSet, VoteStep};
use crate::crypto::{domain_separated_hash, verify_hex, Keypair, Signature};
use crate::error::{Classify, FaultClass};
use crate::storage::{Block, CommittedBlock, StateError};

const PROPOSAL_CONTEXT: &str = "pop 2026-01 proposal";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub timeouts: TimeoutConfig,
    /// Pause between a commit and the start of the next height.
    pub block_interval: Duration,
    /// Cap on buffered next-height messages.
    pub max_buffered: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            block_interval: BLOCK_INTERVAL,
            max_buffered: MAX_BUFFERED_MESSAGES,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    NewHeight,
    Propose,
    Prevote,
    Precommit,
    Commit,
}

/// A proposer's signed offer of `block` for `(height, round)`.
///
/// `pol_round` is set when the block is re-proposed because it gathered a
/// prevote quorum in that earlier round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub pol_round: Option<u32>,
    pub block: Block,
    pub proposer: String,
    pub signature: Signature,
}

impl Proposal {
    pub fn new(keypair: &Keypair, height: u64, round: u32, pol_round: Option<u32>, block: Block) -> Self {
        let digest = Self::signing_digest(height, round, pol_round, &block.hash());
        Self {
            height,
            round,
            pol_round,
            block,
            proposer: keypair.public_key_hex(),
            signature: keypair.sign(&digest),
        }
    }

    pub fn signing_digest(height: u64, round: u32, pol_round: Option<u32>, block_hash: &[u8; 32]) -> [u8; 32] {
        let mut buf = Vec::with_capacity(8 + 4 + 5 + 32);
        buf.extend_from_slice(&height.to_le_bytes());
        buf.extend_from_slice(&round.to_le_bytes());
        match pol_round {
            Some(r) => {
                buf.push(1);
                buf.extend_from_slice(&r.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(block_hash);
        domain_separated_hash(PROPOSAL_CONTEXT, &buf)
    }

    pub fn verify(&self) -> bool {
        let digest = Self::signing_digest(self.height, self.round, self.pol_round, &self.block.hash());
        verify_hex(&self.proposer, &digest, &self.signature)
    }

    pub fn block_hash(&self) -> [u8; 32] {
        self.block.hash()
    }
}

/// What the node must do on the engine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutput {
    BroadcastProposal(Proposal),
    BroadcastVote(Vote),
    /// Call [`ConsensusEngine::on_timeout`] with these arguments after
    /// `after` elapses.
    ScheduleTimeout {
        height: u64,
        round: u32,
        step: Step,
        after: Duration,
    },
    /// The height is decided. Apply it, then call
    /// [`ConsensusEngine::start_height`].
    Commit(CommittedBlock),
    /// A validator signed two different votes for one slot.
    Evidence(EquivocationEvidence),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    pub locked_round: Option<u32>,
    pub valid_round: Option<u32>,
    pub halted: bool,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("proposal for ({height}, {round}) from {got}, expected proposer {expected}")]
    WrongProposer {
        height: u64,
        round: u32,
        expected: String,
        got: String,
    },

    #[error("proposal signature from {0} does not verify")]
    BadProposalSignature(String),

    #[error("malformed proposal: {0}")]
    MalformedProposal(String),

    #[error("conflicting proposal for round {round} from {proposer}")]
    ConflictingProposal { round: u32, proposer: String },

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error("message for height {got} while at height {current}")]
    FutureHeight { current: u64, got: u64 },

    #[error("next-height buffer is full ({0} messages)")]
    BufferFull(usize),

    #[error("consensus halted: {0}")]
    Halted(String),
}

impl Classify for ConsensusError {
    fn fault_class(&self) -> FaultClass {
        match self {
            ConsensusError::WrongProposer { .. }
            | ConsensusError::BadProposalSignature(_)
            | ConsensusError::MalformedProposal(_)
            | ConsensusError::ConflictingProposal { .. }
            | ConsensusError::Vote(_) => FaultClass::ProtocolViolation,
            ConsensusError::FutureHeight { .. } => FaultClass::Network,
            ConsensusError::BufferFull(_) => FaultClass::ResourceExhausted,
            ConsensusError::Halted(_) => FaultClass::Consistency,
        }
    }
}

/// Block production and validation, backed by local state.
pub trait ConsensusContext: Send + Sync {
    /// Builds and signs a new block for `(height, round)`.
    fn build_block(&self, height: u64, round: u32) -> Result<Block, StateError>;

    /// Full validation against local state, including the dry-run root.
    fn validate_block(&self, block: &Block) -> Result<(), StateError>;
}

enum Buffered {
    Proposal(Proposal),
    Vote(Vote),
}

// ---------------------------------------------------------------------------
// Consensus Engine
// ---------------------------------------------------------------------------

pub struct ConsensusEngine {
    config: ConsensusConfig,
    keypair: Keypair,
    address: String,
    context: Arc<dyn ConsensusContext>,
    timeouts: TimeoutPolicy,
    avg_latency: Duration,

    height: u64,
    round: u32,
    step: Step,
    validators: ValidatorSet,

    locked: Option<(u32, Block)>,
    valid: Option<(u32, Block)>,
    decided: bool,
    halted: Option<String>,

    proposals: BTreeMap<u32, Proposal>,
    blocks: HashMap<[u8; 32], Block>,
    validity: HashMap<[u8; 32], bool>,
    prevotes: BTreeMap<u32, VoteSet>,
    precommits: BTreeMap<u32, VoteSet>,
    /// Validators heard from per round, for the round-skip rule.
    round_senders: BTreeMap<u32, HashSet<String>>,
    evidence_seen: HashSet<[u8; 32]>,
    buffered: Vec<Buffered>,

    // One-shot triggers for the current round.
    polka_handled: bool,
    prevote_wait_scheduled: bool,
    precommit_wait_scheduled: bool,
}

impl ConsensusEngine {
    /// Creates an engine idle at height 0. Call [`start_height`] to begin.
    ///
    /// [`start_height`]: Self::start_height
    pub fn new(
        config: ConsensusConfig,
        keypair: Keypair,
        context: Arc<dyn ConsensusContext>,
        validators: ValidatorSet,
    ) -> Self {
        let timeouts = TimeoutPolicy::new(config.timeouts.clone());
        let address = keypair.public_key_hex();
        Self {
            config,
            keypair,
            address,
            context,
            timeouts,
            avg_latency: Duration::ZERO,
            height: 0,
            round: 0,
            step: Step::NewHeight,
            validators,
            locked: None,
            valid: None,
            decided: false,
            halted: None,
            proposals: BTreeMap::new(),
            blocks: HashMap::new(),
            validity: HashMap::new(),
            prevotes: BTreeMap::new(),
            precommits: BTreeMap::new(),
            round_senders: BTreeMap::new(),
            evidence_seen: HashSet::new(),
            buffered: Vec::new(),
            polka_handled: false,
            prevote_wait_scheduled: false,
            precommit_wait_scheduled: false,
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            height: self.height,
            round: self.round,
            step: self.step,
            locked_round: self.locked.as_ref().map(|(r, _)| *r),
            valid_round: self.valid.as_ref().map(|(r, _)| *r),
            halted: self.halted.is_some(),
        }
    }

    /// Measured network latency, used to size timeouts.
    pub fn set_avg_latency(&mut self, latency: Duration) {
        self.avg_latency = latency;
    }

    /// Stops all voting after a local consistency failure. Permanent for the
    /// life of the engine.
    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(height = self.height, round = self.round, %reason, "consensus halted");
        self.halted = Some(reason);
    }

    // -- Heights and rounds -------------------------------------------------

    /// Begins `height` with `validators`, replaying buffered messages.
    pub fn start_height(&mut self, height: u64, validators: ValidatorSet) -> Vec<ConsensusOutput> {
        let mut out = Vec::new();
        if self.halted.is_some() {
            return out;
        }
        self.height = height;
        self.validators = validators;
        self.step = Step::NewHeight;
        self.locked = None;
        self.valid = None;
        self.decided = false;
        self.proposals.clear();
        self.blocks.clear();
        self.validity.clear();
        self.prevotes.clear();
        self.precommits.clear();
        self.round_senders.clear();
        self.evidence_seen.clear();
        debug!(height, validators = self.validators.len(), "new height");

        self.start_round(0, &mut out);

        for msg in std::mem::take(&mut self.buffered) {
            let result = match msg {
                Buffered::Proposal(p) if p.height == height => self.handle_proposal(p),
                Buffered::Vote(v) if v.height == height => self.handle_vote(v),
                _ => continue,
            };
            match result {
                Ok(actions) => out.extend(actions),
                Err(e) => debug!(height, error = %e, "buffered message rejected"),
            }
        }
        out
    }

    /// Jumps to `committed_height + 1` after catch-up. No-op if the engine is
    /// already past it.
    pub fn reset_to(
        &mut self,
        committed_height: u64,
        root: [u8; 32],
        validators: ValidatorSet,
    ) -> Vec<ConsensusOutput> {
        if committed_height < self.height {
            return Vec::new();
        }
        info!(
            height = committed_height + 1,
            root = %hex::encode(root),
            "consensus reset after catch-up"
        );
        self.start_height(committed_height + 1, validators)
    }

    fn start_round(&mut self, round: u32, out: &mut Vec<ConsensusOutput>) {
        self.round = round;
        self.step = Step::Propose;
        self.polka_handled = false;
        self.prevote_wait_scheduled = false;
        self.precommit_wait_scheduled = false;

        let proposer = self
            .validators
            .proposer(self.height, round)
            .map(|v| v.address.clone());
        trace!(height = self.height, round, ?proposer, "round started");

        if proposer.as_deref() == Some(self.address.as_str()) {
            let (block, pol_round) = match &self.valid {
                Some((r, block)) => (Ok(block.clone()), Some(*r)),
                None => (self.context.build_block(self.height, round), None),
            };
            match block {
                Ok(block) => {
                    let proposal = Proposal::new(&self.keypair, self.height, round, pol_round, block);
                    debug!(
                        height = self.height,
                        round,
                        proofs = proposal.block.proofs.len(),
                        "proposing block"
                    );
                    self.record_proposal(proposal.clone());
                    out.push(ConsensusOutput::BroadcastProposal(proposal));
                }
                Err(e) => warn!(height = self.height, round, error = %e, "could not build a block"),
            }
        }
        self.schedule(Step::Propose, out);
        self.evaluate(out);
    }

    fn schedule(&self, step: Step, out: &mut Vec<ConsensusOutput>) {
        out.push(ConsensusOutput::ScheduleTimeout {
            height: self.height,
            round: self.round,
            step,
            after: self.timeouts.step_timeout(step, self.avg_latency, self.round),
        });
    }

    // -- Inputs -------------------------------------------------------------

    pub fn handle_proposal(&mut self, proposal: Proposal) -> Result<Vec<ConsensusOutput>, ConsensusError> {
        let mut out = Vec::new();
        if !self.admit(proposal.height, || Buffered::Proposal(proposal.clone()))? {
            return Ok(out);
        }

        let expected = self
            .validators
            .proposer(proposal.height, proposal.round)
            .map(|v| v.address.clone())
            .unwrap_or_default();
        if proposal.proposer != expected {
            return Err(ConsensusError::WrongProposer {
                height: proposal.height,
                round: proposal.round,
                expected,
                got: proposal.proposer,
            });
        }
        if let Some(vr) = proposal.pol_round {
            if vr >= proposal.round {
                return Err(ConsensusError::MalformedProposal(format!(
                    "pol_round {vr} is not before round {}",
                    proposal.round
                )));
            }
        }
        if proposal.block.height() != proposal.height {
            return Err(ConsensusError::MalformedProposal(format!(
                "block height {} in proposal for {}",
                proposal.block.height(),
                proposal.height
            )));
        }
        if !proposal.verify() {
            return Err(ConsensusError::BadProposalSignature(proposal.proposer));
        }
        if let Some(existing) = self.proposals.get(&proposal.round) {
            if existing.block_hash() == proposal.block_hash() && existing.pol_round == proposal.pol_round {
                return Ok(out);
            }
            return Err(ConsensusError::ConflictingProposal {
                round: proposal.round,
                proposer: proposal.proposer,
            });
        }

        trace!(height = proposal.height, round = proposal.round, "proposal received");
        self.record_proposal(proposal);
        self.evaluate(&mut out);
        Ok(out)
    }

    pub fn handle_vote(&mut self, vote: Vote) -> Result<Vec<ConsensusOutput>, ConsensusError> {
        let mut out = Vec::new();
        if !self.admit(vote.height, || Buffered::Vote(vote.clone()))? {
            return Ok(out);
        }
        self.record_vote(vote, &mut out)?;
        self.evaluate(&mut out);
        Ok(out)
    }

    /// A timeout previously requested through
    /// [`ConsensusOutput::ScheduleTimeout`] fired. Stale timeouts are ignored.
    pub fn on_timeout(&mut self, height: u64, round: u32, step: Step) -> Vec<ConsensusOutput> {
        let mut out = Vec::new();
        if self.halted.is_some() || self.decided || height != self.height || round != self.round {
            return out;
        }
        match step {
            Step::Propose if self.step == Step::Propose => {
                debug!(height, round, "propose timeout, prevoting nil");
                self.cast(VoteStep::Prevote, None, &mut out);
                self.step = Step::Prevote;
            }
            Step::Prevote if self.step == Step::Prevote => {
                debug!(height, round, "prevote timeout, precommitting nil");
                self.cast(VoteStep::Precommit, None, &mut out);
                self.step = Step::Precommit;
            }
            Step::Precommit => {
                debug!(height, round, "precommit timeout, next round");
                self.start_round(round + 1, &mut out);
                return out;
            }
            _ => return out,
        }
        self.evaluate(&mut out);
        out
    }

    /// Decides whether a message for `height` is processed now. Next-height
    /// messages are buffered.
    fn admit(&mut self, height: u64, buffer: impl FnOnce() -> Buffered) -> Result<bool, ConsensusError> {
        if let Some(reason) = &self.halted {
            return Err(ConsensusError::Halted(reason.clone()));
        }
        if height == self.height && !self.decided {
            return Ok(true);
        }
        if height <= self.height {
            trace!(height, current = self.height, "ignoring message for a finished height");
            return Ok(false);
        }
        if height == self.height + 1 {
            if self.buffered.len() >= self.config.max_buffered {
                return Err(ConsensusError::BufferFull(self.buffered.len()));
            }
            self.buffered.push(buffer());
            return Ok(false);
        }
        Err(ConsensusError::FutureHeight {
            current: self.height,
            got: height,
        })
    }

    fn record_proposal(&mut self, proposal: Proposal) {
        let hash = proposal.block_hash();
        self.blocks.entry(hash).or_insert_with(|| proposal.block.clone());
        self.round_senders
            .entry(proposal.round)
            .or_default()
            .insert(proposal.proposer.clone());
        self.proposals.insert(proposal.round, proposal);
    }

    fn record_vote(&mut self, vote: Vote, out: &mut Vec<ConsensusOutput>) -> Result<(), ConsensusError> {
        let (round, validator) = (vote.round, vote.validator.clone());
        let sets = match vote.step {
            VoteStep::Prevote => &mut self.prevotes,
            VoteStep::Precommit => &mut self.precommits,
        };
        let height = self.height;
        let set = sets
            .entry(round)
            .or_insert_with(|| VoteSet::new(height, round, vote.step));
        match set.add_vote(vote, &self.validators)? {
            AddVoteOutcome::Added => {
                self.round_senders.entry(round).or_default().insert(validator);
            }
            AddVoteOutcome::Duplicate => {}
            AddVoteOutcome::Equivocation(evidence) => {
                if self.evidence_seen.insert(evidence.id()) {
                    warn!(
                        validator = %evidence.validator(),
                        height = evidence.height(),
                        round,
                        "equivocation detected"
                    );
                    out.push(ConsensusOutput::Evidence(evidence));
                }
            }
        }
        Ok(())
    }

    /// Signs, records, and broadcasts our own vote. Non-validators only
    /// advance their step.
    fn cast(&mut self, step: VoteStep, block_hash: Option<[u8; 32]>, out: &mut Vec<ConsensusOutput>) {
        if self.halted.is_some() || !self.validators.contains(&self.address) {
            return;
        }
        let vote = Vote::new(&self.keypair, self.height, self.round, step, block_hash);
        if let Err(e) = self.record_vote(vote.clone(), out) {
            error!(error = %e, "own vote rejected");
            return;
        }
        out.push(ConsensusOutput::BroadcastVote(vote));
    }

    fn is_valid(&mut self, block: &Block) -> bool {
        let hash = block.hash();
        if let Some(valid) = self.validity.get(&hash) {
            return *valid;
        }
        let valid = if block.height() != self.height {
            false
        } else if !self.validators.contains(&block.header.proposer) {
            debug!(proposer = %block.header.proposer, "block built by a non-validator");
            false
        } else {
            match self.context.validate_block(block) {
                Ok(()) => true,
                Err(e) => {
                    warn!(height = self.height, error = %e, "invalid block proposed");
                    false
                }
            }
        };
        self.validity.insert(hash, valid);
        valid
    }

    // -- Rules --------------------------------------------------------------

    /// Applies every rule whose preconditions now hold, until none does.
    fn evaluate(&mut self, out: &mut Vec<ConsensusOutput>) {
        loop {
            if self.halted.is_some() || self.decided {
                return;
            }
            if self.try_decide(out) {
                return;
            }
            if self.try_round_skip(out) {
                continue;
            }
            let before = (self.round, self.step, self.polka_handled);
            self.try_prevote_proposal(out);
            self.try_polka(out);
            self.try_nil_polka(out);
            self.try_schedule_waits(out);
            if before == (self.round, self.step, self.polka_handled) {
                return;
            }
        }
    }

    fn try_decide(&mut self, out: &mut Vec<ConsensusOutput>) -> bool {
        let decided = self.precommits.iter().find_map(|(round, set)| match set.quorum_value(&self.validators) {
            Some(Some(hash)) if self.blocks.contains_key(&hash) => Some((*round, hash)),
            _ => None,
        });
        let Some((round, hash)) = decided else {
            return false;
        };
        let Some(block) = self.blocks.get(&hash).cloned() else {
            return false;
        };
        let commit = self.precommits[&round].votes_for(Some(&hash));
        info!(
            height = self.height,
            round,
            hash = %hex::encode(hash),
            signers = commit.len(),
            "block decided"
        );
        self.decided = true;
        self.step = Step::Commit;
        out.push(ConsensusOutput::Commit(CommittedBlock {
            block,
            commit_round: round,
            commit,
        }));
        true
    }

    fn try_round_skip(&mut self, out: &mut Vec<ConsensusOutput>) -> bool {
        let target = self
            .round_senders
            .range(self.round + 1..)
            .rev()
            .find(|(_, senders)| {
                let power = senders.iter().map(|s| self.validators.power_of(s)).sum();
                self.validators.exceeds_one_third(power)
            })
            .map(|(round, _)| *round);
        match target {
            Some(round) => {
                debug!(height = self.height, from = self.round, to = round, "skipping to later round");
                self.start_round(round, out);
                true
            }
            None => false,
        }
    }

    fn try_prevote_proposal(&mut self, out: &mut Vec<ConsensusOutput>) {
        if self.step != Step::Propose {
            return;
        }
        let Some(proposal) = self.proposals.get(&self.round).cloned() else {
            return;
        };
        let hash = proposal.block_hash();
        let prevote = match proposal.pol_round {
            None => {
                let unlocked = match &self.locked {
                    None => true,
                    Some((_, locked)) => locked.hash() == hash,
                };
                self.is_valid(&proposal.block) && unlocked
            }
            Some(vr) => {
                let polka = self
                    .prevotes
                    .get(&vr)
                    .map(|set| self.validators.is_quorum(set.power_for(Some(&hash))))
                    .unwrap_or(false);
                if !polka {
                    return;
                }
                let unlocked = match &self.locked {
                    None => true,
                    Some((round, locked)) => *round <= vr || locked.hash() == hash,
                };
                self.is_valid(&proposal.block) && unlocked
            }
        };
        self.cast(VoteStep::Prevote, prevote.then_some(hash), out);
        self.step = Step::Prevote;
    }

    fn try_polka(&mut self, out: &mut Vec<ConsensusOutput>) {
        if self.polka_handled || self.step < Step::Prevote {
            return;
        }
        let Some(proposal) = self.proposals.get(&self.round).cloned() else {
            return;
        };
        let hash = proposal.block_hash();
        let polka = self
            .prevotes
            .get(&self.round)
            .map(|set| self.validators.is_quorum(set.power_for(Some(&hash))))
            .unwrap_or(false);
        if !polka || !self.is_valid(&proposal.block) {
            return;
        }
        self.polka_handled = true;
        if self.step == Step::Prevote {
            debug!(height = self.height, round = self.round, "polka, locking");
            self.locked = Some((self.round, proposal.block.clone()));
            self.cast(VoteStep::Precommit, Some(hash), out);
            self.step = Step::Precommit;
        }
        self.valid = Some((self.round, proposal.block));
    }

    fn try_nil_polka(&mut self, out: &mut Vec<ConsensusOutput>) {
        if self.step != Step::Prevote {
            return;
        }
        let nil = self
            .prevotes
            .get(&self.round)
            .and_then(|set| set.quorum_value(&self.validators))
            == Some(None);
        if nil {
            debug!(height = self.height, round = self.round, "nil polka");
            self.cast(VoteStep::Precommit, None, out);
            self.step = Step::Precommit;
        }
    }

    fn try_schedule_waits(&mut self, out: &mut Vec<ConsensusOutput>) {
        if !self.prevote_wait_scheduled && self.step == Step::Prevote {
            let any = self
                .prevotes
                .get(&self.round)
                .map(|set| set.has_any_quorum(&self.validators))
                .unwrap_or(false);
            if any {
                self.prevote_wait_scheduled = true;
                self.schedule(Step::Prevote, out);
            }
        }
        if !self.precommit_wait_scheduled {
            let any = self
                .precommits
                .get(&self.round)
                .map(|set| set.has_any_quorum(&self.validators))
                .unwrap_or(false);
            if any {
                self.precommit_wait_scheduled = true;
                self.schedule(Step::Precommit, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
