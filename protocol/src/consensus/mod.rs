//! # Consensus
//!
//! Byzantine agreement on blocks of proofs, weighted by bonded stake.
//!
//! ```text
//! validator_set.rs — epoch validator set, quorum math, proposer selection
//! vote.rs          — Vote, VoteSet tallies, EquivocationEvidence
//! stake.rs         — StakeTable / StakeManager: bonding, slashing, epochs
//! timeout.rs       — latency-adaptive round timeouts
//! reward.rs        — pro-rata block rewards for precommit signers
//! engine.rs        — the Tendermint-style round state machine
//! ```
//!
//! The engine only decides. Executing a decided block (proofs, slashes,
//! rewards, epoch rotation) happens in `storage::StateStore::apply`, so a
//! node replaying blocks during sync takes exactly the same path.

pub mod engine;
pub mod reward;
pub mod stake;
pub mod timeout;
pub mod validator_set;
pub mod vote;

pub use engine::{
    ConsensusConfig, ConsensusContext, ConsensusEngine, ConsensusError, ConsensusOutput, EngineStatus, Proposal, Step,
};
pub use reward::{RewardConfig, RewardDistribution, RewardDistributor};
pub use stake::{SlashOutcome, StakeConfig, StakeError, StakeManager, StakeTable, ValidatorRecord};
pub use timeout::{TimeoutConfig, TimeoutPolicy};
pub use validator_set::{ValidatorInfo, ValidatorSet};
pub use vote::{verify_commit, AddVoteOutcome, EquivocationEvidence, Vote, VoteError, VoteSet, VoteStep};
