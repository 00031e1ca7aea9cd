//! # Stake Manager
//!
//! Bonded stake, unbonding, capped voting power, slashing, and the epoch
//! validator snapshots that consensus votes with.
//!
//! ## Determinism
//!
//! Everything in [`StakeTable`] changes only while a committed block is being
//! applied: bond/unbond proofs, equivocation evidence, unbonding releases,
//! and epoch rotation all happen inside `StateStore::apply`. The table's
//! digest is a leaf of the state Merkle tree, so two nodes that agree on the
//! state root also agree on who may vote next epoch.
//!
//! ## Epochs
//!
//! ```text
//!   heights  1 ..= L   -> epoch 0  (genesis set)
//!   heights L+1 ..= 2L -> epoch 1  (snapshot taken after committing L)
//! ```
//!
//! A validator slashed mid-epoch keeps its seat until the epoch ends; it is
//! absent from the next snapshot because it is jailed. The jail always
//! covers the whole next epoch, whatever `jail_period` says.
//!
//! [`StakeManager`] wraps the table behind a lock and adds the pool of
//! locally observed evidence waiting to be included in a block.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::validator_set::{ValidatorInfo, ValidatorSet};
use crate::consensus::vote::{EquivocationEvidence, VoteError};
use crate::crypto::blake3_hash;
use crate::error::{Classify, FaultClass};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Staking parameters. Part of genesis: every validator must agree on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeConfig {
    pub epoch_length: u64,
    pub unbonding_period: u64,
    pub slash_fraction_pct: u64,
    pub jail_period: u64,
    pub max_power_pct: u64,
    pub min_stake: u64,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            epoch_length: crate::config::EPOCH_LENGTH,
            unbonding_period: crate::config::UNBONDING_PERIOD,
            slash_fraction_pct: crate::config::SLASH_FRACTION_PCT,
            jail_period: crate::config::JAIL_PERIOD,
            max_power_pct: crate::config::MAX_VOTING_POWER_PCT,
            min_stake: crate::config::MIN_VALIDATOR_STAKE,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub address: String,
    pub bonded: u64,
    /// Reputation: how many times this validator has been slashed.
    pub slash_count: u32,
    /// Excluded from validator sets while `height < jailed_until`.
    pub jailed_until: u64,
    /// Last height at which one of its precommits was counted.
    pub last_active: u64,
}

impl ValidatorRecord {
    fn new(address: String) -> Self {
        Self {
            address,
            bonded: 0,
            slash_count: 0,
            jailed_until: 0,
            last_active: 0,
        }
    }

    pub fn is_jailed(&self, height: u64) -> bool {
        height < self.jailed_until
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingEntry {
    pub validator: String,
    pub amount: u64,
    pub release_height: u64,
}

/// What a call to [`StakeTable::slash`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashOutcome {
    Slashed { validator: String, amount: u64 },
    AlreadySlashed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StakeError {
    #[error("amount must be non-zero")]
    ZeroAmount,

    #[error("unknown validator {0}")]
    UnknownValidator(String),

    #[error("validator {validator} has {bonded} bonded, cannot unbond {requested}")]
    InsufficientStake {
        validator: String,
        bonded: u64,
        requested: u64,
    },

    #[error("stake overflow for {0}")]
    Overflow(String),

    #[error(transparent)]
    InvalidEvidence(#[from] VoteError),
}

impl Classify for StakeError {
    fn fault_class(&self) -> FaultClass {
        FaultClass::ProtocolViolation
    }
}

// ---------------------------------------------------------------------------
// Stake Table
// ---------------------------------------------------------------------------

/// The complete staking state. Pure data; deterministic serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeTable {
    config: StakeConfig,
    validators: BTreeMap<String, ValidatorRecord>,
    unbonding: Vec<UnbondingEntry>,
    slashed: BTreeSet<[u8; 32]>,
    sets: BTreeMap<u64, ValidatorSet>,
}

impl StakeTable {
    /// Genesis table with the epoch-0 set already snapshotted.
    pub fn genesis(config: StakeConfig, validators: &[(String, u64)]) -> Self {
        let mut table = Self {
            config,
            validators: BTreeMap::new(),
            unbonding: Vec::new(),
            slashed: BTreeSet::new(),
            sets: BTreeMap::new(),
        };
        for (address, stake) in validators {
            let record = table
                .validators
                .entry(address.clone())
                .or_insert_with(|| ValidatorRecord::new(address.clone()));
            record.bonded = record.bonded.saturating_add(*stake);
        }
        let set = table.snapshot(0);
        table.sets.insert(0, set);
        table
    }

    pub fn config(&self) -> &StakeConfig {
        &self.config
    }

    pub fn record(&self, validator: &str) -> Option<&ValidatorRecord> {
        self.validators.get(validator)
    }

    pub fn records(&self) -> impl Iterator<Item = &ValidatorRecord> {
        self.validators.values()
    }

    pub fn unbonding(&self) -> &[UnbondingEntry] {
        &self.unbonding
    }

    /// Epoch containing `height`. Height 0 (genesis) belongs to epoch 0.
    pub fn epoch_of(&self, height: u64) -> u64 {
        height.saturating_sub(1) / self.config.epoch_length.max(1)
    }

    /// The frozen set voting at `height`, if that epoch is still retained.
    pub fn set_for_height(&self, height: u64) -> Option<&ValidatorSet> {
        self.sets.get(&self.epoch_of(height))
    }

    /// Digest committed into the state root.
    pub fn digest(&self) -> [u8; 32] {
        blake3_hash(&bincode::serialize(self).unwrap_or_default())
    }

    pub fn is_slashed(&self, evidence_id: &[u8; 32]) -> bool {
        self.slashed.contains(evidence_id)
    }

    // -- Bonding -------------------------------------------------------------

    pub fn stake(&mut self, validator: &str, amount: u64) -> Result<(), StakeError> {
        if amount == 0 {
            return Err(StakeError::ZeroAmount);
        }
        let record = self
            .validators
            .entry(validator.to_string())
            .or_insert_with(|| ValidatorRecord::new(validator.to_string()));
        record.bonded = record
            .bonded
            .checked_add(amount)
            .ok_or_else(|| StakeError::Overflow(validator.to_string()))?;
        Ok(())
    }

    /// Moves `amount` into the unbonding queue, releasable at
    /// `height + unbonding_period`. Unbonding stake is still slashable.
    pub fn unstake(&mut self, validator: &str, amount: u64, height: u64) -> Result<(), StakeError> {
        if amount == 0 {
            return Err(StakeError::ZeroAmount);
        }
        let record = self
            .validators
            .get_mut(validator)
            .ok_or_else(|| StakeError::UnknownValidator(validator.to_string()))?;
        if record.bonded < amount {
            return Err(StakeError::InsufficientStake {
                validator: validator.to_string(),
                bonded: record.bonded,
                requested: amount,
            });
        }
        record.bonded -= amount;
        self.unbonding.push(UnbondingEntry {
            validator: validator.to_string(),
            amount,
            release_height: height + self.config.unbonding_period,
        });
        Ok(())
    }

    /// Releases every unbonding entry due at or before `height`, returning
    /// `(validator, amount)` pairs to credit back to account balances.
    pub fn process_unbonding(&mut self, height: u64) -> Vec<(String, u64)> {
        let mut released = Vec::new();
        self.unbonding.retain(|entry| {
            if entry.release_height <= height {
                if entry.amount > 0 {
                    released.push((entry.validator.clone(), entry.amount));
                }
                false
            } else {
                true
            }
        });
        released
    }

    // -- Voting power --------------------------------------------------------

    fn eligible(&self, height: u64) -> impl Iterator<Item = &ValidatorRecord> {
        let min = self.config.min_stake;
        self.validators
            .values()
            .filter(move |r| r.bonded >= min && !r.is_jailed(height))
    }

    fn power_cap(&self, height: u64) -> u64 {
        let total: u128 = self.eligible(height).map(|r| r.bonded as u128).sum();
        let cap = total * self.config.max_power_pct as u128 / 100;
        (cap.min(u64::MAX as u128) as u64).max(1)
    }

    /// Voting power of `validator` as of `height`: its stake capped at
    /// `max_power_pct` of the eligible total. Zero if ineligible.
    pub fn voting_power(&self, validator: &str, height: u64) -> u64 {
        let Some(record) = self.validators.get(validator) else {
            return 0;
        };
        if record.bonded < self.config.min_stake || record.is_jailed(height) {
            return 0;
        }
        record.bonded.min(self.power_cap(height))
    }

    /// Builds the validator set that will vote for the epoch following
    /// `height`: active, non-jailed, stake at or above the minimum.
    pub fn snapshot(&self, height: u64) -> ValidatorSet {
        let cap = self.power_cap(height);
        let validators = self
            .eligible(height)
            .map(|r| ValidatorInfo {
                address: r.address.clone(),
                stake: r.bonded,
                power: r.bonded.min(cap),
            })
            .collect();
        ValidatorSet::new(self.epoch_of(height + 1), validators)
    }

    /// Called after applying `height`. At epoch boundaries, snapshots the
    /// next set and forgets sets older than the previous epoch.
    pub fn end_height(&mut self, height: u64) -> Option<&ValidatorSet> {
        if height == 0 || height % self.config.epoch_length.max(1) != 0 {
            return None;
        }
        let set = self.snapshot(height);
        let epoch = set.epoch();
        self.sets.insert(epoch, set);
        self.sets.retain(|e, _| *e + 1 >= epoch);
        self.sets.get(&epoch)
    }

    /// Records which validators' precommits were counted at `height`.
    pub fn mark_active(&mut self, validators: &[String], height: u64) {
        for v in validators {
            if let Some(record) = self.validators.get_mut(v) {
                record.last_active = record.last_active.max(height);
            }
        }
    }

    // -- Slashing ------------------------------------------------------------

    /// First height at which a validator slashed at `height` is free again.
    /// The next snapshot is taken at the first boundary `>= height`, so the
    /// release is pushed past the epoch that snapshot starts.
    fn jail_release(&self, height: u64) -> u64 {
        let len = self.config.epoch_length.max(1);
        let next_boundary = height.div_ceil(len).saturating_mul(len);
        height
            .saturating_add(self.config.jail_period)
            .max(next_boundary.saturating_add(len))
    }

    /// Verifies `evidence` and punishes the equivocator: `slash_fraction_pct`
    /// of bonded and unbonding stake is burned, the slash count increments,
    /// and the validator is jailed for `jail_period` heights from `height`,
    /// or through the end of the next epoch if that is later. Evidence
    /// already applied is ignored.
    pub fn slash(
        &mut self,
        evidence: &EquivocationEvidence,
        height: u64,
    ) -> Result<SlashOutcome, StakeError> {
        evidence.verify()?;
        let id = evidence.id();
        if self.slashed.contains(&id) {
            return Ok(SlashOutcome::AlreadySlashed);
        }
        let validator = evidence.validator().to_string();
        let pct = self.config.slash_fraction_pct.min(100);
        let jail_until = self.jail_release(height);

        let record = self
            .validators
            .get_mut(&validator)
            .ok_or_else(|| StakeError::UnknownValidator(validator.clone()))?;
        let mut burned = fraction(record.bonded, pct);
        record.bonded -= burned;
        record.slash_count += 1;
        record.jailed_until = record.jailed_until.max(jail_until);

        for entry in self.unbonding.iter_mut().filter(|e| e.validator == validator) {
            let cut = fraction(entry.amount, pct);
            entry.amount -= cut;
            burned += cut;
        }
        self.slashed.insert(id);

        debug!(
            validator = %validator,
            height,
            burned,
            jailed_until = jail_until,
            "slash computed"
        );
        Ok(SlashOutcome::Slashed {
            validator,
            amount: burned,
        })
    }
}

/// `pct` percent of `amount`, rounded down. `pct` is at most 100.
fn fraction(amount: u64, pct: u64) -> u64 {
    (amount as u128 * pct as u128 / 100) as u64
}

// ---------------------------------------------------------------------------
// Stake Manager
// ---------------------------------------------------------------------------

/// Shared owner of the live [`StakeTable`] plus the evidence pool.
pub struct StakeManager {
    table: RwLock<StakeTable>,
    pending: Mutex<Vec<EquivocationEvidence>>,
}

impl StakeManager {
    pub fn new(table: StakeTable) -> Self {
        let validators = table.validators.len();
        info!(validators, "stake manager initialized");
        Self {
            table: RwLock::new(table),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// A copy of the current table. The state store mutates copies and
    /// installs them with [`replace_table`](Self::replace_table) once the
    /// block is durable.
    pub fn table(&self) -> StakeTable {
        self.table.read().clone()
    }

    pub fn replace_table(&self, table: StakeTable) {
        *self.table.write() = table;
    }

    pub fn set_for_height(&self, height: u64) -> Option<ValidatorSet> {
        self.table.read().set_for_height(height).cloned()
    }

    pub fn voting_power(&self, validator: &str, height: u64) -> u64 {
        self.table.read().voting_power(validator, height)
    }

    pub fn record(&self, validator: &str) -> Option<ValidatorRecord> {
        self.table.read().record(validator).cloned()
    }

    pub fn is_slashed(&self, evidence: &EquivocationEvidence) -> bool {
        self.table.read().is_slashed(&evidence.id())
    }

    /// Adds locally observed or gossiped evidence to the pool. Returns
    /// `Ok(false)` if it was already pending or already applied.
    pub fn submit_evidence(&self, evidence: EquivocationEvidence) -> Result<bool, StakeError> {
        evidence.verify()?;
        {
            let table = self.table.read();
            if table.record(evidence.validator()).is_none() {
                return Err(StakeError::UnknownValidator(evidence.validator().to_string()));
            }
            if table.is_slashed(&evidence.id()) {
                return Ok(false);
            }
        }
        let mut pending = self.pending.lock();
        if pending.iter().any(|e| e.key() == evidence.key()) {
            return Ok(false);
        }
        info!(
            validator = %evidence.validator(),
            height = evidence.height(),
            "equivocation evidence queued"
        );
        pending.push(evidence);
        Ok(true)
    }

    /// Evidence to include in the next proposal: pending, not yet applied,
    /// one entry per slot.
    pub fn pending_evidence(&self, max: usize) -> Vec<EquivocationEvidence> {
        let slashed: HashSet<[u8; 32]> = {
            let table = self.table.read();
            self.pending
                .lock()
                .iter()
                .map(|e| e.id())
                .filter(|id| table.is_slashed(id))
                .collect()
        };
        self.pending
            .lock()
            .iter()
            .filter(|e| !slashed.contains(&e.id()))
            .take(max)
            .cloned()
            .collect()
    }

    /// Drops pending evidence that a committed block has applied.
    pub fn prune_pending(&self) {
        let table = self.table();
        self.pending.lock().retain(|e| !table.is_slashed(&e.id()));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
