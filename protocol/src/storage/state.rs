//! # State Store — Merkle-Committed Account State
//!
//! Maps account ids to [`Account`] records and owns the canonical
//! [`StakeTable`]. After every committed block the state root is recomputed
//! and written to disk together with the block.
//!
//! ## State Root
//!
//! ```text
//! leaf(id, acct) = BLAKE3(len(id) || id || bincode(acct))
//! stake_leaf     = H("pop 2026-01 stake leaf", stake_table.digest())
//! root           = merkle_root([leaf for accounts sorted by id] ++ [stake_leaf])
//! ```
//!
//! Folding the stake table in means two nodes that agree on the root also
//! agree on balances, bonded stake, jail status, and every future validator
//! set.
//!
//! ## Block Execution
//!
//! Applying block `h` runs, in order:
//!
//! 1. Proofs, in block order. Plaintext deltas adjust balances (a negative
//!    result fails the block), commitments are recorded, bond moves balance
//!    into stake, unbond queues stake for release.
//! 2. Equivocation evidence: each new piece slashes and jails its signer.
//! 3. Rewards for height `h-1`, split among the signers of `last_commit`.
//!    Block `h`'s own precommits don't exist until its header (and root) is
//!    fixed, so they are paid by block `h+1`.
//! 4. Unbonding entries due at `h` are credited back.
//! 5. Epoch rotation when `h` closes an epoch.
//!
//! The header's `state_root` is the root after all five. Proposers compute
//! it with [`StateStore::propose`]; validators check it with
//! [`StateStore::validate_block`] before prevoting.
//!
//! ## Apply
//!
//! [`StateStore::apply`] is the only mutator. Re-applying an applied height
//! with the same block is a no-op; a different block at an applied height,
//! a parent-root mismatch, or a state-root mismatch is a fatal consistency
//! error.

use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::block::{Block, BlockBody, BlockError, CommittedBlock};
use super::db::{ChainDb, DbError, StateImage};
use super::snapshot::{Snapshot, SnapshotError};
use crate::consensus::reward::{RewardConfig, RewardDistribution, RewardDistributor};
use crate::consensus::stake::{SlashOutcome, StakeConfig, StakeError, StakeManager, StakeTable};
use crate::consensus::vote::{verify_commit, EquivocationEvidence, Vote};
use crate::crypto::{blake3_hash_multi, domain_separated_hash, merkle_root, Keypair};
use crate::error::{Classify, FaultClass};
use crate::proof::{Proof, ProofId, ProofPayload};

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// The on-chain state of one account. Every field is consensus-critical.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    /// Latest confidential commitment recorded for this account.
    pub commitment: Option<Vec<u8>>,
    /// Number of applied proofs that touched this account.
    pub proofs_applied: u64,
}

/// Hash of one account leaf.
pub fn account_leaf(id: &str, account: &Account) -> [u8; 32] {
    let encoded = bincode::serialize(account).unwrap_or_default();
    blake3_hash_multi(&[&(id.len() as u32).to_le_bytes(), id.as_bytes(), &encoded])
}

/// State root over accounts (which must be sorted by id) plus the stake
/// table digest.
pub fn compute_state_root<'a, I>(accounts: I, stake_digest: &[u8; 32]) -> [u8; 32]
where
    I: IntoIterator<Item = (&'a str, &'a Account)>,
{
    let mut leaves: Vec<[u8; 32]> = accounts
        .into_iter()
        .map(|(id, acct)| account_leaf(id, acct))
        .collect();
    leaves.push(domain_separated_hash("pop 2026-01 stake leaf", stake_digest));
    merkle_root(&leaves)
}

// ---------------------------------------------------------------------------
// Genesis
// ---------------------------------------------------------------------------

/// Initial allocation and chain parameters. Every node must start from the
/// same genesis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    /// `(account id, balance)`. Duplicates are summed.
    pub accounts: Vec<(String, u64)>,
    /// `(validator public key hex, bonded stake)`.
    pub validators: Vec<(String, u64)>,
    #[serde(default)]
    pub stake: StakeConfig,
    #[serde(default)]
    pub rewards: RewardConfig,
}

impl Genesis {
    fn account_map(&self) -> BTreeMap<String, Account> {
        let mut map: BTreeMap<String, Account> = BTreeMap::new();
        for (id, balance) in &self.accounts {
            let acct = map.entry(id.clone()).or_default();
            acct.balance = acct.balance.saturating_add(*balance);
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Stake(#[from] StakeError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("expected block at height {expected}, got {got}")]
    HeightGap { expected: u64, got: u64 },

    #[error("height {height} already committed as {existing}, refusing {incoming}")]
    ConflictingBlock {
        height: u64,
        existing: String,
        incoming: String,
    },

    #[error("block {height} parent_root {got} does not match local root {expected}")]
    ParentRootMismatch {
        height: u64,
        expected: String,
        got: String,
    },

    #[error("block {height} state_root {expected} but execution produced {computed}")]
    StateRootMismatch {
        height: u64,
        expected: String,
        computed: String,
    },

    #[error("proof {id} rejected: {reason}")]
    InvalidProof { id: ProofId, reason: String },

    #[error("proof {0} already applied")]
    DuplicateProof(ProofId),

    #[error("proof {proof} depends on unapplied proof {dependency}")]
    UnmetDependency { proof: ProofId, dependency: ProofId },

    #[error("account {account} would go negative: balance {balance}, debit {debit}")]
    NegativeBalance {
        account: String,
        balance: u64,
        debit: u64,
    },

    #[error("balance overflow on account {0}")]
    BalanceOverflow(String),

    #[error("invalid last_commit: {0}")]
    InvalidLastCommit(String),

    #[error("no validator set retained for height {0}")]
    UnknownValidatorSet(u64),

    #[error("committed block {height} failed to execute: {reason}")]
    CommittedBlockRejected { height: u64, reason: String },

    #[error("snapshot at height {snapshot} is not ahead of local height {local}")]
    StaleSnapshot { snapshot: u64, local: u64 },

    #[error("corrupt state: {0}")]
    Corrupt(String),
}

impl Classify for StateError {
    fn fault_class(&self) -> FaultClass {
        match self {
            StateError::Db(e) => e.fault_class(),
            StateError::ConflictingBlock { .. }
            | StateError::ParentRootMismatch { .. }
            | StateError::StateRootMismatch { .. }
            | StateError::NegativeBalance { .. }
            | StateError::BalanceOverflow(_)
            | StateError::UnknownValidatorSet(_)
            | StateError::CommittedBlockRejected { .. }
            | StateError::Corrupt(_) => FaultClass::Consistency,
            StateError::Block(_)
            | StateError::Stake(_)
            | StateError::Snapshot(_)
            | StateError::HeightGap { .. }
            | StateError::InvalidProof { .. }
            | StateError::DuplicateProof(_)
            | StateError::UnmetDependency { .. }
            | StateError::InvalidLastCommit(_)
            | StateError::StaleSnapshot { .. } => FaultClass::ProtocolViolation,
        }
    }
}

pub type StateResult<T> = Result<T, StateError>;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One block's worth of changes layered over the committed accounts.
struct Execution<'a> {
    db: &'a ChainDb,
    base: &'a BTreeMap<String, Account>,
    changes: BTreeMap<String, Account>,
    table: StakeTable,
    applied: HashSet<ProofId>,
    height: u64,
}

struct Executed {
    root: [u8; 32],
    changes: BTreeMap<String, Account>,
    table: StakeTable,
    rewards: RewardDistribution,
    slashed: Vec<SlashOutcome>,
    rotated: Option<(u64, usize)>,
}

fn debit(account: &str, balance: u64, amount: u64) -> StateResult<u64> {
    balance
        .checked_sub(amount)
        .ok_or_else(|| StateError::NegativeBalance {
            account: account.to_string(),
            balance,
            debit: amount,
        })
}

fn apply_delta(account: &str, balance: u64, delta: i64) -> StateResult<u64> {
    if delta >= 0 {
        balance
            .checked_add(delta as u64)
            .ok_or_else(|| StateError::BalanceOverflow(account.to_string()))
    } else {
        debit(account, balance, delta.unsigned_abs())
    }
}

fn authorize(proof: &Proof, validator: &str) -> StateResult<()> {
    if proof.submitter != validator {
        return Err(StateError::InvalidProof {
            id: proof.id,
            reason: "stake changes must be submitted by the validator".into(),
        });
    }
    Ok(())
}

impl<'a> Execution<'a> {
    fn new(db: &'a ChainDb, base: &'a BTreeMap<String, Account>, table: StakeTable, height: u64) -> Self {
        Self {
            db,
            base,
            changes: BTreeMap::new(),
            table,
            applied: HashSet::new(),
            height,
        }
    }

    fn account(&self, id: &str) -> Account {
        self.changes
            .get(id)
            .or_else(|| self.base.get(id))
            .cloned()
            .unwrap_or_default()
    }

    fn is_applied(&self, id: &ProofId) -> StateResult<bool> {
        Ok(self.applied.contains(id) || self.db.contains_proof(id)?)
    }

    fn credit(&mut self, id: &str, amount: u64) -> StateResult<()> {
        let mut acct = self.account(id);
        acct.balance = acct
            .balance
            .checked_add(amount)
            .ok_or_else(|| StateError::BalanceOverflow(id.to_string()))?;
        self.changes.insert(id.to_string(), acct);
        Ok(())
    }

    /// Applies one proof all-or-nothing: on error nothing has changed.
    fn apply_proof(&mut self, proof: &Proof) -> StateResult<()> {
        proof.validate().map_err(|e| StateError::InvalidProof {
            id: proof.id,
            reason: e.to_string(),
        })?;
        if !proof.is_proved() {
            return Err(StateError::InvalidProof {
                id: proof.id,
                reason: "verdict is not Proved".into(),
            });
        }
        if self.is_applied(&proof.id)? {
            return Err(StateError::DuplicateProof(proof.id));
        }
        for dep in &proof.dependencies {
            if !self.is_applied(dep)? {
                return Err(StateError::UnmetDependency {
                    proof: proof.id,
                    dependency: *dep,
                });
            }
        }

        let mut staged: BTreeMap<String, Account> = BTreeMap::new();
        match &proof.payload {
            ProofPayload::Plaintext { entries } => {
                for entry in entries {
                    let acct = staged
                        .entry(entry.account.clone())
                        .or_insert_with(|| self.account(&entry.account));
                    acct.balance = apply_delta(&entry.account, acct.balance, entry.delta)?;
                }
            }
            ProofPayload::Commitment {
                account,
                commitment,
            } => {
                let mut acct = self.account(account);
                acct.commitment = Some(commitment.clone());
                staged.insert(account.clone(), acct);
            }
            ProofPayload::Bond { validator, amount } => {
                authorize(proof, validator)?;
                let mut acct = self.account(validator);
                acct.balance = debit(validator, acct.balance, *amount)?;
                self.table.stake(validator, *amount)?;
                staged.insert(validator.clone(), acct);
            }
            ProofPayload::Unbond { validator, amount } => {
                authorize(proof, validator)?;
                self.table.unstake(validator, *amount, self.height)?;
                staged.insert(validator.clone(), self.account(validator));
            }
        }

        for id in proof.payload.touched_accounts() {
            if let Some(acct) = staged.get_mut(id) {
                acct.proofs_applied += 1;
            }
        }
        self.changes.extend(staged);
        self.applied.insert(proof.id);
        Ok(())
    }

    fn root(&self) -> [u8; 32] {
        let mut merged: BTreeMap<&str, &Account> =
            self.base.iter().map(|(k, v)| (k.as_str(), v)).collect();
        for (k, v) in &self.changes {
            merged.insert(k.as_str(), v);
        }
        compute_state_root(merged, &self.table.digest())
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Result of [`StateStore::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        height: u64,
        root: [u8; 32],
        rewards: RewardDistribution,
        slashed: Vec<SlashOutcome>,
    },
    /// The height was already applied with this block. Nothing changed.
    AlreadyApplied,
}

struct StateInner {
    height: u64,
    root: [u8; 32],
    accounts: BTreeMap<String, Account>,
    table: StakeTable,
    /// Hash of the block at `height`; `None` at genesis.
    tip_hash: Option<[u8; 32]>,
    base_height: u64,
}

pub struct StateStore {
    db: ChainDb,
    inner: RwLock<StateInner>,
    stake: Arc<StakeManager>,
    rewards: RewardDistributor,
}

impl StateStore {
    /// Opens the store, writing `genesis` into an empty database or
    /// resuming from the last committed height.
    pub fn open(db: ChainDb, genesis: &Genesis) -> StateResult<Self> {
        let inner = match db.committed_height()? {
            Some(height) => {
                let accounts = db.load_accounts()?;
                let table = db
                    .stake_table()?
                    .ok_or_else(|| StateError::Corrupt("missing stake table".into()))?;
                let root = db
                    .root()?
                    .ok_or_else(|| StateError::Corrupt("missing state root".into()))?;
                let computed = compute_state_root(
                    accounts.iter().map(|(k, v)| (k.as_str(), v)),
                    &table.digest(),
                );
                if computed != root {
                    error!(height, "persisted state does not match its root");
                    return Err(StateError::Corrupt(format!(
                        "root {} recomputes to {}",
                        hex::encode(root),
                        hex::encode(computed)
                    )));
                }
                let tip_hash = db.get_block(height)?.map(|b| b.hash());
                let base_height = db.base_height()?;
                info!(height, root = %hex::encode(root), "state restored from disk");
                StateInner {
                    height,
                    root,
                    accounts,
                    table,
                    tip_hash,
                    base_height,
                }
            }
            None => {
                let accounts = genesis.account_map();
                let table = StakeTable::genesis(genesis.stake.clone(), &genesis.validators);
                let root = compute_state_root(
                    accounts.iter().map(|(k, v)| (k.as_str(), v)),
                    &table.digest(),
                );
                db.install_image(&StateImage {
                    height: 0,
                    root,
                    accounts: &accounts,
                    stake_table: &table,
                    applied_proofs: &[],
                    tip: None,
                })?;
                info!(
                    accounts = accounts.len(),
                    validators = genesis.validators.len(),
                    root = %hex::encode(root),
                    "genesis state written"
                );
                StateInner {
                    height: 0,
                    root,
                    accounts,
                    table,
                    tip_hash: None,
                    base_height: 0,
                }
            }
        };

        let stake = Arc::new(StakeManager::new(inner.table.clone()));
        Ok(Self {
            db,
            inner: RwLock::new(inner),
            stake,
            rewards: RewardDistributor::new(genesis.rewards.clone()),
        })
    }

    /// The stake manager fed by this store. Its table is replaced after
    /// every apply.
    pub fn stake_manager(&self) -> Arc<StakeManager> {
        Arc::clone(&self.stake)
    }

    fn execute(
        &self,
        inner: &StateInner,
        height: u64,
        proofs: &[Proof],
        last_commit: &[Vote],
        evidence: &[EquivocationEvidence],
    ) -> StateResult<Executed> {
        let mut exec = Execution::new(&self.db, &inner.accounts, inner.table.clone(), height);

        for proof in proofs {
            exec.apply_proof(proof)?;
        }

        let mut slashed = Vec::with_capacity(evidence.len());
        for ev in evidence {
            slashed.push(exec.table.slash(ev, height)?);
        }

        let mut rewards = RewardDistribution {
            height,
            payouts: Vec::new(),
        };
        if height > 1 {
            let prev = height - 1;
            let prev_hash = inner
                .tip_hash
                .ok_or_else(|| StateError::InvalidLastCommit("no block at previous height".into()))?;
            let set = exec
                .table
                .set_for_height(prev)
                .cloned()
                .ok_or(StateError::UnknownValidatorSet(prev))?;
            let round = last_commit.first().map(|v| v.round).unwrap_or_default();
            verify_commit(last_commit, prev, round, &prev_hash, &set)
                .map_err(|e| StateError::InvalidLastCommit(e.to_string()))?;

            let mut signers: Vec<String> = last_commit.iter().map(|v| v.validator.clone()).collect();
            signers.sort();
            signers.dedup();
            rewards = self.rewards.distribute(height, &signers, &set);
            for (validator, amount) in &rewards.payouts {
                exec.credit(validator, *amount)?;
            }
            exec.table.mark_active(&signers, prev);
        } else if !last_commit.is_empty() {
            return Err(StateError::InvalidLastCommit(
                "first block cannot carry a commit".into(),
            ));
        }

        for (validator, amount) in exec.table.process_unbonding(height) {
            exec.credit(&validator, amount)?;
        }

        let rotated = exec.table.end_height(height).map(|set| (set.epoch(), set.len()));

        Ok(Executed {
            root: exec.root(),
            changes: exec.changes,
            table: exec.table,
            rewards,
            slashed,
            rotated,
        })
    }

    // -- Proposing and validating ------------------------------------------

    /// Builds and signs the next block from `candidates`. Proofs that can't
    /// apply on top of the current state (and those after them that depend
    /// on them) are skipped, as is evidence that is invalid or already
    /// applied. The header carries the resulting root.
    pub fn propose(
        &self,
        keypair: &Keypair,
        round: u32,
        candidates: Vec<Proof>,
        evidence: Vec<EquivocationEvidence>,
        timestamp: u64,
    ) -> StateResult<Block> {
        let inner = self.inner.read();
        let height = inner.height + 1;

        let last_commit = if height > 1 {
            self.db
                .get_block(inner.height)?
                .map(|b| b.commit)
                .ok_or_else(|| StateError::Corrupt(format!("missing block {}", inner.height)))?
        } else {
            Vec::new()
        };

        let mut probe = inner.table.clone();
        let evidence: Vec<EquivocationEvidence> = evidence
            .into_iter()
            .filter(|ev| matches!(probe.slash(ev, height), Ok(SlashOutcome::Slashed { .. })))
            .collect();

        let mut exec = Execution::new(&self.db, &inner.accounts, inner.table.clone(), height);
        let mut proofs = Vec::with_capacity(candidates.len());
        for proof in candidates {
            match exec.apply_proof(&proof) {
                Ok(()) => proofs.push(proof),
                Err(e) => debug!(proof = %proof.id, error = %e, "skipping inapplicable proof"),
            }
        }

        let executed = self.execute(&inner, height, &proofs, &last_commit, &evidence)?;
        Ok(Block::new(
            keypair,
            height,
            round,
            inner.root,
            executed.root,
            BlockBody {
                proofs,
                last_commit,
                evidence,
            },
            timestamp,
        ))
    }

    /// Dry-runs `block` on top of the current state and returns the root
    /// it would produce. Nothing is written.
    pub fn preview(&self, block: &Block) -> StateResult<[u8; 32]> {
        let inner = self.inner.read();
        let height = block.height();
        if height != inner.height + 1 {
            return Err(StateError::HeightGap {
                expected: inner.height + 1,
                got: height,
            });
        }
        block.verify_integrity()?;
        if block.header.parent_root != inner.root {
            return Err(StateError::ParentRootMismatch {
                height,
                expected: hex::encode(inner.root),
                got: hex::encode(block.header.parent_root),
            });
        }
        let executed =
            self.execute(&inner, height, &block.proofs, &block.last_commit, &block.evidence)?;
        Ok(executed.root)
    }

    /// Full validation of a proposed block against local state.
    pub fn validate_block(&self, block: &Block) -> StateResult<()> {
        let computed = self.preview(block)?;
        if computed != block.header.state_root {
            return Err(StateError::StateRootMismatch {
                height: block.height(),
                expected: hex::encode(block.header.state_root),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }

    // -- Apply --------------------------------------------------------------

    /// Applies a finalized block. See the module docs for the failure
    /// semantics.
    pub fn apply(&self, committed: &CommittedBlock) -> StateResult<ApplyOutcome> {
        let height = committed.height();
        let (outcome, table) = {
            let mut inner = self.inner.write();

            if height <= inner.height {
                let existing = if height == inner.height {
                    inner.tip_hash
                } else {
                    self.db.get_block(height)?.map(|b| b.hash())
                };
                return match existing {
                    Some(hash) if hash != committed.hash() => {
                        error!(
                            height,
                            existing = %hex::encode(hash),
                            incoming = %committed.block.header.hash_hex(),
                            "conflicting block for committed height"
                        );
                        Err(StateError::ConflictingBlock {
                            height,
                            existing: hex::encode(hash),
                            incoming: committed.block.header.hash_hex(),
                        })
                    }
                    _ => {
                        debug!(height, "block already applied");
                        Ok(ApplyOutcome::AlreadyApplied)
                    }
                };
            }
            if height != inner.height + 1 {
                return Err(StateError::HeightGap {
                    expected: inner.height + 1,
                    got: height,
                });
            }

            let set = inner
                .table
                .set_for_height(height)
                .cloned()
                .ok_or(StateError::UnknownValidatorSet(height))?;
            committed.verify(&set)?;

            let header = &committed.block.header;
            if header.parent_root != inner.root {
                error!(height, "parent root mismatch on committed block");
                return Err(StateError::ParentRootMismatch {
                    height,
                    expected: hex::encode(inner.root),
                    got: hex::encode(header.parent_root),
                });
            }

            let block = &committed.block;
            let executed = self
                .execute(&inner, height, &block.proofs, &block.last_commit, &block.evidence)
                .map_err(|e| {
                    error!(height, error = %e, "committed block failed to execute");
                    StateError::CommittedBlockRejected {
                        height,
                        reason: e.to_string(),
                    }
                })?;
            if executed.root != header.state_root {
                error!(
                    height,
                    expected = %hex::encode(header.state_root),
                    computed = %hex::encode(executed.root),
                    "state root mismatch on committed block"
                );
                return Err(StateError::StateRootMismatch {
                    height,
                    expected: hex::encode(header.state_root),
                    computed: hex::encode(executed.root),
                });
            }

            self.db
                .commit_block(committed, &executed.changes, &executed.table, executed.root)?;

            for (id, acct) in &executed.changes {
                inner.accounts.insert(id.clone(), acct.clone());
            }
            inner.height = height;
            inner.root = executed.root;
            inner.table = executed.table.clone();
            inner.tip_hash = Some(committed.hash());

            info!(
                height,
                round = committed.commit_round,
                proofs = block.proofs.len(),
                root = %hex::encode(executed.root),
                "block applied"
            );
            for outcome in &executed.slashed {
                if let SlashOutcome::Slashed { validator, amount } = outcome {
                    warn!(validator = %validator, height, burned = amount, "validator slashed for equivocation");
                }
            }
            if let Some((epoch, validators)) = executed.rotated {
                info!(epoch, validators, "validator set rotated");
            }

            (
                ApplyOutcome::Applied {
                    height,
                    root: executed.root,
                    rewards: executed.rewards,
                    slashed: executed.slashed,
                },
                executed.table,
            )
        };
        self.stake.replace_table(table);
        Ok(outcome)
    }

    // -- Reads --------------------------------------------------------------

    pub fn root_hash(&self) -> [u8; 32] {
        self.inner.read().root
    }

    pub fn committed_height(&self) -> u64 {
        self.inner.read().height
    }

    /// Lowest height whose block this store holds (genesis or snapshot).
    pub fn base_height(&self) -> u64 {
        self.inner.read().base_height
    }

    pub fn tip_hash(&self) -> Option<[u8; 32]> {
        self.inner.read().tip_hash
    }

    pub fn get_account(&self, id: &str) -> Option<Account> {
        self.inner.read().accounts.get(id).cloned()
    }

    pub fn account_count(&self) -> usize {
        self.inner.read().accounts.len()
    }

    pub fn is_applied(&self, id: &ProofId) -> StateResult<bool> {
        Ok(self.db.contains_proof(id)?)
    }

    pub fn committed_block(&self, height: u64) -> StateResult<Option<CommittedBlock>> {
        Ok(self.db.get_block(height)?)
    }

    /// Committed blocks in `range`, ascending.
    pub fn history(&self, range: RangeInclusive<u64>) -> StateResult<Vec<CommittedBlock>> {
        Ok(self.db.get_block_range(*range.start(), *range.end())?)
    }

    // -- Snapshots ----------------------------------------------------------

    pub fn snapshot(&self) -> StateResult<Snapshot> {
        let inner = self.inner.read();
        let tip = if inner.height == 0 {
            None
        } else {
            self.db.get_block(inner.height)?
        };
        Ok(Snapshot {
            height: inner.height,
            root: inner.root,
            accounts: inner
                .accounts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            stake_table: inner.table.clone(),
            applied_proofs: self.db.applied_proofs()?,
            tip,
        })
    }

    /// Replaces local state with a verified snapshot strictly ahead of it.
    /// The snapshot's tip must be signed by more than a third of the power
    /// of the set this store would vote with next.
    pub fn restore(&self, snapshot: &Snapshot) -> StateResult<()> {
        snapshot.verify()?;
        let table = {
            let mut inner = self.inner.write();
            if snapshot.height <= inner.height {
                return Err(StateError::StaleSnapshot {
                    snapshot: snapshot.height,
                    local: inner.height,
                });
            }
            let next = inner.height + 1;
            let trusted = inner
                .table
                .set_for_height(next)
                .ok_or(StateError::UnknownValidatorSet(next))?;
            if let Err(e) = snapshot.verify_trusted(trusted) {
                warn!(height = snapshot.height, error = %e, "refusing unanchored snapshot");
                return Err(e.into());
            }
            let accounts: BTreeMap<String, Account> = snapshot.accounts.iter().cloned().collect();
            self.db.install_image(&StateImage {
                height: snapshot.height,
                root: snapshot.root,
                accounts: &accounts,
                stake_table: &snapshot.stake_table,
                applied_proofs: &snapshot.applied_proofs,
                tip: snapshot.tip.as_ref(),
            })?;
            *inner = StateInner {
                height: snapshot.height,
                root: snapshot.root,
                accounts,
                table: snapshot.stake_table.clone(),
                tip_hash: snapshot.tip.as_ref().map(|t| t.hash()),
                base_height: snapshot.height,
            };
            info!(
                height = snapshot.height,
                root = %hex::encode(snapshot.root),
                "state restored from snapshot"
            );
            snapshot.stake_table.clone()
        };
        self.stake.replace_table(table);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
