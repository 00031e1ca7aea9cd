//! # ChainDb — Persistent Storage Engine
//!
//! The on-disk half of the state store, built on sled. Everything a node
//! needs to resume after a restart lives here.
//!
//! ## Tree Layout
//!
//! | Tree     | Key                 | Value                      |
//! |----------|---------------------|----------------------------|
//! | `blocks` | `height` (8B BE)    | `bincode(CommittedBlock)`  |
//! | `state`  | `acct/<id>`         | `bincode(Account)`         |
//! | `state`  | `meta/height`       | `height` (8B BE)           |
//! | `state`  | `meta/root`         | 32-byte state root         |
//! | `state`  | `meta/stake`        | `bincode(StakeTable)`      |
//! | `state`  | `meta/base`         | lowest height with a block |
//! | `proofs` | proof id (32B)      | `height` (8B BE)           |
//!
//! Heights are big-endian so sled's lexicographic order is numeric order
//! and range scans over `blocks` come out sorted.
//!
//! ## Atomicity
//!
//! A block commit touches all three trees. They are written in one sled
//! multi-tree transaction: the block, every changed account, the applied
//! proof ids, the stake table, the new root, and the height marker land
//! together or not at all. A crash mid-commit leaves the previous height
//! intact.

use std::collections::BTreeMap;
use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};

use super::block::CommittedBlock;
use super::state::Account;
use crate::consensus::stake::StakeTable;
use crate::error::{Classify, FaultClass};
use crate::proof::ProofId;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

impl Classify for DbError {
    fn fault_class(&self) -> FaultClass {
        // The disk is the source of truth; if it misbehaves we can't vote.
        FaultClass::Consistency
    }
}

pub type DbResult<T> = Result<T, DbError>;

impl From<TransactionError<()>> for DbError {
    fn from(err: TransactionError<()>) -> Self {
        match err {
            TransactionError::Storage(e) => DbError::Sled(e),
            TransactionError::Abort(()) => DbError::Corrupt("transaction aborted".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

const ACCOUNT_PREFIX: &[u8] = b"acct/";
const META_HEIGHT: &[u8] = b"meta/height";
const META_ROOT: &[u8] = b"meta/root";
const META_STAKE: &[u8] = b"meta/stake";
const META_BASE: &[u8] = b"meta/base";

fn account_key(id: &str) -> Vec<u8> {
    let mut key = ACCOUNT_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn encode<T: serde::Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode_height(bytes: &[u8]) -> DbResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::Corrupt(format!("height has {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Everything written by one block commit, pre-serialized.
struct EncodedCommit {
    height_key: [u8; 8],
    block: Vec<u8>,
    accounts: Vec<(Vec<u8>, Vec<u8>)>,
    proofs: Vec<[u8; 32]>,
    stake: Vec<u8>,
    root: [u8; 32],
}

/// Account and metadata contents of a full state image (genesis or
/// snapshot restore).
pub struct StateImage<'a> {
    pub height: u64,
    pub root: [u8; 32],
    pub accounts: &'a BTreeMap<String, Account>,
    pub stake_table: &'a StakeTable,
    pub applied_proofs: &'a [(ProofId, u64)],
    pub tip: Option<&'a CommittedBlock>,
}

// ---------------------------------------------------------------------------
// ChainDb
// ---------------------------------------------------------------------------

/// Typed access to the `blocks`, `state`, and `proofs` trees.
///
/// sled is thread-safe, so `ChainDb` is cheap to clone and share.
#[derive(Debug, Clone)]
pub struct ChainDb {
    db: Db,
    blocks: Tree,
    state: Tree,
    proofs: Tree,
}

impl ChainDb {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database removed on drop. For tests and simulations.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let blocks = db.open_tree("blocks")?;
        let state = db.open_tree("state")?;
        let proofs = db.open_tree("proofs")?;
        Ok(Self {
            db,
            blocks,
            state,
            proofs,
        })
    }

    // -- Commit -------------------------------------------------------------

    /// Persists a committed block and its state effects atomically.
    ///
    /// `changed` holds only the accounts the block touched.
    pub fn commit_block(
        &self,
        block: &CommittedBlock,
        changed: &BTreeMap<String, Account>,
        stake_table: &StakeTable,
        root: [u8; 32],
    ) -> DbResult<()> {
        let encoded = EncodedCommit {
            height_key: block.height().to_be_bytes(),
            block: encode(block)?,
            accounts: changed
                .iter()
                .map(|(id, acct)| Ok((account_key(id), encode(acct)?)))
                .collect::<DbResult<_>>()?,
            proofs: block.block.proofs.iter().map(|p| p.id.0).collect(),
            stake: encode(stake_table)?,
            root,
        };

        (&self.blocks, &self.state, &self.proofs).transaction(|(blocks, state, proofs)| {
            blocks.insert(&encoded.height_key[..], encoded.block.as_slice())?;
            for (key, value) in &encoded.accounts {
                state.insert(key.as_slice(), value.as_slice())?;
            }
            for id in &encoded.proofs {
                proofs.insert(&id[..], &encoded.height_key[..])?;
            }
            state.insert(META_STAKE, encoded.stake.as_slice())?;
            state.insert(META_ROOT, &encoded.root[..])?;
            state.insert(META_HEIGHT, &encoded.height_key[..])?;
            Ok::<(), ConflictableTransactionError<()>>(())
        })?;
        Ok(())
    }

    /// Replaces the whole database contents with `image`. Used to write
    /// genesis and to install a snapshot. Blocks below the image height
    /// are dropped; the tip block, if given, is kept so the next height can
    /// reference its commit certificate.
    pub fn install_image(&self, image: &StateImage<'_>) -> DbResult<()> {
        let accounts: Vec<(Vec<u8>, Vec<u8>)> = image
            .accounts
            .iter()
            .map(|(id, acct)| Ok((account_key(id), encode(acct)?)))
            .collect::<DbResult<_>>()?;
        let stake = encode(image.stake_table)?;
        let tip = image.tip.map(encode).transpose()?;
        let height_key = image.height.to_be_bytes();

        self.blocks.clear()?;
        self.state.clear()?;
        self.proofs.clear()?;

        (&self.blocks, &self.state, &self.proofs).transaction(|(blocks, state, proofs)| {
            if let Some(tip) = &tip {
                blocks.insert(&height_key[..], tip.as_slice())?;
            }
            for (key, value) in &accounts {
                state.insert(key.as_slice(), value.as_slice())?;
            }
            for (id, height) in image.applied_proofs {
                proofs.insert(&id.0[..], &height.to_be_bytes()[..])?;
            }
            state.insert(META_STAKE, stake.as_slice())?;
            state.insert(META_ROOT, &image.root[..])?;
            state.insert(META_HEIGHT, &height_key[..])?;
            state.insert(META_BASE, &height_key[..])?;
            Ok::<(), ConflictableTransactionError<()>>(())
        })?;
        self.flush()
    }

    // -- Block operations ---------------------------------------------------

    pub fn get_block(&self, height: u64) -> DbResult<Option<CommittedBlock>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Blocks in `[start, end]`, ascending. Missing heights are skipped.
    pub fn get_block_range(&self, start: u64, end: u64) -> DbResult<Vec<CommittedBlock>> {
        if start > end {
            return Ok(Vec::new());
        }
        self.blocks
            .range(start.to_be_bytes()..=end.to_be_bytes())
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }

    // -- Account operations -------------------------------------------------

    pub fn get_account(&self, id: &str) -> DbResult<Option<Account>> {
        match self.state.get(account_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every persisted account, sorted by id.
    pub fn load_accounts(&self) -> DbResult<BTreeMap<String, Account>> {
        let mut out = BTreeMap::new();
        for entry in self.state.scan_prefix(ACCOUNT_PREFIX) {
            let (key, bytes) = entry?;
            let id = std::str::from_utf8(&key[ACCOUNT_PREFIX.len()..])
                .map_err(|e| DbError::Corrupt(format!("account key: {e}")))?;
            out.insert(id.to_string(), decode(&bytes)?);
        }
        Ok(out)
    }

    // -- Proof index --------------------------------------------------------

    /// Height at which `id` was committed, if ever.
    pub fn proof_height(&self, id: &ProofId) -> DbResult<Option<u64>> {
        match self.proofs.get(id.0)? {
            Some(bytes) => Ok(Some(decode_height(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains_proof(&self, id: &ProofId) -> DbResult<bool> {
        Ok(self.proofs.contains_key(id.0)?)
    }

    pub fn applied_proofs(&self) -> DbResult<Vec<(ProofId, u64)>> {
        self.proofs
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                let id: [u8; 32] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Corrupt("proof key length".into()))?;
                Ok((ProofId(id), decode_height(&value)?))
            })
            .collect()
    }

    // -- Metadata operations ------------------------------------------------

    /// Last committed height, or `None` for a fresh database.
    pub fn committed_height(&self) -> DbResult<Option<u64>> {
        match self.state.get(META_HEIGHT)? {
            Some(bytes) => Ok(Some(decode_height(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Height of the genesis or restored snapshot this database grew from.
    pub fn base_height(&self) -> DbResult<u64> {
        match self.state.get(META_BASE)? {
            Some(bytes) => decode_height(&bytes),
            None => Ok(0),
        }
    }

    pub fn root(&self) -> DbResult<Option<[u8; 32]>> {
        match self.state.get(META_ROOT)? {
            Some(bytes) => {
                let root: [u8; 32] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Corrupt("root length".into()))?;
                Ok(Some(root))
            }
            None => Ok(None),
        }
    }

    pub fn stake_table(&self) -> DbResult<Option<StakeTable>> {
        match self.state.get(META_STAKE)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- Utility operations -------------------------------------------------

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::stake::StakeConfig;
    use crate::crypto::Keypair;
    use crate::proof::{BalanceDelta, Proof, ProofPayload, Verdict};
    use crate::storage::block::{Block, BlockBody};

    // -- Helpers ------------------------------------------------------------

    fn committed(height: u64, proofs: Vec<Proof>) -> CommittedBlock {
        let kp = Keypair::from_seed(&[1; 32]);
        let block = Block::new(
            &kp,
            height,
            0,
            [height as u8; 32],
            [height as u8 + 1; 32],
            BlockBody {
                proofs,
                ..Default::default()
            },
            height * 1_000,
        );
        CommittedBlock {
            block,
            commit_round: 0,
            commit: vec![],
        }
    }

    fn proof(ts: u64) -> Proof {
        let kp = Keypair::from_seed(&[5; 32]);
        Proof::new(
            &kp,
            ProofPayload::Plaintext {
                entries: vec![BalanceDelta {
                    account: "alice".into(),
                    delta: 1,
                }],
            },
            Verdict::Proved,
            ts,
            vec![],
        )
    }

    fn table() -> StakeTable {
        StakeTable::genesis(StakeConfig::default(), &[("v".into(), 5_000)])
    }

    fn account(balance: u64) -> Account {
        Account {
            balance,
            ..Default::default()
        }
    }

    // -- Tests --------------------------------------------------------------

    #[test]
    fn fresh_database_is_empty() {
        let db = ChainDb::open_temporary().unwrap();
        assert_eq!(db.committed_height().unwrap(), None);
        assert_eq!(db.root().unwrap(), None);
        assert!(db.stake_table().unwrap().is_none());
        assert_eq!(db.base_height().unwrap(), 0);
    }

    #[test]
    fn commit_block_writes_all_trees() {
        let db = ChainDb::open_temporary().unwrap();
        let p = proof(1);
        let block = committed(1, vec![p.clone()]);
        let mut changed = BTreeMap::new();
        changed.insert("alice".to_string(), account(11));

        db.commit_block(&block, &changed, &table(), [7; 32]).unwrap();

        assert_eq!(db.committed_height().unwrap(), Some(1));
        assert_eq!(db.root().unwrap(), Some([7; 32]));
        assert_eq!(db.get_block(1).unwrap(), Some(block));
        assert_eq!(db.get_account("alice").unwrap(), Some(account(11)));
        assert_eq!(db.proof_height(&p.id).unwrap(), Some(1));
        assert!(db.contains_proof(&p.id).unwrap());
        assert_eq!(db.stake_table().unwrap(), Some(table()));
    }

    #[test]
    fn block_range_is_ordered_and_inclusive() {
        let db = ChainDb::open_temporary().unwrap();
        for h in 1..=5 {
            db.commit_block(&committed(h, vec![]), &BTreeMap::new(), &table(), [0; 32])
                .unwrap();
        }
        let heights: Vec<u64> = db
            .get_block_range(2, 4)
            .unwrap()
            .iter()
            .map(|b| b.height())
            .collect();
        assert_eq!(heights, vec![2, 3, 4]);
        assert!(db.get_block_range(4, 2).unwrap().is_empty());
        assert_eq!(db.block_count(), 5);
    }

    #[test]
    fn load_accounts_sorted_by_id() {
        let db = ChainDb::open_temporary().unwrap();
        let mut changed = BTreeMap::new();
        changed.insert("carol".to_string(), account(3));
        changed.insert("alice".to_string(), account(1));
        changed.insert("bob".to_string(), account(2));
        db.commit_block(&committed(1, vec![]), &changed, &table(), [0; 32])
            .unwrap();

        let ids: Vec<String> = db.load_accounts().unwrap().into_keys().collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn install_image_replaces_contents() {
        let db = ChainDb::open_temporary().unwrap();
        db.commit_block(&committed(1, vec![proof(1)]), &BTreeMap::new(), &table(), [1; 32])
            .unwrap();

        let mut accounts = BTreeMap::new();
        accounts.insert("zed".to_string(), account(99));
        let tip = committed(40, vec![]);
        let applied = vec![(ProofId([3; 32]), 12)];
        db.install_image(&StateImage {
            height: 40,
            root: [4; 32],
            accounts: &accounts,
            stake_table: &table(),
            applied_proofs: &applied,
            tip: Some(&tip),
        })
        .unwrap();

        assert_eq!(db.committed_height().unwrap(), Some(40));
        assert_eq!(db.base_height().unwrap(), 40);
        assert!(db.get_block(1).unwrap().is_none());
        assert_eq!(db.get_block(40).unwrap(), Some(tip));
        assert_eq!(db.load_accounts().unwrap(), accounts);
        assert_eq!(db.applied_proofs().unwrap(), applied);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let block = committed(1, vec![]);
        {
            let db = ChainDb::open(dir.path()).unwrap();
            let mut changed = BTreeMap::new();
            changed.insert("alice".to_string(), account(5));
            db.commit_block(&block, &changed, &table(), [9; 32]).unwrap();
            db.flush().unwrap();
        }
        let db = ChainDb::open(dir.path()).unwrap();
        assert_eq!(db.committed_height().unwrap(), Some(1));
        assert_eq!(db.root().unwrap(), Some([9; 32]));
        assert_eq!(db.get_block(1).unwrap(), Some(block));
        assert_eq!(db.get_account("alice").unwrap(), Some(account(5)));
    }
}
