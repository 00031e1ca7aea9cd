//! # Storage Module
//!
//! The committed half of the node: blocks, accounts, and the stake table,
//! persisted so a restarted node resumes where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! block.rs    — Block, BlockHeader, CommittedBlock; hash and integrity checks
//! state.rs    — StateStore: execution, Merkle state root, idempotent apply
//! db.rs       — ChainDb: sled trees and the atomic commit transaction
//! snapshot.rs — chunked state snapshots for fast catch-up
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! consensus commit ─► StateStore::apply ─► ChainDb::commit_block
//!                          │                   (blocks + state + proofs)
//!                          └─► StakeManager::replace_table
//! ```
//!
//! ## Design Decisions
//!
//! 1. **BLAKE3 for everything.** Block hashes, proof roots, and the state
//!    root all use BLAKE3 with domain separation.
//!
//! 2. **Bincode on disk.** Compact and deterministic. JSON is for the HTTP
//!    surface only.
//!
//! 3. **Proofs travel with blocks.** Validators never need a proof in their
//!    own mempool to check or apply a block.

pub mod block;
pub mod db;
pub mod snapshot;
pub mod state;

pub use block::{Block, BlockBody, BlockHeader, CommittedBlock};
pub use db::ChainDb;
pub use snapshot::{Snapshot, SnapshotManifest};
pub use state::{Account, ApplyOutcome, Genesis, StateError, StateStore};
