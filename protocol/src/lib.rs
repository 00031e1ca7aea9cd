// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Proof-of-Proof Ledger — Core Library
//!
//! A BFT ledger whose unit of work is the *proof*: a financial state
//! transition that an external prover has already verified. Validators do
//! not re-execute anything clever. They gossip proofs, agree on an ordering
//! with a Tendermint-style round protocol weighted by bonded stake, apply the
//! agreed block to a Merkle-committed account state, and pay the signers.
//!
//! ## Architecture
//!
//! - **crypto** — Ed25519 keys, BLAKE3 hashing, Merkle roots.
//! - **proof** — the proof type, its content-addressed id, verification.
//! - **mempool** — priority-ordered pool of proofs awaiting inclusion.
//! - **consensus** — validator sets, votes, staking, rewards, the round engine.
//! - **storage** — blocks, the sled-backed state store, snapshots.
//! - **network** — signed wire envelope, transports, gossip, latency monitor,
//!   P2P/HTTP sync mode switch.
//! - **sync** — catch-up by block replay or snapshot transfer.
//! - **node** — the tasks that tie it all together.
//! - **error** — the fault taxonomy every module error maps into.
//! - **config** — protocol constants and defaults.
//!
//! ## Invariants worth knowing
//!
//! 1. Two honest nodes never commit different blocks at the same height.
//! 2. Applying a committed block twice is a no-op.
//! 3. The state root after height `h` is a pure function of the blocks up
//!    to `h`, so replay and snapshot restore end at the same root.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod mempool;
pub mod network;
pub mod node;
pub mod proof;
pub mod storage;
pub mod sync;

pub use error::{Classify, FaultClass};
pub use node::{Node, NodeConfig, NodeError, NodeHandle, NodeStatus};
