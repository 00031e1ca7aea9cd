//! # Cryptographic Primitives
//!
//! Thin, type-safe wrappers around audited implementations:
//!
//! - **Ed25519** (ed25519-dalek) for every signature on the network.
//! - **BLAKE3** for ids, block hashes, and the state Merkle tree.
//!
//! Nothing here is clever, and that is the point.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, blake3_hash_multi, domain_separated_hash, merkle_root};
pub use keys::{verify_hex, Keypair, PublicKey, Signature};
