//! # Hashing Utilities
//!
//! BLAKE3 everywhere. Proof ids, block hashes, vote signing payloads, gossip
//! dedup keys, and the state Merkle tree are all BLAKE3 digests.
//!
//! Where two structures could conceivably hash the same bytes (a proof id and
//! a block hash, say) we use [`domain_separated_hash`] so the outputs can
//! never collide across contexts.

/// Compute the BLAKE3 hash of the input data.
///
/// # Example
///
/// ```
/// use pop_protocol::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"proof of proof");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Compute a domain-separated hash using BLAKE3's `derive_key` mode.
///
/// `domain_separated_hash("pop/proof-id", data)` and
/// `domain_separated_hash("pop/block", data)` never collide even if `data`
/// is identical, because the context selects a different internal IV.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash multiple byte slices together without concatenating them first.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Compute a Merkle root from a list of leaf hashes using BLAKE3.
///
/// A plain binary tree. If a level has an odd number of nodes the last one is
/// paired with itself; a single leaf is hashed with itself so the root is
/// always the output of a hash. Uniqueness of leaves is enforced by callers
/// (proof ids are deduplicated, account ids are map keys), which closes the
/// duplicate-leaf ambiguity.
///
/// Returns all zeros for an empty input (the "empty tree" sentinel).
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut current_level: Vec<[u8; 32]> = leaves.to_vec();

    if current_level.len() == 1 {
        return blake3_hash_multi(&[current_level[0].as_slice(), current_level[0].as_slice()]);
    }

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity((current_level.len() + 1) / 2);

        for chunk in current_level.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next_level.push(blake3_hash_multi(&[left.as_slice(), right.as_slice()]));
        }

        current_level = next_level;
    }

    current_level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_deterministic() {
        let a = blake3_hash(b"pop");
        let b = blake3_hash(b"pop");
        assert_eq!(a, b);
        assert_ne!(a, blake3_hash(b"Pop"));
    }

    #[test]
    fn domain_separation() {
        let data = b"same data";
        assert_ne!(
            domain_separated_hash("context-a", data),
            domain_separated_hash("context-b", data)
        );
        assert_ne!(domain_separated_hash("context-a", data), blake3_hash(data));
    }

    #[test]
    fn hash_multi_equals_concatenation() {
        let multi = blake3_hash_multi(&[b"hello", b" world"]);
        assert_eq!(multi, blake3_hash(b"hello world"));
    }

    #[test]
    fn merkle_root_empty() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn merkle_root_single_leaf() {
        let leaf = blake3_hash(b"only child");
        let expected = blake3_hash_multi(&[leaf.as_slice(), leaf.as_slice()]);
        assert_eq!(merkle_root(&[leaf]), expected);
    }

    #[test]
    fn merkle_root_odd_leaf_is_duplicated() {
        let a = blake3_hash(b"a");
        let b = blake3_hash(b"b");
        let c = blake3_hash(b"c");
        let ab = blake3_hash_multi(&[a.as_slice(), b.as_slice()]);
        let cc = blake3_hash_multi(&[c.as_slice(), c.as_slice()]);
        let expected = blake3_hash_multi(&[ab.as_slice(), cc.as_slice()]);
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn merkle_root_order_matters() {
        let leaf1 = blake3_hash(b"first");
        let leaf2 = blake3_hash(b"second");
        assert_ne!(merkle_root(&[leaf1, leaf2]), merkle_root(&[leaf2, leaf1]));
    }
}
