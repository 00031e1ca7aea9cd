//! # Validator Sets
//!
//! A `ValidatorSet` is the frozen view of who may vote during one epoch and
//! with how much weight. It is built by the stake manager at an epoch
//! boundary and then used unchanged for every height of that epoch, so
//! every honest node computes the same quorum and the same proposer.
//!
//! ## Proposer selection
//!
//! Stake-weighted and deterministic:
//!
//! ```text
//!   seed   = BLAKE3("pop proposer" || height || round) as u64
//!   target = seed mod total_power
//!
//!   sorted by address:  [ A: 0..30 | B: 30..55 | C: 55..80 | D: 80..100 ]
//!                                        ^ target = 42 -> B
//! ```
//!
//! Every validator gets picked in proportion to its power, and nobody can
//! grind the outcome because the seed depends on nothing a validator controls.

use serde::{Deserialize, Serialize};

use crate::crypto::domain_separated_hash;

/// One validator's entry in an epoch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Hex-encoded public key.
    pub address: String,
    /// Bonded stake at snapshot time.
    pub stake: u64,
    /// Voting power (stake after the per-validator cap).
    pub power: u64,
}

/// The validator set for one epoch, sorted by address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    epoch: u64,
    validators: Vec<ValidatorInfo>,
    total_power: u64,
}

impl ValidatorSet {
    /// Builds a set from arbitrary input. Entries with zero power are
    /// dropped, the rest are sorted by address.
    pub fn new(epoch: u64, validators: Vec<ValidatorInfo>) -> Self {
        let mut validators: Vec<ValidatorInfo> =
            validators.into_iter().filter(|v| v.power > 0).collect();
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        validators.dedup_by(|a, b| a.address == b.address);
        let total_power = validators.iter().map(|v| v.power).sum();
        Self {
            epoch,
            validators,
            total_power,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[ValidatorInfo] {
        &self.validators
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn get(&self, address: &str) -> Option<&ValidatorInfo> {
        self.validators
            .binary_search_by(|v| v.address.as_str().cmp(address))
            .ok()
            .map(|i| &self.validators[i])
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    /// Voting power of `address`, zero if it is not in the set.
    pub fn power_of(&self, address: &str) -> u64 {
        self.get(address).map(|v| v.power).unwrap_or(0)
    }

    /// True when `power` is strictly more than two thirds of the total.
    pub fn is_quorum(&self, power: u64) -> bool {
        self.total_power > 0 && (power as u128) * 3 > (self.total_power as u128) * 2
    }

    /// True when `power` is strictly more than one third of the total, i.e.
    /// at least one honest validator is among the holders.
    pub fn exceeds_one_third(&self, power: u64) -> bool {
        self.total_power > 0 && (power as u128) * 3 > self.total_power as u128
    }

    /// The stake-weighted proposer for `(height, round)`.
    pub fn proposer(&self, height: u64, round: u32) -> Option<&ValidatorInfo> {
        if self.total_power == 0 {
            return None;
        }
        let mut seed_input = [0u8; 12];
        seed_input[..8].copy_from_slice(&height.to_be_bytes());
        seed_input[8..].copy_from_slice(&round.to_be_bytes());
        let digest = domain_separated_hash("pop 2026-01 proposer", &seed_input);
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let target = u64::from_be_bytes(seed) % self.total_power;

        let mut cumulative = 0u64;
        for v in &self.validators {
            cumulative += v.power;
            if target < cumulative {
                return Some(v);
            }
        }
        self.validators.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(address: &str, power: u64) -> ValidatorInfo {
        ValidatorInfo {
            address: address.to_string(),
            stake: power,
            power,
        }
    }

    fn equal_set() -> ValidatorSet {
        ValidatorSet::new(
            0,
            vec![info("d", 100), info("b", 100), info("a", 100), info("c", 100)],
        )
    }

    #[test]
    fn sorted_by_address_and_zero_power_dropped() {
        let set = ValidatorSet::new(0, vec![info("z", 5), info("a", 0), info("m", 5)]);
        let addrs: Vec<&str> = set.validators().iter().map(|v| v.address.as_str()).collect();
        assert_eq!(addrs, vec!["m", "z"]);
        assert_eq!(set.total_power(), 10);
    }

    #[test]
    fn quorum_is_strictly_more_than_two_thirds() {
        let set = equal_set();
        assert!(!set.is_quorum(200));
        assert!(set.is_quorum(300));
        // 267/400 is just over 2/3.
        assert!(set.is_quorum(267));
        assert!(!set.is_quorum(266));
    }

    #[test]
    fn one_third_threshold() {
        let set = equal_set();
        assert!(!set.exceeds_one_third(100));
        assert!(set.exceeds_one_third(200));
    }

    #[test]
    fn empty_set_never_has_quorum() {
        let set = ValidatorSet::default();
        assert!(!set.is_quorum(0));
        assert!(set.proposer(1, 0).is_none());
    }

    #[test]
    fn proposer_is_deterministic() {
        let set = equal_set();
        let p1 = set.proposer(7, 2).unwrap().address.clone();
        let p2 = set.proposer(7, 2).unwrap().address.clone();
        assert_eq!(p1, p2);
    }

    #[test]
    fn proposer_rotates_across_rounds() {
        let set = equal_set();
        let distinct: std::collections::HashSet<String> = (0..64)
            .map(|r| set.proposer(1, r).unwrap().address.clone())
            .collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn proposer_frequency_follows_power() {
        let set = ValidatorSet::new(0, vec![info("heavy", 900), info("light", 100)]);
        let heavy = (0..2_000)
            .filter(|h| set.proposer(*h, 0).unwrap().address == "heavy")
            .count();
        // Expect ~1800; allow a wide margin for hash variance.
        assert!(heavy > 1_600 && heavy < 1_950, "heavy picked {heavy} times");
    }

    #[test]
    fn power_lookup() {
        let set = equal_set();
        assert_eq!(set.power_of("c"), 100);
        assert_eq!(set.power_of("nobody"), 0);
        assert!(set.contains("a"));
    }
}
