//! # Reward Distribution
//!
//! Each committed block mints `block_reward` and splits it among the
//! validators whose precommits for the *previous* block were included in
//! this block's `last_commit`. Using the canonical certificate, rather than
//! whatever precommits a node happened to see, keeps the payout identical
//! on every node.
//!
//! Shares are pro-rata to voting power. Integer division leaves a remainder
//! of at most `participants - 1` units; it goes to the highest-power
//! participant so the total paid is exactly `block_reward`.

use serde::{Deserialize, Serialize};

use crate::consensus::validator_set::ValidatorSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardConfig {
    pub block_reward: u64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            block_reward: crate::config::BLOCK_REWARD,
        }
    }
}

/// Payouts for one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardDistribution {
    pub height: u64,
    pub payouts: Vec<(String, u64)>,
}

impl RewardDistribution {
    pub fn total(&self) -> u64 {
        self.payouts.iter().map(|(_, a)| *a).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RewardDistributor {
    config: RewardConfig,
}

impl RewardDistributor {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn block_reward(&self) -> u64 {
        self.config.block_reward
    }

    /// Splits the block reward among `participants` (duplicates and
    /// non-members of `set` are ignored). Non-participants get nothing.
    pub fn distribute(
        &self,
        height: u64,
        participants: &[String],
        set: &ValidatorSet,
    ) -> RewardDistribution {
        let mut counted: Vec<(&str, u64)> = Vec::new();
        for p in participants {
            let power = set.power_of(p);
            if power > 0 && !counted.iter().any(|(a, _)| *a == p.as_str()) {
                counted.push((p.as_str(), power));
            }
        }
        counted.sort_by(|a, b| a.0.cmp(b.0));

        let total_power: u128 = counted.iter().map(|(_, p)| *p as u128).sum();
        if total_power == 0 || self.config.block_reward == 0 {
            return RewardDistribution {
                height,
                payouts: Vec::new(),
            };
        }

        let reward = self.config.block_reward as u128;
        let mut payouts: Vec<(String, u64)> = counted
            .iter()
            .map(|(addr, power)| (addr.to_string(), (reward * *power as u128 / total_power) as u64))
            .collect();

        let paid: u64 = payouts.iter().map(|(_, a)| *a).sum();
        let remainder = self.config.block_reward - paid;
        if remainder > 0 {
            // Highest power wins; ties go to the lowest address.
            let mut best = 0;
            for (i, (_, power)) in counted.iter().enumerate() {
                if *power > counted[best].1 {
                    best = i;
                }
            }
            payouts[best].1 += remainder;
        }

        RewardDistribution { height, payouts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::validator_set::ValidatorInfo;

    fn set(powers: &[(&str, u64)]) -> ValidatorSet {
        ValidatorSet::new(
            0,
            powers
                .iter()
                .map(|(a, p)| ValidatorInfo {
                    address: a.to_string(),
                    stake: *p,
                    power: *p,
                })
                .collect(),
        )
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_power_splits_evenly() {
        let d = RewardDistributor::new(RewardConfig { block_reward: 900 });
        let out = d.distribute(2, &names(&["a", "b", "c"]), &set(&[("a", 1), ("b", 1), ("c", 1), ("d", 1)]));
        assert_eq!(
            out.payouts,
            vec![("a".into(), 300), ("b".into(), 300), ("c".into(), 300)]
        );
    }

    #[test]
    fn non_participants_get_nothing() {
        let d = RewardDistributor::new(RewardConfig { block_reward: 100 });
        let out = d.distribute(2, &names(&["a"]), &set(&[("a", 5), ("b", 5)]));
        assert_eq!(out.payouts, vec![("a".into(), 100)]);
    }

    #[test]
    fn remainder_goes_to_highest_power() {
        let d = RewardDistributor::new(RewardConfig { block_reward: 100 });
        let out = d.distribute(2, &names(&["a", "b", "c"]), &set(&[("a", 1), ("b", 1), ("c", 2)]));
        // 25 + 25 + 50 = 100 exactly; try an uneven one too.
        assert_eq!(out.total(), 100);

        let d = RewardDistributor::new(RewardConfig { block_reward: 10 });
        let out = d.distribute(2, &names(&["a", "b", "c"]), &set(&[("a", 1), ("b", 1), ("c", 1)]));
        assert_eq!(out.total(), 10);
        assert_eq!(out.payouts[0], ("a".into(), 4));
    }

    #[test]
    fn reward_is_conserved_for_odd_weights() {
        let d = RewardDistributor::new(RewardConfig { block_reward: 1_000 });
        let out = d.distribute(
            9,
            &names(&["a", "b", "c"]),
            &set(&[("a", 7), ("b", 13), ("c", 29)]),
        );
        assert_eq!(out.total(), 1_000);
        let c = out.payouts.iter().find(|(a, _)| a == "c").unwrap().1;
        assert!(c >= 1_000 * 29 / 49);
    }

    #[test]
    fn unknown_and_duplicate_participants_ignored() {
        let d = RewardDistributor::new(RewardConfig { block_reward: 100 });
        let out = d.distribute(2, &names(&["a", "a", "zed"]), &set(&[("a", 1), ("b", 1)]));
        assert_eq!(out.payouts, vec![("a".into(), 100)]);
    }

    #[test]
    fn no_participants_no_payout() {
        let d = RewardDistributor::default();
        assert!(d.distribute(2, &[], &set(&[("a", 1)])).payouts.is_empty());
    }
}
