//! Participants of one collateral market and their risk parameters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::Rng;
use rand_distr::{ChiSquared, Distribution, Gamma};
use serde::{Deserialize, Serialize};

use crate::config::DistributionConfig;
use crate::error::ConfigError;

/// Opaque participant handle. Identity `0` is reserved for the whale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    pub const WHALE: ParticipantId = ParticipantId(0);

    pub fn is_whale(&self) -> bool {
        *self == Self::WHALE
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parameters drawn when a position opens, held until it closes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RiskProfile {
    pub target_ratio: f64,
    /// Collateral to commit, valued in stable units at the opening price.
    pub collateral_value: f64,
    /// Relative drift of the collateral ratio the participant tolerates.
    pub inattention: f64,
}

impl RiskProfile {
    pub fn lower_band(&self) -> f64 {
        self.target_ratio * (1.0 - self.inattention)
    }

    pub fn upper_band(&self) -> f64 {
        self.target_ratio * (1.0 + self.inattention)
    }

    pub fn within_band(&self, ratio: f64) -> bool {
        ratio >= self.lower_band() && ratio <= self.upper_band()
    }
}

pub struct RiskDistributions {
    collateral: Gamma<f64>,
    target: ChiSquared<f64>,
    target_offset: f64,
    target_scale: f64,
    inattention: Gamma<f64>,
}

impl RiskDistributions {
    pub fn new(config: &DistributionConfig) -> Result<Self, ConfigError> {
        let bad = |what: &str| ConfigError::Invalid(format!("bad {what} distribution parameters"));
        Ok(Self {
            collateral: Gamma::new(config.collateral_gamma_k, config.collateral_gamma_theta)
                .map_err(|_| bad("collateral"))?,
            target: ChiSquared::new(config.target_cr_df).map_err(|_| bad("target ratio"))?,
            target_offset: config.target_cr_offset,
            target_scale: config.target_cr_scale,
            inattention: Gamma::new(config.inattention_gamma_k, config.inattention_gamma_theta)
                .map_err(|_| bad("inattention"))?,
        })
    }

    pub fn draw(&self, rng: &mut impl Rng) -> RiskProfile {
        RiskProfile {
            target_ratio: self.target_offset + self.target_scale * self.target.sample(rng),
            collateral_value: self.collateral.sample(rng),
            inattention: self.inattention.sample(rng),
        }
    }
}

/// Partition of a market's participants into active (holding a trove) and
/// inactive (free to open one).
#[derive(Clone, Debug, Default)]
pub struct Population {
    active: BTreeMap<ParticipantId, RiskProfile>,
    inactive: BTreeSet<ParticipantId>,
}

impl Population {
    /// Participants `1..=size`, all inactive.
    pub fn new(size: usize) -> Self {
        Self {
            active: BTreeMap::new(),
            inactive: (1..=size as u32).map(ParticipantId).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.active.len() + self.inactive.len()
    }

    pub fn active_ids(&self) -> Vec<ParticipantId> {
        self.active.keys().copied().collect()
    }

    pub fn inactive_ids(&self) -> Vec<ParticipantId> {
        self.inactive.iter().copied().collect()
    }

    pub fn all_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.active.keys().chain(self.inactive.iter()).copied().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn profile(&self, id: ParticipantId) -> Option<&RiskProfile> {
        self.active.get(&id)
    }

    pub fn is_active(&self, id: ParticipantId) -> bool {
        self.active.contains_key(&id)
    }

    /// Moves an inactive participant to the active set. Returns false when the
    /// participant was not inactive.
    pub fn activate(&mut self, id: ParticipantId, profile: RiskProfile) -> bool {
        if !self.inactive.remove(&id) {
            return false;
        }
        self.active.insert(id, profile);
        true
    }

    /// Moves an active participant back to the inactive set, discarding its
    /// profile.
    pub fn deactivate(&mut self, id: ParticipantId) -> Option<RiskProfile> {
        let profile = self.active.remove(&id)?;
        self.inactive.insert(id);
        Some(profile)
    }

    pub fn is_partition_of(&self, size: usize) -> bool {
        if self.size() != size {
            return false;
        }
        let overlap = self.active.keys().any(|id| self.inactive.contains(id));
        let in_range = self
            .active
            .keys()
            .chain(self.inactive.iter())
            .all(|id| id.0 >= 1 && id.0 as usize <= size);
        !overlap && in_range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn profile() -> RiskProfile {
        RiskProfile {
            target_ratio: 2.0,
            collateral_value: 10_000.0,
            inattention: 0.1,
        }
    }

    #[test]
    fn test_new_population_is_all_inactive() {
        let population = Population::new(5);
        assert_eq!(population.active_count(), 0);
        assert_eq!(population.inactive_ids().len(), 5);
        assert!(population.is_partition_of(5));
        assert!(!population.inactive_ids().contains(&ParticipantId::WHALE));
    }

    #[test]
    fn test_activate_and_deactivate_keep_partition() {
        let mut population = Population::new(3);
        let id = ParticipantId(2);

        assert!(population.activate(id, profile()));
        assert!(!population.activate(id, profile()));
        assert!(population.is_active(id));
        assert!(population.is_partition_of(3));

        assert_eq!(population.deactivate(id), Some(profile()));
        assert_eq!(population.deactivate(id), None);
        assert!(population.is_partition_of(3));
    }

    #[test]
    fn test_band_edges() {
        let p = profile();
        assert!((p.lower_band() - 1.8).abs() < 1e-12);
        assert!((p.upper_band() - 2.2).abs() < 1e-12);
        assert!(p.within_band(2.1));
        assert!(!p.within_band(2.3));
    }

    #[test]
    fn test_draws_are_within_support() {
        let distributions = RiskDistributions::new(&DistributionConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let p = distributions.draw(&mut rng);
            assert!(p.target_ratio >= 1.1);
            assert!(p.collateral_value > 0.0);
            assert!(p.inattention > 0.0);
        }
    }

    #[test]
    fn test_draw_means_match_parameters() {
        let config = DistributionConfig::default();
        let distributions = RiskDistributions::new(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let n = 20_000;
        let mean_target: f64 = (0..n).map(|_| distributions.draw(&mut rng).target_ratio).sum::<f64>() / n as f64;
        let expected = config.target_cr_offset + config.target_cr_scale * config.target_cr_df;
        assert!((mean_target - expected).abs() < 0.05);
    }
}
