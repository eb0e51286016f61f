//! Simulation configuration loaded from TOML.
//!
//! Every section carries defaults taken from the baseline calibration, so a
//! config file only needs to name what it changes.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::price::{PriceModel, PricePathConfig};

pub const HOURS_PER_YEAR: f64 = 24.0 * 365.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub run: RunConfig,
    pub protocol: ProtocolConfig,
    pub distributions: DistributionConfig,
    pub lifecycle: LifecycleConfig,
    pub stability: StabilityConfig,
    pub peg: PegConfig,
    pub governance: GovernanceConfig,
    pub markets: Vec<MarketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of sampled price points; iterations visit every `stride`-th one.
    pub samples: usize,
    pub stride: usize,
    /// Simulated hours between two consecutive samples.
    pub hours_per_sample: f64,
    pub seed: u64,
    /// Participant identities per market, excluding the whale.
    pub participants: usize,
    pub liquidation_batch: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            samples: 8760,
            stride: 24,
            hours_per_sample: 1.0,
            seed: 2019,
            participants: 200,
            liquidation_batch: 100,
        }
    }
}

impl RunConfig {
    /// Sample indices visited by the driver, in order.
    pub fn iteration_indices(&self) -> impl Iterator<Item = usize> {
        let stride = self.stride;
        (1..self.samples).filter(move |i| i % stride == 0)
    }

    pub fn hours_per_iteration(&self) -> f64 {
        self.stride as f64 * self.hours_per_sample
    }

    pub fn iterations_per_year(&self) -> f64 {
        HOURS_PER_YEAR / self.hours_per_iteration()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub mcr: f64,
    pub ccr: f64,
    pub gas_compensation: f64,
    pub min_net_debt: f64,
    pub borrowing_fee_floor: f64,
    pub borrowing_fee_cap: f64,
    pub redemption_fee_floor: f64,
    pub base_rate_half_life_hours: f64,
    /// Share of a liquidated trove's collateral paid to the liquidator.
    pub liquidation_collateral_compensation: f64,
    /// Reward tokens a market's stability pool can ever emit.
    pub reward_supply: f64,
    pub reward_half_life_hours: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            mcr: 1.1,
            ccr: 1.5,
            gas_compensation: 200.0,
            min_net_debt: 1800.0,
            borrowing_fee_floor: 0.005,
            borrowing_fee_cap: 0.05,
            redemption_fee_floor: 0.005,
            base_rate_half_life_hours: 12.0,
            liquidation_collateral_compensation: 0.005,
            reward_supply: 32_000_000.0 / 3.0,
            reward_half_life_hours: HOURS_PER_YEAR,
        }
    }
}

/// Parameters of the per-participant risk draws.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Collateral value in stable units ~ Gamma(k, theta).
    pub collateral_gamma_k: f64,
    pub collateral_gamma_theta: f64,
    /// Target ratio = offset + scale * ChiSquared(df).
    pub target_cr_df: f64,
    pub target_cr_offset: f64,
    pub target_cr_scale: f64,
    /// Rational inattention ~ Gamma(k, theta).
    pub inattention_gamma_k: f64,
    pub inattention_gamma_theta: f64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            collateral_gamma_k: 10.0,
            collateral_gamma_theta: 2000.0,
            target_cr_df: 16.0,
            target_cr_offset: 1.1,
            target_cr_scale: 0.1,
            inattention_gamma_k: 4.0,
            inattention_gamma_theta: 0.08,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub open_probability: f64,
    pub close_probability: f64,
    /// Closing happens once the ratio exceeds target * (1 + close_band * inattention).
    pub close_band: f64,
    pub open_peg_sensitivity: f64,
    pub close_peg_sensitivity: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            open_probability: 0.02,
            close_probability: 0.005,
            close_band: 3.0,
            open_peg_sensitivity: 20.0,
            close_peg_sensitivity: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub initial_return: f64,
    pub natural_rate: f64,
    pub elasticity: f64,
    pub deposit_probability: f64,
    pub deposit_fraction: f64,
    pub withdraw_probability: f64,
    pub withdraw_fraction: f64,
    /// Realised gain, relative to the deposit, that prompts a withdrawal.
    pub withdraw_gain_threshold: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            initial_return: 0.2,
            natural_rate: 0.2,
            elasticity: 1.0,
            deposit_probability: 0.05,
            deposit_fraction: 0.5,
            withdraw_probability: 0.02,
            withdraw_fraction: 0.5,
            withdraw_gain_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PegConfig {
    pub initial_price: f64,
    /// Price elasticity of liquidity-pool demand, negative.
    pub elasticity: f64,
    pub liquidity_volatility: f64,
    pub liquidity_drift: f64,
}

impl Default for PegConfig {
    fn default() -> Self {
        Self {
            initial_price: 1.0,
            elasticity: -20.0,
            liquidity_volatility: 0.001,
            liquidity_drift: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub initial_price: f64,
    pub drift: f64,
    pub volatility: f64,
    pub revenue_sensitivity: f64,
    pub pe_ratio: f64,
    pub supply_cap: f64,
    pub half_life_hours: f64,
    pub warmup_hours: f64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            initial_price: 0.4,
            drift: 0.001,
            volatility: 0.005,
            revenue_sensitivity: 0.01,
            pe_ratio: 50.0,
            supply_cap: 100_000_000.0,
            half_life_hours: HOURS_PER_YEAR,
            warmup_hours: 720.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub name: String,
    pub initial_price: f64,
    pub price_model: PriceModel,
    /// Per-sample drift and volatility of the generated path.
    pub drift: f64,
    pub volatility: f64,
    pub jump_intensity: f64,
    pub jump_mean: f64,
    pub jump_std: f64,
    pub price_floor: f64,
    /// Load the path from a CSV column instead of generating it.
    pub price_file: Option<PathBuf>,
    pub price_column: Option<String>,
    pub whale_collateral: f64,
    pub whale_debt: f64,
    pub whale_pool_deposit: f64,
    /// Collateral wallet of every participant, valued at the initial price.
    pub participant_collateral_value: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self::eth()
    }
}

impl MarketConfig {
    pub fn eth() -> Self {
        Self {
            name: "ETH".to_string(),
            initial_price: 2000.0,
            price_model: PriceModel::Gbm,
            drift: 0.0,
            volatility: 0.005,
            jump_intensity: 0.001,
            jump_mean: -0.08,
            jump_std: 0.04,
            price_floor: 1.0,
            price_file: None,
            price_column: None,
            whale_collateral: 30_000.0,
            whale_debt: 10_000_000.0,
            whale_pool_deposit: 1_000_000.0,
            participant_collateral_value: 1_000_000.0,
        }
    }

    pub fn btc() -> Self {
        Self {
            name: "BTC".to_string(),
            initial_price: 50_000.0,
            volatility: 0.004,
            whale_collateral: 3_000.0,
            whale_pool_deposit: 100_000.0,
            ..Self::eth()
        }
    }

    pub fn price_path_config(&self, samples: usize) -> PricePathConfig {
        PricePathConfig {
            model: self.price_model,
            samples,
            initial_price: self.initial_price,
            drift: self.drift,
            volatility: self.volatility,
            jump_intensity: self.jump_intensity,
            jump_mean: self.jump_mean,
            jump_std: self.jump_std,
            floor: self.price_floor,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            protocol: ProtocolConfig::default(),
            distributions: DistributionConfig::default(),
            lifecycle: LifecycleConfig::default(),
            stability: StabilityConfig::default(),
            peg: PegConfig::default(),
            governance: GovernanceConfig::default(),
            markets: vec![MarketConfig::eth(), MarketConfig::btc()],
        }
    }
}

impl SimulationConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.run.stride == 0 {
            return invalid("run.stride must be at least 1".into());
        }
        if self.run.samples <= self.run.stride {
            return invalid(format!(
                "run.samples ({}) must exceed run.stride ({})",
                self.run.samples, self.run.stride
            ));
        }
        if self.run.hours_per_sample <= 0.0 {
            return invalid("run.hours_per_sample must be positive".into());
        }
        if self.markets.is_empty() {
            return invalid("at least one [[markets]] entry is required".into());
        }

        let mut names = HashSet::new();
        for market in &self.markets {
            if !names.insert(market.name.as_str()) {
                return invalid(format!("duplicate market name {}", market.name));
            }
            if market.initial_price <= 0.0 || market.price_floor <= 0.0 {
                return invalid(format!("{}: prices must be positive", market.name));
            }
            if market.volatility < 0.0 || market.jump_std < 0.0 || market.jump_intensity < 0.0 {
                return invalid(format!("{}: volatility parameters must be >= 0", market.name));
            }
            if market.whale_collateral <= 0.0 || market.whale_debt <= 0.0 {
                return invalid(format!("{}: whale seed must be positive", market.name));
            }
            if market.whale_pool_deposit < 0.0 || market.whale_pool_deposit > market.whale_debt {
                return invalid(format!(
                    "{}: whale_pool_deposit must lie in [0, whale_debt]",
                    market.name
                ));
            }
        }

        let d = &self.distributions;
        for (name, value) in [
            ("collateral_gamma_k", d.collateral_gamma_k),
            ("collateral_gamma_theta", d.collateral_gamma_theta),
            ("target_cr_df", d.target_cr_df),
            ("target_cr_scale", d.target_cr_scale),
            ("inattention_gamma_k", d.inattention_gamma_k),
            ("inattention_gamma_theta", d.inattention_gamma_theta),
        ] {
            if !(value > 0.0) {
                return invalid(format!("distributions.{name} must be positive"));
            }
        }

        for (name, value) in [
            ("lifecycle.open_probability", self.lifecycle.open_probability),
            ("lifecycle.close_probability", self.lifecycle.close_probability),
            ("stability.deposit_probability", self.stability.deposit_probability),
            ("stability.deposit_fraction", self.stability.deposit_fraction),
            ("stability.withdraw_probability", self.stability.withdraw_probability),
            ("stability.withdraw_fraction", self.stability.withdraw_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must lie in [0, 1], got {value}"));
            }
        }

        let p = &self.protocol;
        if p.mcr <= 1.0 || p.ccr < p.mcr {
            return invalid("protocol ratios must satisfy 1 < mcr <= ccr".into());
        }
        if p.borrowing_fee_floor > p.borrowing_fee_cap {
            return invalid("protocol.borrowing_fee_floor exceeds borrowing_fee_cap".into());
        }

        if self.peg.elasticity >= 0.0 {
            return invalid("peg.elasticity must be negative".into());
        }
        if self.peg.initial_price <= 0.0 || self.governance.initial_price <= 0.0 {
            return invalid("initial prices must be positive".into());
        }
        if self.stability.natural_rate <= 0.0 {
            return invalid("stability.natural_rate must be positive".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.markets.len(), 2);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [run]
            samples = 240
            stride = 24

            [lifecycle]
            open_probability = 0.0

            [[markets]]
            name = "ETH"
            initial_price = 1500.0
        "#;
        let config = SimulationConfig::from_toml_str(text).unwrap();

        assert_eq!(config.run.samples, 240);
        assert_eq!(config.run.seed, RunConfig::default().seed);
        assert_eq!(config.lifecycle.open_probability, 0.0);
        assert_eq!(config.markets.len(), 1);
        assert_eq!(config.markets[0].initial_price, 1500.0);
        assert_eq!(config.markets[0].whale_debt, 10_000_000.0);
    }

    #[test]
    fn test_iteration_indices_follow_stride() {
        let run = RunConfig {
            samples: 100,
            stride: 24,
            ..RunConfig::default()
        };
        let indices: Vec<usize> = run.iteration_indices().collect();
        assert_eq!(indices, vec![24, 48, 72, 96]);
    }

    #[test]
    fn test_iteration_indices_outlive_config() {
        let indices = RunConfig {
            samples: 50,
            stride: 10,
            ..RunConfig::default()
        }
        .iteration_indices();
        assert_eq!(indices.collect::<Vec<_>>(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_rejects_duplicate_markets() {
        let mut config = SimulationConfig::default();
        config.markets = vec![MarketConfig::eth(), MarketConfig::eth()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_probability_out_of_range() {
        let mut config = SimulationConfig::default();
        config.lifecycle.open_probability = 1.5;
        assert!(config.validate().is_err());
    }
}
