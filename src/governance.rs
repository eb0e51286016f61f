//! Governance-token price process.
//!
//! A geometric random walk whose drift leans on protocol revenue: when the
//! token's earnings yield times the target P/E exceeds one the drift rises,
//! otherwise it falls. Revenue feedback stays off during the warm-up period,
//! while the circulating supply is still tiny.

use serde::{Deserialize, Serialize};

use crate::config::GovernanceConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernanceStep {
    pub price: f64,
    pub annualized_revenue: f64,
    pub market_cap: f64,
    pub drift: f64,
}

#[derive(Clone, Debug)]
pub struct GovernanceMarket {
    config: GovernanceConfig,
    iterations_per_year: f64,
}

impl GovernanceMarket {
    pub fn new(config: GovernanceConfig, iterations_per_year: f64) -> Self {
        Self {
            config,
            iterations_per_year,
        }
    }

    pub fn initial_price(&self) -> f64 {
        self.config.initial_price
    }

    /// Tokens in circulation `hours` into the run.
    pub fn circulating_supply(&self, hours: f64) -> f64 {
        self.config.supply_cap / 3.0 * (1.0 - 0.5_f64.powf(hours / self.config.half_life_hours))
    }

    /// Advances the price by one iteration.
    ///
    /// `fees` is the protocol revenue of the iteration in stable units, `z` a
    /// standard normal draw.
    pub fn step(&self, previous_price: f64, fees: f64, hours: f64, z: f64) -> GovernanceStep {
        let supply = self.circulating_supply(hours);
        let market_cap = previous_price * supply;
        let annualized_revenue = fees * self.iterations_per_year;

        let mut drift = self.config.drift;
        if hours >= self.config.warmup_hours && market_cap > 0.0 {
            let earnings_yield = annualized_revenue / market_cap;
            let pressure = (earnings_yield * self.config.pe_ratio - 1.0).clamp(-1.0, 1.0);
            drift += self.config.revenue_sensitivity * pressure;
        }

        let sigma = self.config.volatility;
        let price = previous_price * (drift - 0.5 * sigma * sigma + sigma * z).exp();

        GovernanceStep {
            price,
            annualized_revenue,
            market_cap,
            drift,
        }
    }
}
