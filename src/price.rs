//! Exogenous collateral price paths.
//!
//! Paths are generated once per market before the run starts and read back
//! by index, one sample per simulated time unit.
//!
//! ## Price Models
//! - Geometric Brownian Motion (baseline)
//! - Jump-diffusion (Merton model)
//! - GARCH (volatility clustering)
//! - Constant (flat path, for controlled experiments)

use std::path::Path;

use rand::prelude::*;
use rand_distr::{Distribution, Normal, Poisson};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceModel {
    Gbm,           // Geometric Brownian Motion
    JumpDiffusion, // Merton jump-diffusion
    Garch,         // Volatility clustering
    Constant,
}

impl PriceModel {
    pub fn all() -> Vec<Self> {
        vec![Self::Gbm, Self::JumpDiffusion, Self::Garch, Self::Constant]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gbm => "GBM (baseline)",
            Self::JumpDiffusion => "Jump-Diffusion",
            Self::Garch => "GARCH",
            Self::Constant => "Constant",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PricePathConfig {
    pub model: PriceModel,
    pub samples: usize,
    pub initial_price: f64,
    pub drift: f64,          // Per-sample drift (mu)
    pub volatility: f64,     // Per-sample volatility (sigma)
    pub jump_intensity: f64, // Expected jumps per sample (lambda)
    pub jump_mean: f64,      // Mean log jump size
    pub jump_std: f64,       // Jump size std dev
    pub floor: f64,
}

impl Default for PricePathConfig {
    fn default() -> Self {
        Self {
            model: PriceModel::Gbm,
            samples: 8760,
            initial_price: 2000.0,
            drift: 0.0,
            volatility: 0.005,
            jump_intensity: 0.001,
            jump_mean: -0.08,
            jump_std: 0.04,
            floor: 1.0,
        }
    }
}

/// Generates `config.samples` prices starting at `config.initial_price`.
pub fn generate_price_path(config: &PricePathConfig, rng: &mut impl Rng) -> Vec<f64> {
    let mut prices = Vec::with_capacity(config.samples.max(1));
    let mut price = config.initial_price;
    prices.push(price);

    let normal = Normal::new(0.0, 1.0).unwrap();
    let jump = Normal::new(config.jump_mean, config.jump_std.max(0.0)).unwrap();
    let jumps = (config.jump_intensity > 0.0).then(|| Poisson::new(config.jump_intensity).unwrap());

    let long_run_variance = config.volatility.powi(2);
    let mut current_vol = config.volatility;

    for _ in 1..config.samples {
        match config.model {
            PriceModel::Gbm => {
                let z: f64 = normal.sample(rng);
                let ret = config.drift - 0.5 * config.volatility.powi(2) + config.volatility * z;
                price *= ret.exp();
            }

            PriceModel::JumpDiffusion => {
                let z: f64 = normal.sample(rng);
                let diffusion =
                    config.drift - 0.5 * config.volatility.powi(2) + config.volatility * z;

                let num_jumps = jumps.as_ref().map_or(0, |p| p.sample(rng) as u64);
                let jump_component: f64 = (0..num_jumps).map(|_| jump.sample(rng)).sum();

                price *= (diffusion + jump_component).exp();
            }

            PriceModel::Garch => {
                let z: f64 = normal.sample(rng);

                let alpha = 0.1;
                let beta = 0.85;
                let omega = long_run_variance * (1.0 - alpha - beta);

                let shock = current_vol * z;
                current_vol = (omega + alpha * shock.powi(2) + beta * current_vol.powi(2)).sqrt();
                current_vol = current_vol.clamp(config.volatility / 3.0, config.volatility * 3.0);

                let ret = config.drift - 0.5 * current_vol.powi(2) + current_vol * z;
                price *= ret.exp();
            }

            PriceModel::Constant => {}
        }

        price = price.max(config.floor);
        prices.push(price);
    }

    prices
}

/// Read-only, pre-generated price path for one collateral market.
#[derive(Clone, Debug)]
pub struct PriceSeries {
    market: String,
    prices: Vec<f64>,
}

impl PriceSeries {
    pub fn new(market: impl Into<String>, prices: Vec<f64>) -> Self {
        Self {
            market: market.into(),
            prices,
        }
    }

    pub fn generate(market: impl Into<String>, config: &PricePathConfig, rng: &mut impl Rng) -> Self {
        Self::new(market, generate_price_path(config, rng))
    }

    pub fn constant(market: impl Into<String>, price: f64, samples: usize) -> Self {
        Self::new(market, vec![price; samples])
    }

    /// Loads a path from one column of a headed CSV file.
    pub fn from_csv<P: AsRef<Path>>(market: impl Into<String>, path: P, column: &str) -> Result<Self> {
        let market = market.into();
        let mut rdr = csv::Reader::from_path(path.as_ref())?;
        let headers = rdr.headers()?.clone();
        let idx = headers.iter().position(|h| h == column).ok_or_else(|| {
            SimulationError::Config(crate::error::ConfigError::Invalid(format!(
                "{}: column {column} not found in {}",
                market,
                path.as_ref().display()
            )))
        })?;

        let mut prices = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let raw = record.get(idx).unwrap_or_default();
            let price: f64 = raw.trim().parse().map_err(|_| {
                SimulationError::Config(crate::error::ConfigError::Invalid(format!(
                    "{market}: unparseable price {raw:?}"
                )))
            })?;
            prices.push(price);
        }

        Ok(Self::new(market, prices))
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn price_at(&self, index: usize) -> Result<f64> {
        self.prices
            .get(index)
            .copied()
            .ok_or_else(|| SimulationError::PriceSeriesExhausted {
                market: self.market.clone(),
                index,
                len: self.prices.len(),
            })
    }
}
