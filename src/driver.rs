//! Simulation driver: iteration order, running totals and macro invariants.
//!
//! ## Iteration
//! For every visited sample index, each market in configured order runs
//! price update, liquidation and pool settlement, the position lifecycle,
//! pool deposits and withdrawals, and finally the peg stabiliser, which reads
//! and writes the shared [`StableAssetState`]. The demand shock on that state
//! is drawn once, before the first market. Once every market has run, the
//! fees of the iteration feed a single governance-token step and a row is
//! logged.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;

use crate::config::{MarketConfig, SimulationConfig};
use crate::error::{Result, SimulationError};
use crate::governance::{GovernanceMarket, GovernanceStep};
use crate::ledger::Ledger;
use crate::lifecycle::{LifecycleReport, PositionLifecycle};
use crate::liquidation::{LiquidationCoordinator, LiquidationReport};
use crate::market::CollateralMarket;
use crate::memory_ledger::InMemoryLedger;
use crate::output::{IterationRecord, RunSummary};
use crate::peg::{PegOutcome, PegStabilizer, StableAssetState};
use crate::population::{ParticipantId, Population, RiskDistributions};
use crate::price::PriceSeries;
use crate::stability::{PoolActivity, StabilityPoolAccountant};

/// What happened in one market during one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct MarketStep {
    pub market: String,
    pub price: f64,
    #[serde(skip)]
    pub liquidation: LiquidationReport,
    pub pool_return: f64,
    #[serde(skip)]
    pub lifecycle: LifecycleReport,
    #[serde(skip)]
    pub pool: PoolActivity,
    pub peg: PegOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub iteration: usize,
    pub markets: Vec<MarketStep>,
    pub fees: f64,
    pub governance: GovernanceStep,
    pub record: IterationRecord,
}

pub struct Simulation<L: Ledger> {
    config: SimulationConfig,
    markets: Vec<CollateralMarket<L>>,
    stabilizer: PegStabilizer,
    stable: StableAssetState,
    governance: GovernanceMarket,
    governance_price: f64,
    rng: StdRng,
    last_index: usize,
    iterations: usize,
    total_redeemed: f64,
    total_fees: f64,
    min_stable_price: f64,
    max_stable_price: f64,
}

impl<L: Ledger> Simulation<L> {
    pub fn new(config: SimulationConfig, markets: Vec<CollateralMarket<L>>, rng: StdRng) -> Self {
        let float: f64 = markets.iter().map(|m| m.float()).sum();
        let stable = StableAssetState::calibrated(config.peg.initial_price, float, config.peg.elasticity);
        let governance = GovernanceMarket::new(config.governance.clone(), config.run.iterations_per_year());

        Self {
            stabilizer: PegStabilizer::new(&config.peg),
            stable,
            governance_price: governance.initial_price(),
            governance,
            markets,
            rng,
            last_index: 0,
            iterations: 0,
            total_redeemed: 0.0,
            total_fees: 0.0,
            min_stable_price: config.peg.initial_price,
            max_stable_price: config.peg.initial_price,
            config,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn markets(&self) -> &[CollateralMarket<L>] {
        &self.markets
    }

    pub fn markets_mut(&mut self) -> &mut [CollateralMarket<L>] {
        &mut self.markets
    }

    pub fn stable_state(&self) -> StableAssetState {
        self.stable
    }

    pub fn governance_price(&self) -> f64 {
        self.governance_price
    }

    pub fn total_redeemed(&self) -> f64 {
        self.total_redeemed
    }

    pub fn market_names(&self) -> Vec<String> {
        self.markets.iter().map(|m| m.name().to_string()).collect()
    }

    /// Runs one iteration at sample `index`.
    pub fn step(&mut self, index: usize) -> Result<StepReport> {
        let hours = index.saturating_sub(self.last_index) as f64 * self.config.run.hours_per_sample;
        let elapsed = index as f64 * self.config.run.hours_per_sample;
        self.last_index = index;

        let governance_price = self.governance_price;
        let mut steps = Vec::with_capacity(self.markets.len());
        let mut fees = 0.0;
        self.stabilizer.shock(&mut self.stable, &mut self.rng);

        for i in 0..self.markets.len() {
            let float_elsewhere: f64 = self
                .markets
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, m)| m.float())
                .sum();
            let market = &mut self.markets[i];
            let stable_price = self.stable.price;

            let price = market.set_price(index, hours)?;
            let liquidation = market.liquidate(stable_price, governance_price);
            let pool_return = market.settle_pool(&liquidation, stable_price, governance_price);
            let lifecycle = market.run_lifecycle(stable_price, &mut self.rng);
            let pool = market.rebalance_pool(&pool_return, stable_price, &mut self.rng);
            let peg = market.stabilize(&self.stabilizer, &mut self.stable, float_elsewhere);

            fees += (lifecycle.issuance_fees + peg.issuance_fee) * peg.price_after + peg.redemption_fee;
            self.total_redeemed += peg.redeemed;

            debug!(
                "{} @ {index}: liquidated {}, opened {}, closed {}, adjusted {}, redeemed {:.2}, peg {:.4} -> {:.4}",
                market.name(),
                liquidation.liquidated.len(),
                lifecycle.opened.len(),
                lifecycle.closed.len(),
                lifecycle.adjusted,
                peg.redeemed,
                peg.price_before,
                peg.price_after
            );

            self.check_stable_price(index)?;
            self.markets[i].check_invariants(index)?;

            steps.push(MarketStep {
                market: self.markets[i].name().to_string(),
                price,
                liquidation,
                pool_return: pool_return.annualized,
                lifecycle,
                pool,
                peg,
            });
        }

        let z: f64 = self.rng.sample(StandardNormal);
        let governance = self.governance.step(governance_price, fees, elapsed, z);
        self.governance_price = governance.price;
        self.total_fees += fees;
        self.iterations += 1;
        self.min_stable_price = self.min_stable_price.min(self.stable.price);
        self.max_stable_price = self.max_stable_price.max(self.stable.price);

        let record = IterationRecord {
            iteration: index,
            stable_price: self.stable.price,
            governance_price: self.governance_price,
            markets: self.markets.iter().map(|m| m.row()).collect(),
            total_redeemed: self.total_redeemed,
        };
        info!(
            "iteration {index}: stable {:.4}, governance {:.4}, redeemed {:.2}",
            record.stable_price, record.governance_price, record.total_redeemed
        );

        Ok(StepReport {
            iteration: index,
            markets: steps,
            fees,
            governance,
            record,
        })
    }

    fn check_stable_price(&self, iteration: usize) -> Result<()> {
        let price = self.stable.price;
        if price.is_finite() && price > 0.0 {
            return Ok(());
        }
        let snapshot = self
            .markets
            .iter()
            .map(|m| format!("{}: {}", m.name(), m.snapshot()))
            .collect::<Vec<_>>()
            .join("; ");
        Err(SimulationError::InvariantViolation {
            iteration,
            detail: format!("stable-asset price {price} is not strictly positive"),
            snapshot,
        })
    }

    /// Runs every configured iteration, handing each record to `on_record`.
    pub fn run_with<F>(&mut self, mut on_record: F) -> Result<RunSummary>
    where
        F: FnMut(&IterationRecord) -> Result<()>,
    {
        let indices: Vec<usize> = self.config.run.iteration_indices().collect();
        info!(
            "running {} iterations over {} markets (seed {})",
            indices.len(),
            self.markets.len(),
            self.config.run.seed
        );
        for index in indices {
            let report = self.step(index)?;
            on_record(&report.record)?;
        }
        Ok(self.summary())
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        self.run_with(|_| Ok(()))
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            seed: self.config.run.seed,
            iterations: self.iterations,
            final_stable_price: self.stable.price,
            min_stable_price: self.min_stable_price,
            max_stable_price: self.max_stable_price,
            final_governance_price: self.governance_price,
            total_redeemed: self.total_redeemed,
            total_fees: self.total_fees,
            markets: self.markets.iter().map(|m| m.summary()).collect(),
        }
    }
}

impl Simulation<InMemoryLedger> {
    /// Builds a run from configuration: price paths, seeded ledgers and
    /// provisioned participants for every market.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.run.seed;

        let mut markets = Vec::with_capacity(config.markets.len());
        for (i, market_config) in config.markets.iter().enumerate() {
            let series = match &market_config.price_file {
                Some(path) => {
                    let column = market_config.price_column.as_deref().unwrap_or(&market_config.name);
                    PriceSeries::from_csv(&market_config.name, path, column)?
                }
                None => {
                    let mut path_rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64 + 1));
                    PriceSeries::generate(
                        &market_config.name,
                        &market_config.price_path_config(config.run.samples),
                        &mut path_rng,
                    )
                }
            };
            markets.push(build_market(config, market_config, series)?);
        }

        Ok(Self::new(config.clone(), markets, StdRng::seed_from_u64(seed)))
    }
}

/// Seeds the whale trove and pool deposit and funds every participant's
/// collateral wallet.
pub fn build_market(
    config: &SimulationConfig,
    market: &MarketConfig,
    series: PriceSeries,
) -> Result<CollateralMarket<InMemoryLedger>> {
    let initial_price = series.price_at(0)?;
    let setup = |source| SimulationError::Setup {
        market: market.name.clone(),
        source,
    };

    let mut ledger = InMemoryLedger::new(config.protocol.clone(), initial_price);
    ledger.credit_collateral(ParticipantId::WHALE, market.whale_collateral);
    ledger
        .open_position(ParticipantId::WHALE, market.whale_collateral, market.whale_debt)
        .map_err(setup)?;
    if market.whale_pool_deposit > 0.0 {
        ledger
            .deposit_to_pool(ParticipantId::WHALE, market.whale_pool_deposit)
            .map_err(setup)?;
    }

    let population = Population::new(config.run.participants);
    let wallet = market.participant_collateral_value / initial_price;
    for id in population.all_ids() {
        ledger.credit_collateral(id, wallet);
    }

    let distributions = RiskDistributions::new(&config.distributions)?;
    Ok(CollateralMarket::new(
        series,
        ledger,
        population,
        LiquidationCoordinator::new(config.run.liquidation_batch, ParticipantId::WHALE),
        StabilityPoolAccountant::new(config.stability.clone(), config.run.iterations_per_year()),
        PositionLifecycle::new(config.lifecycle.clone(), distributions),
        market.whale_collateral,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.run.samples = 24 * 20;
        config.run.participants = 30;
        config.lifecycle.open_probability = 0.2;
        config
    }

    #[test]
    fn test_from_config_seeds_whales() {
        let config = small_config();
        let sim = Simulation::from_config(&config).unwrap();

        assert_eq!(sim.markets().len(), 2);
        for (market, market_config) in sim.markets().iter().zip(&config.markets) {
            let whale = market.ledger().trove(ParticipantId::WHALE).unwrap();
            assert_eq!(whale.collateral, market_config.whale_collateral);
            assert_eq!(market.ledger().pool_stable(), market_config.whale_pool_deposit);
            assert_eq!(market.collateral_added(), market_config.whale_collateral);
            assert!(market.population().is_partition_of(30));
        }
        assert_eq!(sim.stable_state().price, config.peg.initial_price);
    }

    #[test]
    fn test_run_visits_every_stride() {
        let config = small_config();
        let mut sim = Simulation::from_config(&config).unwrap();
        let mut seen = Vec::new();
        let summary = sim
            .run_with(|record| {
                seen.push(record.iteration);
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, config.run.iteration_indices().collect::<Vec<_>>());
        assert_eq!(summary.iterations, seen.len());
        assert!(summary.min_stable_price > 0.0);
        assert!(summary.markets.iter().any(|m| m.opened > 0));
    }

    #[test]
    fn test_same_seed_same_summary() {
        let config = small_config();
        let a = Simulation::from_config(&config).unwrap().run().unwrap();
        let b = Simulation::from_config(&config).unwrap().run().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_demand_shock_drawn_once_per_iteration() {
        let mut config = small_config();
        config.peg.liquidity_volatility = 0.0;
        config.peg.liquidity_drift = 0.01;
        let mut sim = Simulation::from_config(&config).unwrap();
        assert_eq!(sim.markets().len(), 2);

        let before = sim.stable_state().liquidity_demand;
        sim.step(24).unwrap();
        let ratio = sim.stable_state().liquidity_demand / before;
        assert!((ratio - 0.01f64.exp()).abs() < 1e-12, "demand scaled by {ratio}");
    }

    #[test]
    fn test_short_series_fails_loudly() {
        let config = small_config();
        let mut sim = Simulation::from_config(&config).unwrap();
        assert!(matches!(
            sim.step(config.run.samples + 24),
            Err(SimulationError::PriceSeriesExhausted { .. })
        ));
    }
}
