//! One collateral market: its price path, ledger, participants and the
//! per-market engine components, plus running totals.

use log::warn;
use rand::Rng;

use crate::error::{Result, SimulationError};
use crate::ledger::Ledger;
use crate::lifecycle::{LifecycleReport, PositionLifecycle};
use crate::liquidation::{LiquidationCoordinator, LiquidationReport};
use crate::output::{MarketRow, MarketSummary};
use crate::peg::{PegOutcome, PegStabilizer, StableAssetState};
use crate::population::{ParticipantId, Population};
use crate::price::PriceSeries;
use crate::stability::{PoolActivity, PoolReturn, StabilityPoolAccountant};
use crate::state_log::MarketSnapshot;

const EPS: f64 = 1e-9;

pub struct CollateralMarket<L: Ledger> {
    name: String,
    series: PriceSeries,
    ledger: L,
    population: Population,
    participants: usize,
    coordinator: LiquidationCoordinator,
    accountant: StabilityPoolAccountant,
    lifecycle: PositionLifecycle,
    collateral_added: f64,
    collateral_liquidated: f64,
    opened: usize,
    closed: usize,
    liquidated: usize,
    in_recovery: bool,
}

impl<L: Ledger> CollateralMarket<L> {
    /// `seed_collateral` is the collateral already locked in the ledger,
    /// typically the whale trove.
    pub fn new(
        series: PriceSeries,
        ledger: L,
        population: Population,
        coordinator: LiquidationCoordinator,
        accountant: StabilityPoolAccountant,
        lifecycle: PositionLifecycle,
        seed_collateral: f64,
    ) -> Self {
        let participants = population.size();
        Self {
            name: series.market().to_string(),
            series,
            ledger,
            population,
            participants,
            coordinator,
            accountant,
            lifecycle,
            collateral_added: seed_collateral,
            collateral_liquidated: 0.0,
            opened: 0,
            closed: 0,
            liquidated: 0,
            in_recovery: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn collateral_added(&self) -> f64 {
        self.collateral_added
    }

    pub fn collateral_liquidated(&self) -> f64 {
        self.collateral_liquidated
    }

    /// Stable asset held outside this market's stability pool.
    pub fn float(&self) -> f64 {
        self.ledger.stable_supply() - self.ledger.pool_stable()
    }

    /// Pushes the sampled price to the oracle and advances the ledger clock.
    pub fn set_price(&mut self, iteration: usize, hours: f64) -> Result<f64> {
        let price = self.series.price_at(iteration)?;
        self.ledger
            .set_oracle_price(price)
            .map_err(|err| SimulationError::InvariantViolation {
                iteration,
                detail: format!("{} oracle rejected price: {err}", self.name),
                snapshot: self.snapshot().to_string(),
            })?;
        self.ledger.advance_clock(hours);
        Ok(price)
    }

    pub fn liquidate(&mut self, stable_price: f64, governance_price: f64) -> LiquidationReport {
        let report = self.coordinator.liquidate(&mut self.ledger, stable_price, governance_price);
        self.collateral_liquidated += report.collateral_liquidated;
        self.liquidated += report.liquidated.len();
        self.release(&report.liquidated);
        report
    }

    pub fn settle_pool(
        &mut self,
        report: &LiquidationReport,
        stable_price: f64,
        governance_price: f64,
    ) -> PoolReturn {
        self.accountant.settle(&self.ledger, report, stable_price, governance_price)
    }

    pub fn run_lifecycle<R: Rng>(&mut self, stable_price: f64, rng: &mut R) -> LifecycleReport {
        let report = self.lifecycle.run(&mut self.ledger, &mut self.population, stable_price, rng);
        self.collateral_added += report.collateral_added;
        self.opened += report.opened.len();
        self.closed += report.closed.len();
        report
    }

    pub fn rebalance_pool<R: Rng>(&mut self, pool_return: &PoolReturn, stable_price: f64, rng: &mut R) -> PoolActivity {
        self.accountant
            .rebalance(&mut self.ledger, &self.population, pool_return, stable_price, rng)
    }

    pub fn stabilize(
        &mut self,
        stabilizer: &PegStabilizer,
        state: &mut StableAssetState,
        float_elsewhere: f64,
    ) -> PegOutcome {
        let outcome = stabilizer.stabilize(state, &mut self.ledger, float_elsewhere);
        self.closed += outcome.closed.len();
        self.release(&outcome.closed);
        outcome
    }

    /// Participants whose troves the protocol removed return to the
    /// inactive set.
    fn release(&mut self, ids: &[ParticipantId]) {
        for id in ids {
            self.population.deactivate(*id);
        }
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot::read(&self.ledger)
    }

    pub fn row(&self) -> MarketRow {
        MarketRow {
            name: self.name.clone(),
            snapshot: self.snapshot(),
            collateral_added: self.collateral_added,
            collateral_liquidated: self.collateral_liquidated,
        }
    }

    pub fn summary(&self) -> MarketSummary {
        let snapshot = self.snapshot();
        MarketSummary {
            name: self.name.clone(),
            collateral_added: self.collateral_added,
            collateral_liquidated: self.collateral_liquidated,
            liquidated_share: if self.collateral_added > 0.0 {
                self.collateral_liquidated / self.collateral_added
            } else {
                0.0
            },
            final_troves: snapshot.trove_count,
            final_tcr: snapshot.tcr,
            opened: self.opened,
            closed: self.closed,
            liquidated: self.liquidated,
        }
    }

    /// Checks the per-market invariants at an iteration boundary.
    pub fn check_invariants(&mut self, iteration: usize) -> Result<()> {
        let snapshot = self.snapshot();
        let violation = |detail: String| SimulationError::InvariantViolation {
            iteration,
            detail,
            snapshot: snapshot.to_string(),
        };

        if self.collateral_liquidated > self.collateral_added + EPS {
            return Err(violation(format!(
                "{}: collateral liquidated {:.6} exceeds collateral added {:.6}",
                self.name, self.collateral_liquidated, self.collateral_added
            )));
        }
        if !(snapshot.total_collateral.is_finite() && snapshot.total_collateral >= 0.0) {
            return Err(violation(format!("{}: aggregate collateral is negative", self.name)));
        }
        if !self.population.is_partition_of(self.participants) {
            return Err(violation(format!("{}: participant sets do not partition", self.name)));
        }
        // An active participant must hold a trove and vice versa.
        for id in self.population.active_ids() {
            if self.ledger.trove(id).is_none() {
                return Err(violation(format!("{}: active participant {id} has no trove", self.name)));
            }
        }

        if snapshot.recovery_mode && !self.in_recovery {
            warn!("{} entered recovery mode at iteration {iteration}: {snapshot}", self.name);
        }
        self.in_recovery = snapshot.recovery_mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistributionConfig, LifecycleConfig, ProtocolConfig, StabilityConfig};
    use crate::memory_ledger::InMemoryLedger;
    use crate::population::{RiskDistributions, RiskProfile};

    fn market() -> CollateralMarket<InMemoryLedger> {
        let mut ledger = InMemoryLedger::new(ProtocolConfig::default(), 2000.0);
        ledger.credit_collateral(ParticipantId::WHALE, 100_000.0);
        ledger.credit_collateral(ParticipantId(1), 100.0);
        ledger
            .open_position(ParticipantId::WHALE, 10_000.0, 1_000_000.0)
            .unwrap();
        ledger.deposit_to_pool(ParticipantId::WHALE, 500_000.0).unwrap();
        ledger.open_position(ParticipantId(1), 10.0, 5_000.0).unwrap();

        let mut population = Population::new(2);
        population.activate(
            ParticipantId(1),
            RiskProfile {
                target_ratio: 3.8,
                collateral_value: 20_000.0,
                inattention: 0.1,
            },
        );

        let distributions = RiskDistributions::new(&DistributionConfig::default()).unwrap();
        CollateralMarket::new(
            PriceSeries::new("ETH", vec![2000.0, 2000.0, 500.0]),
            ledger,
            population,
            LiquidationCoordinator::new(10, ParticipantId::WHALE),
            StabilityPoolAccountant::new(StabilityConfig::default(), 365.0),
            PositionLifecycle::new(LifecycleConfig::default(), distributions),
            10_010.0,
        )
    }

    #[test]
    fn test_liquidation_releases_participant() {
        let mut market = market();
        market.set_price(2, 24.0).unwrap();

        let report = market.liquidate(1.0, 0.4);
        assert_eq!(report.liquidated, vec![ParticipantId(1)]);
        assert!(!market.population().is_active(ParticipantId(1)));
        assert_eq!(market.collateral_liquidated(), 10.0);
        market.check_invariants(2).unwrap();
    }

    #[test]
    fn test_exhausted_series_is_fatal() {
        let mut market = market();
        assert!(matches!(
            market.set_price(3, 24.0),
            Err(SimulationError::PriceSeriesExhausted { index: 3, .. })
        ));
    }

    #[test]
    fn test_invariant_flags_excess_liquidation() {
        let mut market = market();
        market.collateral_liquidated = market.collateral_added + 1.0;
        assert!(matches!(
            market.check_invariants(5),
            Err(SimulationError::InvariantViolation { iteration: 5, .. })
        ));
    }

    #[test]
    fn test_float_excludes_pool() {
        let market = market();
        let ledger = market.ledger();
        assert_eq!(market.float(), ledger.stable_supply() - 500_000.0);
    }
}
