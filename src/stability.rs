//! Stability pool accounting and depositor behaviour.
//!
//! Each iteration first settles the gains produced by the liquidation round
//! against the depositor set left by the previous iteration, then lets
//! depositors withdraw and other participants deposit.

use std::collections::BTreeMap;

use log::debug;
use rand::Rng;

use crate::config::StabilityConfig;
use crate::ledger::Ledger;
use crate::liquidation::LiquidationReport;
use crate::population::{ParticipantId, Population};

const MIN_POOL_OPERATION: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DepositorRecord {
    /// Deposit at the end of the previous iteration.
    pub deposit_basis: f64,
    /// Value of gains accrued in the ledger and not yet paid out.
    pub unclaimed_value: f64,
    /// Gains realised since the last withdrawal, in stable units.
    pub realized_gain: f64,
    pub last_return: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolReturn {
    /// Annualised return of the pool over the last iteration.
    pub annualized: f64,
    pub depositor_returns: Vec<(ParticipantId, f64)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolActivity {
    pub deposited: f64,
    pub withdrawn: f64,
    pub deposits: usize,
    pub withdrawals: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct StabilityPoolAccountant {
    config: StabilityConfig,
    iterations_per_year: f64,
    records: BTreeMap<ParticipantId, DepositorRecord>,
    settled_once: bool,
}

impl StabilityPoolAccountant {
    pub fn new(config: StabilityConfig, iterations_per_year: f64) -> Self {
        Self {
            config,
            iterations_per_year,
            records: BTreeMap::new(),
            settled_once: false,
        }
    }

    pub fn record(&self, id: ParticipantId) -> Option<&DepositorRecord> {
        self.records.get(&id)
    }

    /// Annualised pool return given the previous deposits and this
    /// iteration's gains.
    pub fn annualized_return(&self, gain: f64, pool_before: f64, stable_price: f64) -> f64 {
        if !self.settled_once {
            self.config.initial_return
        } else if pool_before <= 0.0 {
            self.config.initial_return * 2.0
        } else {
            gain * self.iterations_per_year / (stable_price * pool_before)
        }
    }

    /// Applies this iteration's liquidation and airdrop gains to depositor
    /// records. Must run before [`Self::rebalance`].
    pub fn settle<L: Ledger>(
        &mut self,
        ledger: &L,
        liquidation: &LiquidationReport,
        stable_price: f64,
        governance_price: f64,
    ) -> PoolReturn {
        let annualized =
            self.annualized_return(liquidation.total_gain(), liquidation.pool_before, stable_price);
        self.settled_once = true;

        let depositors = ledger.pool_depositors();
        self.records.retain(|id, _| depositors.contains(id));

        let mut depositor_returns = Vec::with_capacity(depositors.len());
        for id in depositors {
            let gains = ledger.depositor_gains(id);
            let value = gains.collateral * ledger.price() + gains.reward * governance_price;
            let record = self.records.entry(id).or_default();

            let realized = value - record.unclaimed_value;
            record.unclaimed_value = value;
            record.realized_gain += realized;
            record.last_return = if record.deposit_basis > 0.0 {
                realized / (record.deposit_basis * stable_price)
            } else {
                0.0
            };
            depositor_returns.push((id, record.last_return));
        }

        PoolReturn {
            annualized,
            depositor_returns,
        }
    }

    /// How attractive the pool is relative to the natural rate, clamped.
    pub fn attractiveness(&self, annualized: f64) -> f64 {
        let ratio = (annualized / self.config.natural_rate).max(0.0);
        ratio.powf(self.config.elasticity).clamp(0.1, 10.0)
    }

    pub fn rebalance<L: Ledger, R: Rng>(
        &mut self,
        ledger: &mut L,
        population: &Population,
        pool_return: &PoolReturn,
        stable_price: f64,
        rng: &mut R,
    ) -> PoolActivity {
        let attractiveness = self.attractiveness(pool_return.annualized);
        let deposit_p = (self.config.deposit_probability * attractiveness).min(1.0);
        let withdraw_p = (self.config.withdraw_probability / attractiveness).min(1.0);
        let mut activity = PoolActivity::default();

        for id in ledger.pool_depositors() {
            if id.is_whale() {
                continue;
            }
            let deposit = ledger.pool_deposit(id);
            let gain = self.records.get(&id).map_or(0.0, |r| r.realized_gain);
            let gain_ratio = if deposit > 0.0 { gain / (deposit * stable_price) } else { f64::INFINITY };
            if gain_ratio < self.config.withdraw_gain_threshold || !rng.gen_bool(withdraw_p) {
                continue;
            }

            let amount = deposit * self.config.withdraw_fraction;
            match ledger.withdraw_from_pool(id, amount) {
                Ok(receipt) => {
                    activity.withdrawn += -receipt.deposit_change;
                    activity.withdrawals += 1;
                    if let Some(record) = self.records.get_mut(&id) {
                        record.realized_gain = 0.0;
                        record.unclaimed_value = 0.0;
                    }
                }
                Err(err) => {
                    debug!("withdrawal by {id} skipped: {err}");
                    activity.skipped += 1;
                }
            }
        }

        for id in population.all_ids() {
            if ledger.pool_deposit(id) > 0.0 {
                continue;
            }
            let amount = ledger.stable_balance(id) * self.config.deposit_fraction;
            if amount < MIN_POOL_OPERATION || !rng.gen_bool(deposit_p) {
                continue;
            }
            match ledger.deposit_to_pool(id, amount) {
                Ok(_) => {
                    activity.deposited += amount;
                    activity.deposits += 1;
                    let record = self.records.entry(id).or_default();
                    record.unclaimed_value = 0.0;
                }
                Err(err) => {
                    debug!("deposit by {id} skipped: {err}");
                    activity.skipped += 1;
                }
            }
        }

        for id in ledger.pool_depositors() {
            self.records.entry(id).or_default().deposit_basis = ledger.pool_deposit(id);
        }
        self.records.retain(|id, _| ledger.pool_deposit(*id) > 0.0 || ledger.depositor_gains(*id).collateral > 0.0);

        activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::memory_ledger::InMemoryLedger;
    use crate::population::RiskProfile;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn accountant() -> StabilityPoolAccountant {
        StabilityPoolAccountant::new(StabilityConfig::default(), 365.0)
    }

    fn ledger() -> InMemoryLedger {
        let mut ledger = InMemoryLedger::new(ProtocolConfig::default(), 2000.0);
        ledger.credit_collateral(ParticipantId::WHALE, 100_000.0);
        ledger.credit_collateral(ParticipantId(1), 100.0);
        ledger
            .open_position(ParticipantId::WHALE, 10_000.0, 1_000_000.0)
            .unwrap();
        ledger.deposit_to_pool(ParticipantId::WHALE, 500_000.0).unwrap();
        ledger
    }

    #[test]
    fn test_first_settlement_uses_initial_return() {
        let ledger = ledger();
        let mut accountant = accountant();
        let report = LiquidationReport {
            pool_before: 500_000.0,
            ..LiquidationReport::default()
        };

        let first = accountant.settle(&ledger, &report, 1.0, 0.4);
        assert_eq!(first.annualized, 0.2);

        let second = accountant.settle(&ledger, &report, 1.0, 0.4);
        assert_eq!(second.annualized, 0.0);
    }

    #[test]
    fn test_empty_pool_doubles_initial_return() {
        let accountant = StabilityPoolAccountant {
            settled_once: true,
            ..accountant()
        };
        assert_eq!(accountant.annualized_return(10.0, 0.0, 1.0), 0.4);
        assert!((accountant.annualized_return(10.0, 365.0, 1.0) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_settlement_credits_liquidation_gains() {
        let mut ledger = ledger();
        let alice = ParticipantId(1);
        ledger.open_position(alice, 10.0, 5_000.0).unwrap();

        let mut accountant = accountant();
        accountant.settle(&ledger, &LiquidationReport::default(), 1.0, 0.4);
        let mut rng = StdRng::seed_from_u64(0);
        accountant.rebalance(&mut ledger, &Population::new(0), &PoolReturn::default(), 1.0, &mut rng);

        ledger.set_oracle_price(500.0).unwrap();
        let outcome = ledger.liquidate_eligible(ParticipantId::WHALE, 10).unwrap();
        let report = LiquidationReport {
            collateral_to_pool: outcome.collateral_to_pool,
            debt_offset: outcome.debt_offset,
            liquidation_gain: outcome.collateral_to_pool * 500.0 - outcome.debt_offset,
            pool_before: 500_000.0,
            ..LiquidationReport::default()
        };

        let settled = accountant.settle(&ledger, &report, 1.0, 0.4);
        let record = accountant.record(ParticipantId::WHALE).unwrap();
        assert!((record.realized_gain - outcome.collateral_to_pool * 500.0).abs() < 1e-6);
        assert!(settled.annualized < 0.0);
    }

    #[test]
    fn test_attractiveness_is_clamped() {
        let accountant = accountant();
        assert_eq!(accountant.attractiveness(0.0), 0.1);
        assert_eq!(accountant.attractiveness(100.0), 10.0);
        assert!((accountant.attractiveness(0.2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_participants_with_balance_deposit() {
        let mut ledger = ledger();
        let alice = ParticipantId(1);
        ledger.open_position(alice, 10.0, 5_000.0).unwrap();
        let mut population = Population::new(1);
        population.activate(
            alice,
            RiskProfile {
                target_ratio: 2.0,
                collateral_value: 20_000.0,
                inattention: 0.1,
            },
        );

        let config = StabilityConfig {
            deposit_probability: 1.0,
            ..StabilityConfig::default()
        };
        let mut accountant = StabilityPoolAccountant::new(config, 365.0);
        let pool_return = PoolReturn {
            annualized: 0.2,
            depositor_returns: Vec::new(),
        };
        let mut rng = StdRng::seed_from_u64(0);
        let activity = accountant.rebalance(&mut ledger, &population, &pool_return, 1.0, &mut rng);

        assert_eq!(activity.deposits, 1);
        assert!((ledger.pool_deposit(alice) - 2_500.0).abs() < 1e-9);
        assert_eq!(accountant.record(alice).unwrap().deposit_basis, 2_500.0);
    }
}
