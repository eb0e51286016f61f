//! Position lifecycle: close, adjust and open decisions for one market.
//!
//! The three sub-phases run in that order every iteration. A ledger revert
//! only skips the participant concerned; the phase carries on with the rest.
//!
//! ## Decision rules
//! - Close: ratio above `target * (1 + close_band * inattention)`, below the
//!   protocol minimum, or a random exit whose odds rise when the stable asset
//!   trades below peg.
//! - Adjust: ratio outside `target * (1 ± inattention)`; top up collateral
//!   (or repay) when low, draw more debt when high.
//! - Open: independent Bernoulli draw per inactive participant, with the odds
//!   raised when the stable asset trades above `1 + borrowing rate`.

use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::LifecycleConfig;
use crate::ledger::Ledger;
use crate::population::{ParticipantId, Population, RiskDistributions, RiskProfile};

/// Headroom above the protocol minimum when sizing a fresh position.
const SIZING_MARGIN: f64 = 1.01;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleReport {
    pub closed: Vec<ParticipantId>,
    pub adjusted: usize,
    pub opened: Vec<ParticipantId>,
    pub collateral_added: f64,
    /// Net stable asset minted to borrowers, fees excluded.
    pub stable_issued: f64,
    pub issuance_fees: f64,
    pub skipped: usize,
}

pub struct PositionLifecycle {
    config: LifecycleConfig,
    distributions: RiskDistributions,
}

impl PositionLifecycle {
    pub fn new(config: LifecycleConfig, distributions: RiskDistributions) -> Self {
        Self {
            config,
            distributions,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Probability that a participant exits for reasons outside its band.
    pub fn exit_probability(&self, stable_price: f64) -> f64 {
        let discount = (1.0 - stable_price).max(0.0);
        (self.config.close_probability + self.config.close_peg_sensitivity * discount).clamp(0.0, 1.0)
    }

    pub fn open_probability(&self, stable_price: f64, borrowing_rate: f64) -> f64 {
        let premium = (stable_price - 1.0 - borrowing_rate).max(0.0);
        (self.config.open_probability * (1.0 + self.config.open_peg_sensitivity * premium)).clamp(0.0, 1.0)
    }

    fn close_threshold(&self, profile: &RiskProfile) -> f64 {
        profile.target_ratio * (1.0 + self.config.close_band * profile.inattention)
    }

    /// Runs close, adjust and open in order.
    pub fn run<L: Ledger, R: Rng>(
        &self,
        ledger: &mut L,
        population: &mut Population,
        stable_price: f64,
        rng: &mut R,
    ) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        self.close_positions(ledger, population, stable_price, rng, &mut report);
        self.adjust_positions(ledger, population, rng, &mut report);
        self.open_positions(ledger, population, stable_price, rng, &mut report);
        report
    }

    pub fn close_positions<L: Ledger, R: Rng>(
        &self,
        ledger: &mut L,
        population: &mut Population,
        stable_price: f64,
        rng: &mut R,
        report: &mut LifecycleReport,
    ) {
        let exit_p = self.exit_probability(stable_price);
        let mcr = ledger.params().mcr;
        let mut ids = population.active_ids();
        ids.shuffle(rng);

        for id in ids {
            let Some(profile) = population.profile(id).copied() else {
                continue;
            };
            let Some(trove) = ledger.trove(id) else {
                population.deactivate(id);
                continue;
            };
            let icr = trove.collateral_ratio(ledger.price());
            let wants_out = icr > self.close_threshold(&profile) || icr < mcr || rng.gen_bool(exit_p);
            if !wants_out {
                continue;
            }

            // Repayment shortfall is bought from the whale.
            let repayment = trove.debt - ledger.params().gas_compensation;
            let shortfall = repayment - ledger.stable_balance(id);
            if shortfall > 0.0 && !ledger.recovery_mode() && ledger.trove_count() > 1 {
                if let Err(err) = ledger.transfer_stable(ParticipantId::WHALE, id, shortfall) {
                    debug!("close by {id} unfunded: {err}");
                    report.skipped += 1;
                    continue;
                }
            }

            match ledger.close_position(id) {
                Ok(_) => {
                    population.deactivate(id);
                    report.closed.push(id);
                }
                Err(err) => {
                    debug!("close by {id} skipped: {err}");
                    report.skipped += 1;
                }
            }
        }
    }

    pub fn adjust_positions<L: Ledger, R: Rng>(
        &self,
        ledger: &mut L,
        population: &Population,
        rng: &mut R,
        report: &mut LifecycleReport,
    ) {
        let price = ledger.price();
        let mut ids = population.active_ids();
        ids.shuffle(rng);

        for id in ids {
            let (Some(profile), Some(trove)) = (population.profile(id), ledger.trove(id)) else {
                continue;
            };
            let icr = trove.collateral_ratio(price);
            if profile.within_band(icr) {
                continue;
            }
            let target = profile.target_ratio;

            let result = if icr < profile.lower_band() {
                let top_up = target * trove.debt / price - trove.collateral;
                if ledger.collateral_balance(id) >= top_up {
                    ledger.adjust_position(id, top_up, 0.0)
                } else {
                    let excess_debt = trove.debt - trove.collateral * price / target;
                    let repay = excess_debt.min(ledger.stable_balance(id));
                    ledger.adjust_position(id, 0.0, -repay)
                }
            } else {
                let rate = ledger.borrowing_rate();
                let draw = (trove.collateral * price / target - trove.debt) / (1.0 + rate);
                ledger.adjust_position(id, 0.0, draw)
            };

            match result {
                Ok(receipt) => {
                    report.adjusted += 1;
                    report.collateral_added += receipt.collateral_change.max(0.0);
                    if receipt.debt_change > 0.0 {
                        report.stable_issued += receipt.debt_change - receipt.fee;
                        report.issuance_fees += receipt.fee;
                    }
                }
                Err(err) => {
                    debug!("adjustment by {id} skipped: {err}");
                    report.skipped += 1;
                }
            }
        }
    }

    pub fn open_positions<L: Ledger, R: Rng>(
        &self,
        ledger: &mut L,
        population: &mut Population,
        stable_price: f64,
        rng: &mut R,
        report: &mut LifecycleReport,
    ) {
        let rate = ledger.borrowing_rate();
        let open_p = self.open_probability(stable_price, rate);
        if open_p <= 0.0 {
            return;
        }
        let price = ledger.price();
        let gas = ledger.params().gas_compensation;
        let min_net_debt = ledger.params().min_net_debt;

        for id in population.inactive_ids() {
            if !rng.gen_bool(open_p) {
                continue;
            }
            let profile = self.distributions.draw(rng);
            let target = profile.target_ratio;

            let min_value = (min_net_debt * (1.0 + rate) + gas) * target * SIZING_MARGIN;
            let value = profile.collateral_value.max(min_value);
            let collateral = value / price;
            let net_debt = (value / target - gas) / (1.0 + rate);

            match ledger.open_position(id, collateral, net_debt) {
                Ok(receipt) => {
                    population.activate(id, profile);
                    report.opened.push(id);
                    report.collateral_added += collateral;
                    report.stable_issued += net_debt;
                    report.issuance_fees += receipt.fee;
                }
                Err(err) => {
                    debug!("open by {id} skipped: {err}");
                    report.skipped += 1;
                }
            }
        }
    }
}
