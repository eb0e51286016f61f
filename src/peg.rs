//! Stable-asset price formation and peg arbitrage.
//!
//! Stable asset held outside the stability pools (the float) faces a
//! constant-elasticity demand curve `float = A * p^elasticity`. `A` takes one
//! random shock per iteration, which moves the implied price `p`. Arbitrage then
//! pulls `p` back inside the band `[1 - redemption fee, 1 + borrowing rate]`:
//!
//! - below the band the whale redeems stable asset for collateral at par,
//!   shrinking the float until `p` reaches `1 - fee`;
//! - above the band the whale draws new debt and sells it until `p` falls
//!   back to `1 + borrowing rate`.
//!
//! The state is shared by every market and threaded through them in order.

use log::{debug, warn};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::PegConfig;
use crate::ledger::Ledger;
use crate::population::ParticipantId;

const BISECTION_STEPS: usize = 60;

/// The one piece of state shared across markets.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StableAssetState {
    pub price: f64,
    /// Scale `A` of the liquidity-pool demand curve.
    pub liquidity_demand: f64,
}

impl StableAssetState {
    /// Chooses `A` so that `float` clears at `price`.
    pub fn calibrated(price: f64, float: f64, elasticity: f64) -> Self {
        Self {
            price,
            liquidity_demand: float.max(1.0) / price.powf(elasticity),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PegOutcome {
    pub price_before: f64,
    pub price_after: f64,
    pub redeemed: f64,
    /// Redemption fee valued in stable units.
    pub redemption_fee: f64,
    /// Debt drawn by upper-band arbitrage, net of fee.
    pub issued: f64,
    pub issuance_fee: f64,
    /// Troves closed by the redemption.
    #[serde(skip)]
    pub closed: Vec<ParticipantId>,
}

pub struct PegStabilizer {
    elasticity: f64,
    drift: f64,
    volatility: f64,
}

impl PegStabilizer {
    pub fn new(config: &PegConfig) -> Self {
        Self {
            elasticity: config.elasticity,
            drift: config.liquidity_drift,
            volatility: config.liquidity_volatility,
        }
    }

    pub fn elasticity(&self) -> f64 {
        self.elasticity
    }

    /// Market-clearing price for a float under demand scale `a`.
    pub fn clearing_price(&self, float: f64, a: f64) -> f64 {
        (float.max(f64::MIN_POSITIVE) / a).powf(1.0 / self.elasticity)
    }

    /// Float that clears at `price`.
    pub fn float_at(&self, price: f64, a: f64) -> f64 {
        a * price.powf(self.elasticity)
    }

    /// Applies the iteration's log-normal shock to the shared demand scale.
    pub fn shock<R: Rng>(&self, state: &mut StableAssetState, rng: &mut R) {
        let z: f64 = rng.sample(StandardNormal);
        state.liquidity_demand *= (self.drift + self.volatility * z).exp();
    }

    /// One stabiliser step for one market.
    ///
    /// `float_elsewhere` is the float held against the other markets, read
    /// after their own steps in this iteration.
    pub fn stabilize<L: Ledger>(
        &self,
        state: &mut StableAssetState,
        ledger: &mut L,
        float_elsewhere: f64,
    ) -> PegOutcome {
        let price_before = state.price;
        let a = state.liquidity_demand;

        let float = float_elsewhere + ledger.stable_supply() - ledger.pool_stable();
        let price = self.clearing_price(float, a);
        let mut outcome = PegOutcome {
            price_before,
            ..PegOutcome::default()
        };

        let floor_rate = ledger.redemption_rate_for(0.0);
        let cap_rate = ledger.borrowing_rate();

        if price < 1.0 - floor_rate {
            let amount = self.redemption_volume(ledger, float, a);
            if amount > 0.0 {
                match ledger.redeem(ParticipantId::WHALE, amount) {
                    Ok(redemption) => {
                        outcome.redeemed = redemption.stable_redeemed;
                        outcome.redemption_fee = redemption.fee_collateral * ledger.price();
                        outcome.closed = redemption.closed;
                        debug!(
                            "redeemed {:.2} at fee rate {:.4}",
                            redemption.stable_redeemed, redemption.fee_rate
                        );
                    }
                    Err(err) => warn!("redemption of {amount:.2} reverted: {err}"),
                }
            }
        } else if price > 1.0 + cap_rate {
            // The fee is minted alongside the draw, so both land in the float.
            let amount = (self.float_at(1.0 + cap_rate, a) - float) / (1.0 + cap_rate);
            if amount > 0.0 {
                match ledger.adjust_position(ParticipantId::WHALE, 0.0, amount) {
                    Ok(receipt) => {
                        outcome.issued = amount;
                        outcome.issuance_fee = receipt.fee;
                    }
                    Err(err) => debug!("upper arbitrage of {amount:.2} reverted: {err}"),
                }
            }
        }

        let float_after = float_elsewhere + ledger.stable_supply() - ledger.pool_stable();
        outcome.price_after = self.clearing_price(float_after, a);
        state.price = outcome.price_after;
        outcome
    }

    /// Volume whose redemption lifts the price to `1 - fee(volume)`, bounded
    /// by the arbitrageur's balance.
    fn redemption_volume<L: Ledger>(&self, ledger: &L, float: f64, a: f64) -> f64 {
        let upper = ledger.stable_balance(ParticipantId::WHALE).min(float);
        if upper <= 0.0 {
            return 0.0;
        }
        let gap = |r: f64| self.clearing_price(float - r, a) - (1.0 - ledger.redemption_rate_for(r));
        if gap(upper) <= 0.0 {
            return upper;
        }

        let (mut lo, mut hi) = (0.0, upper);
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            if gap(mid) < 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::memory_ledger::InMemoryLedger;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn quiet_stabilizer() -> PegStabilizer {
        PegStabilizer::new(&PegConfig {
            liquidity_volatility: 0.0,
            ..PegConfig::default()
        })
    }

    fn ledger() -> InMemoryLedger {
        let mut ledger = InMemoryLedger::new(ProtocolConfig::default(), 2000.0);
        ledger.credit_collateral(ParticipantId::WHALE, 100_000.0);
        ledger.credit_collateral(ParticipantId(1), 100.0);
        ledger
            .open_position(ParticipantId::WHALE, 10_000.0, 1_000_000.0)
            .unwrap();
        ledger.open_position(ParticipantId(1), 10.0, 5_000.0).unwrap();
        ledger
    }

    fn float(ledger: &InMemoryLedger) -> f64 {
        ledger.stable_supply() - ledger.pool_stable()
    }

    #[test]
    fn test_calibration_clears_at_initial_price() {
        let stabilizer = quiet_stabilizer();
        let state = StableAssetState::calibrated(1.0, 1_000_000.0, -20.0);
        assert_relative_eq!(
            stabilizer.clearing_price(1_000_000.0, state.liquidity_demand),
            1.0,
            max_relative = 1e-12
        );
        assert!(stabilizer.clearing_price(1_100_000.0, state.liquidity_demand) < 1.0);
    }

    #[test]
    fn test_in_band_price_is_left_alone() {
        let stabilizer = quiet_stabilizer();
        let mut ledger = ledger();
        let mut state = StableAssetState::calibrated(1.0, float(&ledger), -20.0);
        let supply = ledger.stable_supply();

        let outcome = stabilizer.stabilize(&mut state, &mut ledger, 0.0);
        assert_eq!(outcome.redeemed, 0.0);
        assert_eq!(outcome.issued, 0.0);
        assert_relative_eq!(outcome.price_after, 1.0, max_relative = 1e-12);
        assert_eq!(ledger.stable_supply(), supply);
    }

    #[test]
    fn test_below_peg_redeems_toward_peg() {
        let stabilizer = quiet_stabilizer();
        let mut ledger = ledger();
        let mut state = StableAssetState::calibrated(0.97, float(&ledger), -20.0);
        let supply = ledger.stable_supply();

        let outcome = stabilizer.stabilize(&mut state, &mut ledger, 0.0);
        assert!(outcome.redeemed > 0.0);
        assert!(outcome.redemption_fee > 0.0);
        assert!(outcome.price_after > outcome.price_before);
        assert!(outcome.price_after <= 1.0);
        assert_eq!(state.price, outcome.price_after);
        // The closed trove's gas reserve is burned on top of the redeemed amount.
        assert!(ledger.stable_supply() <= supply - outcome.redeemed + 1e-6);
        assert!(outcome.price_after > 0.96);
    }

    #[test]
    fn test_above_band_issues_debt() {
        let stabilizer = quiet_stabilizer();
        let mut ledger = ledger();
        let mut state = StableAssetState::calibrated(1.02, float(&ledger), -20.0);
        let debt = ledger.total_debt();

        let outcome = stabilizer.stabilize(&mut state, &mut ledger, 0.0);
        assert!(outcome.issued > 0.0);
        assert!(outcome.issuance_fee > 0.0);
        assert!(ledger.total_debt() > debt);
        assert_relative_eq!(outcome.price_after, 1.0 + ledger.borrowing_rate(), max_relative = 1e-9);
    }

    #[test]
    fn test_shock_scales_demand_once() {
        let stabilizer = PegStabilizer::new(&PegConfig {
            liquidity_volatility: 0.0,
            liquidity_drift: 0.01,
            ..PegConfig::default()
        });
        let mut state = StableAssetState::calibrated(1.0, 1_000_000.0, -20.0);
        let before = state.liquidity_demand;

        stabilizer.shock(&mut state, &mut StdRng::seed_from_u64(1));
        assert_relative_eq!(state.liquidity_demand, before * 0.01f64.exp(), max_relative = 1e-12);

        let mut ledger = ledger();
        stabilizer.stabilize(&mut state, &mut ledger, 0.0);
        assert_relative_eq!(state.liquidity_demand, before * 0.01f64.exp(), max_relative = 1e-12);
    }

    #[test]
    fn test_float_elsewhere_moves_price() {
        let stabilizer = quiet_stabilizer();
        let ledger = ledger();
        let state = StableAssetState::calibrated(1.0, float(&ledger), -20.0);
        let alone = stabilizer.clearing_price(float(&ledger), state.liquidity_demand);
        let shared = stabilizer.clearing_price(float(&ledger) + 50_000.0, state.liquidity_demand);
        assert!(shared < alone);
    }
}
