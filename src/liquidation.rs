//! Liquidation coordination for one market.
//!
//! Eligibility is decided by the ledger. The coordinator calls the batch
//! entry point once per iteration and turns the outcome into the gains seen
//! by stability pool depositors.
//!
//! ## Gains
//! - Liquidation gain: collateral value credited to the pool minus the stable
//!   asset burned from deposits, at the current prices.
//! - Airdrop gain: reward tokens issued to depositors since the previous
//!   call, valued at the governance-token price.

use log::debug;

use crate::error::LedgerError;
use crate::ledger::{Ledger, LiquidationOutcome};
use crate::population::ParticipantId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiquidationReport {
    pub liquidated: Vec<ParticipantId>,
    pub collateral_liquidated: f64,
    pub debt_offset: f64,
    pub collateral_to_pool: f64,
    pub liquidation_gain: f64,
    pub airdrop_gain: f64,
    /// Stability pool deposits before the liquidation.
    pub pool_before: f64,
}

impl LiquidationReport {
    pub fn is_empty(&self) -> bool {
        self.liquidated.is_empty()
    }

    pub fn total_gain(&self) -> f64 {
        self.liquidation_gain + self.airdrop_gain
    }
}

#[derive(Debug, Clone)]
pub struct LiquidationCoordinator {
    batch_size: usize,
    liquidator: ParticipantId,
    rewards_seen: f64,
}

impl LiquidationCoordinator {
    pub fn new(batch_size: usize, liquidator: ParticipantId) -> Self {
        Self {
            batch_size,
            liquidator,
            rewards_seen: 0.0,
        }
    }

    /// Runs one liquidation round. A round with nothing eligible is a no-op.
    pub fn liquidate<L: Ledger>(
        &mut self,
        ledger: &mut L,
        stable_price: f64,
        governance_price: f64,
    ) -> LiquidationReport {
        let pool_before = ledger.pool_stable();

        let issued = ledger.reward_issued();
        let airdrop_gain = (issued - self.rewards_seen).max(0.0) * governance_price;
        self.rewards_seen = issued;

        let outcome = match ledger.liquidate_eligible(self.liquidator, self.batch_size) {
            Ok(outcome) => outcome,
            Err(LedgerError::NothingToLiquidate) => LiquidationOutcome::default(),
            Err(err) => {
                debug!("liquidation reverted: {err}");
                LiquidationOutcome::default()
            }
        };

        if !outcome.liquidated.is_empty() {
            debug!(
                "liquidated {} troves, {:.4} collateral, {:.2} debt offset",
                outcome.liquidated.len(),
                outcome.collateral_liquidated,
                outcome.debt_offset
            );
        }

        let liquidation_gain =
            outcome.collateral_to_pool * ledger.price() - outcome.debt_offset * stable_price;

        LiquidationReport {
            liquidated: outcome.liquidated,
            collateral_liquidated: outcome.collateral_liquidated,
            debt_offset: outcome.debt_offset,
            collateral_to_pool: outcome.collateral_to_pool,
            liquidation_gain,
            airdrop_gain,
            pool_before,
        }
    }
}
