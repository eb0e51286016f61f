//! Transactional boundary between the simulation and the protocol.
//!
//! Every mutating call is all-or-nothing: it either applies in full and
//! returns a receipt, or reverts with a [`LedgerError`] and changes nothing.

use crate::config::ProtocolConfig;
use crate::error::LedgerResult;
use crate::population::ParticipantId;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trove {
    pub collateral: f64,
    /// Composite debt, including the gas compensation reserve.
    pub debt: f64,
}

impl Trove {
    pub fn collateral_ratio(&self, price: f64) -> f64 {
        if self.debt == 0.0 {
            return f64::INFINITY;
        }
        (self.collateral * price) / self.debt
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TroveReceipt {
    /// Collateral moved into (+) or out of (-) the trove.
    pub collateral_change: f64,
    /// Composite debt added (+) or repaid (-).
    pub debt_change: f64,
    /// Borrowing fee charged, in stable units.
    pub fee: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiquidationOutcome {
    pub liquidated: Vec<ParticipantId>,
    /// Collateral removed from liquidated troves, compensation included.
    pub collateral_liquidated: f64,
    pub debt_liquidated: f64,
    pub debt_offset: f64,
    pub collateral_to_pool: f64,
    pub debt_redistributed: f64,
    pub collateral_redistributed: f64,
    /// Collateral above the capped liquidation amount returned to owners.
    pub collateral_surplus: f64,
    pub collateral_compensation: f64,
    pub gas_compensation: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolReceipt {
    pub deposit_change: f64,
    pub collateral_gain_paid: f64,
    pub reward_gain_paid: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepositorGains {
    pub collateral: f64,
    pub reward: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RedemptionOutcome {
    pub stable_redeemed: f64,
    pub collateral_drawn: f64,
    /// Redemption fee, taken in collateral.
    pub fee_collateral: f64,
    pub fee_rate: f64,
    /// Troves whose debt was fully redeemed and which were closed.
    pub closed: Vec<ParticipantId>,
}

/// Capability interface of one collateral market's ledger.
pub trait Ledger {
    fn params(&self) -> &ProtocolConfig;

    fn set_oracle_price(&mut self, price: f64) -> LedgerResult<()>;

    /// Advances protocol time: base-rate decay and reward issuance.
    fn advance_clock(&mut self, hours: f64);

    fn open_position(
        &mut self,
        owner: ParticipantId,
        collateral: f64,
        net_debt: f64,
    ) -> LedgerResult<TroveReceipt>;

    fn close_position(&mut self, owner: ParticipantId) -> LedgerResult<TroveReceipt>;

    fn adjust_position(
        &mut self,
        owner: ParticipantId,
        collateral_change: f64,
        debt_change: f64,
    ) -> LedgerResult<TroveReceipt>;

    fn liquidate_eligible(
        &mut self,
        liquidator: ParticipantId,
        batch_size: usize,
    ) -> LedgerResult<LiquidationOutcome>;

    fn deposit_to_pool(&mut self, depositor: ParticipantId, amount: f64) -> LedgerResult<PoolReceipt>;

    fn withdraw_from_pool(&mut self, depositor: ParticipantId, amount: f64) -> LedgerResult<PoolReceipt>;

    fn redeem(&mut self, redeemer: ParticipantId, amount: f64) -> LedgerResult<RedemptionOutcome>;

    fn transfer_stable(&mut self, from: ParticipantId, to: ParticipantId, amount: f64) -> LedgerResult<()>;

    fn price(&self) -> f64;
    fn trove(&self, owner: ParticipantId) -> Option<Trove>;
    fn trove_count(&self) -> usize;
    fn total_collateral(&self) -> f64;
    fn total_debt(&self) -> f64;
    fn recovery_mode(&self) -> bool;
    /// Collateral ratio of the riskiest trove, if any.
    fn last_icr(&self) -> Option<f64>;
    fn pool_stable(&self) -> f64;
    fn pool_collateral(&self) -> f64;
    fn pool_deposit(&self, owner: ParticipantId) -> f64;
    fn pool_depositors(&self) -> Vec<ParticipantId>;
    fn depositor_gains(&self, owner: ParticipantId) -> DepositorGains;
    fn stable_balance(&self, owner: ParticipantId) -> f64;
    fn collateral_balance(&self, owner: ParticipantId) -> f64;
    fn stable_supply(&self) -> f64;
    fn borrowing_rate(&self) -> f64;
    /// Fee rate a redemption of `amount` would pay, its own base-rate bump included.
    fn redemption_rate_for(&self, amount: f64) -> f64;
    /// Reward tokens issued to depositors since the ledger was created.
    fn reward_issued(&self) -> f64;

    fn current_icr(&self, owner: ParticipantId) -> Option<f64> {
        self.trove(owner).map(|t| t.collateral_ratio(self.price()))
    }

    fn tcr(&self) -> f64 {
        let debt = self.total_debt();
        if debt == 0.0 {
            return f64::INFINITY;
        }
        self.total_collateral() * self.price() / debt
    }
}
