//! In-process ledger for one collateral market.
//!
//! Tracks troves, the stability pool, market-scoped wallets and the fee base
//! rate. Each mutating call validates everything up front and only then
//! applies its effects, so a revert never leaves partial state behind.
//!
//! ## Liquidation modes
//! - Normal mode (TCR >= CCR): troves under MCR are offset against the pool,
//!   any remainder is redistributed to the other troves by collateral.
//! - Recovery mode: ICR <= 100% redistributes, ICR < MCR offsets and
//!   redistributes, MCR <= ICR < TCR is offset only when the pool covers the
//!   whole debt, with collateral capped at `debt * MCR / price`.

use std::collections::BTreeMap;

use crate::config::ProtocolConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{
    DepositorGains, Ledger, LiquidationOutcome, PoolReceipt, RedemptionOutcome, Trove, TroveReceipt,
};
use crate::population::ParticipantId;

const EPS: f64 = 1e-9;

#[derive(Clone, Copy, Debug, Default)]
struct Deposit {
    amount: f64,
    collateral_gain: f64,
    reward_gain: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum LiquidationMode {
    Redistribute,
    OffsetAndRedistribute,
    CappedOffset,
}

#[derive(Clone, Debug)]
pub struct InMemoryLedger {
    params: ProtocolConfig,
    price: f64,
    troves: BTreeMap<ParticipantId, Trove>,
    collateral_wallets: BTreeMap<ParticipantId, f64>,
    stable_wallets: BTreeMap<ParticipantId, f64>,
    reward_wallets: BTreeMap<ParticipantId, f64>,
    deposits: BTreeMap<ParticipantId, Deposit>,
    gas_pool: f64,
    fee_pool_stable: f64,
    fee_pool_collateral: f64,
    supply: f64,
    base_rate: f64,
    hours_elapsed: f64,
    reward_issued: f64,
}

impl InMemoryLedger {
    pub fn new(params: ProtocolConfig, price: f64) -> Self {
        Self {
            params,
            price,
            troves: BTreeMap::new(),
            collateral_wallets: BTreeMap::new(),
            stable_wallets: BTreeMap::new(),
            reward_wallets: BTreeMap::new(),
            deposits: BTreeMap::new(),
            gas_pool: 0.0,
            fee_pool_stable: 0.0,
            fee_pool_collateral: 0.0,
            supply: 0.0,
            base_rate: 0.0,
            hours_elapsed: 0.0,
            reward_issued: 0.0,
        }
    }

    /// Provisions collateral tokens into a participant's wallet.
    pub fn credit_collateral(&mut self, owner: ParticipantId, amount: f64) {
        *self.collateral_wallets.entry(owner).or_insert(0.0) += amount;
    }

    pub fn base_rate(&self) -> f64 {
        self.base_rate
    }

    pub fn fees_collected(&self) -> (f64, f64) {
        (self.fee_pool_stable, self.fee_pool_collateral)
    }

    pub fn reward_balance(&self, owner: ParticipantId) -> f64 {
        self.reward_wallets.get(&owner).copied().unwrap_or(0.0)
    }

    fn troves_by_icr(&self) -> Vec<(ParticipantId, Trove)> {
        let mut sorted: Vec<(ParticipantId, Trove)> = self.troves.iter().map(|(id, t)| (*id, *t)).collect();
        sorted.sort_by(|a, b| {
            a.1.collateral_ratio(self.price)
                .total_cmp(&b.1.collateral_ratio(self.price))
                .then(a.0.cmp(&b.0))
        });
        sorted
    }

    fn tcr_after(&self, collateral_change: f64, debt_change: f64) -> f64 {
        let debt = self.total_debt() + debt_change;
        if debt <= 0.0 {
            return f64::INFINITY;
        }
        (self.total_collateral() + collateral_change) * self.price / debt
    }

    fn require_amount(amount: f64) -> LedgerResult<()> {
        if amount.is_finite() && amount > 0.0 {
            Ok(())
        } else {
            Err(LedgerError::InvalidAmount(amount))
        }
    }

    fn require_stable(&self, owner: ParticipantId, needed: f64) -> LedgerResult<()> {
        let available = self.stable_balance(owner);
        if available + EPS < needed {
            return Err(LedgerError::InsufficientStableBalance { needed, available });
        }
        Ok(())
    }

    fn require_collateral(&self, owner: ParticipantId, needed: f64) -> LedgerResult<()> {
        let available = self.collateral_balance(owner);
        if available + EPS < needed {
            return Err(LedgerError::InsufficientCollateralBalance { needed, available });
        }
        Ok(())
    }

    fn add_stable(&mut self, owner: ParticipantId, amount: f64) {
        let balance = self.stable_wallets.entry(owner).or_insert(0.0);
        *balance = (*balance + amount).max(0.0);
    }

    fn add_collateral(&mut self, owner: ParticipantId, amount: f64) {
        let balance = self.collateral_wallets.entry(owner).or_insert(0.0);
        *balance = (*balance + amount).max(0.0);
    }

    fn pay_out_gains(&mut self, depositor: ParticipantId) -> (f64, f64) {
        let Some(deposit) = self.deposits.get_mut(&depositor) else {
            return (0.0, 0.0);
        };
        let gains = (deposit.collateral_gain, deposit.reward_gain);
        deposit.collateral_gain = 0.0;
        deposit.reward_gain = 0.0;
        self.add_collateral(depositor, gains.0);
        *self.reward_wallets.entry(depositor).or_insert(0.0) += gains.1;
        gains
    }

    fn offset_against_pool(&mut self, debt: f64, collateral: f64) {
        let total = self.pool_stable();
        if debt <= 0.0 || total <= 0.0 {
            return;
        }
        let consumed = (debt / total).min(1.0);
        for deposit in self.deposits.values_mut() {
            let share = deposit.amount / total;
            deposit.collateral_gain += collateral * share;
            deposit.amount *= 1.0 - consumed;
            if deposit.amount < EPS {
                deposit.amount = 0.0;
            }
        }
        self.supply -= debt;
    }

    fn redistribute(&mut self, debt: f64, collateral: f64) {
        if debt <= 0.0 && collateral <= 0.0 {
            return;
        }
        let total = self.total_collateral();
        if total <= 0.0 {
            return;
        }
        for trove in self.troves.values_mut() {
            let share = trove.collateral / total;
            trove.collateral += collateral * share;
            trove.debt += debt * share;
        }
    }

    fn liquidate_one(
        &mut self,
        owner: ParticipantId,
        mode: LiquidationMode,
        liquidator: ParticipantId,
        outcome: &mut LiquidationOutcome,
    ) {
        let Some(trove) = self.troves.remove(&owner) else {
            return;
        };
        let gas = self.params.gas_compensation.min(trove.debt);

        let (liquidated_collateral, surplus) = match mode {
            LiquidationMode::CappedOffset => {
                let capped = (trove.debt * self.params.mcr / self.price).min(trove.collateral);
                (capped, trove.collateral - capped)
            }
            _ => (trove.collateral, 0.0),
        };
        let compensation = liquidated_collateral * self.params.liquidation_collateral_compensation;
        let collateral_left = liquidated_collateral - compensation;

        let offset = match mode {
            LiquidationMode::Redistribute => 0.0,
            LiquidationMode::OffsetAndRedistribute => trove.debt.min(self.pool_stable()),
            LiquidationMode::CappedOffset => trove.debt,
        };
        let collateral_to_pool = collateral_left * (offset / trove.debt);
        let debt_redistributed = trove.debt - offset;
        let collateral_redistributed = collateral_left - collateral_to_pool;

        self.offset_against_pool(offset, collateral_to_pool);
        self.redistribute(debt_redistributed, collateral_redistributed);

        self.add_collateral(owner, surplus);
        self.add_collateral(liquidator, compensation);
        self.gas_pool -= gas;
        self.add_stable(liquidator, gas);

        outcome.liquidated.push(owner);
        outcome.collateral_liquidated += liquidated_collateral;
        outcome.debt_liquidated += trove.debt;
        outcome.debt_offset += offset;
        outcome.collateral_to_pool += collateral_to_pool;
        outcome.debt_redistributed += debt_redistributed;
        outcome.collateral_redistributed += collateral_redistributed;
        outcome.collateral_surplus += surplus;
        outcome.collateral_compensation += compensation;
        outcome.gas_compensation += gas;
    }

    fn any_undercollateralized(&self) -> bool {
        self.last_icr().is_some_and(|icr| icr < self.params.mcr)
    }
}

impl Ledger for InMemoryLedger {
    fn params(&self) -> &ProtocolConfig {
        &self.params
    }

    fn set_oracle_price(&mut self, price: f64) -> LedgerResult<()> {
        if !(price.is_finite() && price > 0.0) {
            return Err(LedgerError::InvalidPrice(price));
        }
        self.price = price;
        Ok(())
    }

    fn advance_clock(&mut self, hours: f64) {
        if hours <= 0.0 {
            return;
        }
        self.base_rate *= 0.5_f64.powf(hours / self.params.base_rate_half_life_hours);

        let issued_by = |t: f64| {
            self.params.reward_supply * (1.0 - 0.5_f64.powf(t / self.params.reward_half_life_hours))
        };
        let issuance = issued_by(self.hours_elapsed + hours) - issued_by(self.hours_elapsed);
        self.hours_elapsed += hours;

        let total = self.pool_stable();
        if issuance > 0.0 && total > 0.0 {
            for deposit in self.deposits.values_mut() {
                deposit.reward_gain += issuance * deposit.amount / total;
            }
            self.reward_issued += issuance;
        }
    }

    fn open_position(
        &mut self,
        owner: ParticipantId,
        collateral: f64,
        net_debt: f64,
    ) -> LedgerResult<TroveReceipt> {
        Self::require_amount(collateral)?;
        Self::require_amount(net_debt)?;
        if self.troves.contains_key(&owner) {
            return Err(LedgerError::TroveAlreadyOpen(owner));
        }
        if net_debt < self.params.min_net_debt {
            return Err(LedgerError::BelowMinimumDebt {
                net_debt,
                minimum: self.params.min_net_debt,
            });
        }
        self.require_collateral(owner, collateral)?;

        let recovery = self.recovery_mode();
        let fee = if recovery { 0.0 } else { self.borrowing_rate() * net_debt };
        let debt = net_debt + fee + self.params.gas_compensation;
        let icr = collateral * self.price / debt;
        let required = if recovery { self.params.ccr } else { self.params.mcr };
        if icr < required {
            return Err(LedgerError::BelowMinimumCollateralRatio { ratio: icr, required });
        }
        if !recovery {
            let tcr = self.tcr_after(collateral, debt);
            if tcr < self.params.ccr {
                return Err(LedgerError::TcrBelowCritical { tcr });
            }
        }

        self.add_collateral(owner, -collateral);
        self.troves.insert(owner, Trove { collateral, debt });
        self.add_stable(owner, net_debt);
        self.gas_pool += self.params.gas_compensation;
        self.fee_pool_stable += fee;
        self.supply += debt;

        Ok(TroveReceipt {
            collateral_change: collateral,
            debt_change: debt,
            fee,
        })
    }

    fn close_position(&mut self, owner: ParticipantId) -> LedgerResult<TroveReceipt> {
        let trove = self.trove(owner).ok_or(LedgerError::UnknownTrove(owner))?;
        if self.recovery_mode() {
            return Err(LedgerError::RecoveryModeRestriction);
        }
        if self.troves.len() <= 1 {
            return Err(LedgerError::LastTrove);
        }
        let gas = self.params.gas_compensation.min(trove.debt);
        let repayment = trove.debt - gas;
        self.require_stable(owner, repayment)?;

        self.add_stable(owner, -repayment);
        self.gas_pool -= gas;
        self.supply -= trove.debt;
        self.add_collateral(owner, trove.collateral);
        self.troves.remove(&owner);

        Ok(TroveReceipt {
            collateral_change: -trove.collateral,
            debt_change: -trove.debt,
            fee: 0.0,
        })
    }

    fn adjust_position(
        &mut self,
        owner: ParticipantId,
        collateral_change: f64,
        debt_change: f64,
    ) -> LedgerResult<TroveReceipt> {
        let trove = self.trove(owner).ok_or(LedgerError::UnknownTrove(owner))?;
        if !collateral_change.is_finite() || !debt_change.is_finite() {
            return Err(LedgerError::InvalidAmount(f64::NAN));
        }
        if collateral_change == 0.0 && debt_change == 0.0 {
            return Err(LedgerError::InvalidAmount(0.0));
        }

        let recovery = self.recovery_mode();
        if recovery && collateral_change < 0.0 {
            return Err(LedgerError::RecoveryModeRestriction);
        }
        let fee = if debt_change > 0.0 && !recovery {
            self.borrowing_rate() * debt_change
        } else {
            0.0
        };

        let collateral = trove.collateral + collateral_change;
        if collateral <= 0.0 {
            return Err(LedgerError::InvalidAmount(collateral_change));
        }
        let debt = trove.debt + debt_change + fee;
        let net_debt = debt - self.params.gas_compensation;
        if net_debt < self.params.min_net_debt {
            return Err(LedgerError::BelowMinimumDebt {
                net_debt,
                minimum: self.params.min_net_debt,
            });
        }
        if collateral_change > 0.0 {
            self.require_collateral(owner, collateral_change)?;
        }
        if debt_change < 0.0 {
            self.require_stable(owner, -debt_change)?;
        }

        let icr = collateral * self.price / debt;
        if recovery {
            if debt_change > 0.0 && icr < self.params.ccr {
                return Err(LedgerError::BelowMinimumCollateralRatio {
                    ratio: icr,
                    required: self.params.ccr,
                });
            }
        } else {
            if icr < self.params.mcr {
                return Err(LedgerError::BelowMinimumCollateralRatio {
                    ratio: icr,
                    required: self.params.mcr,
                });
            }
            let tcr = self.tcr_after(collateral_change, debt_change + fee);
            if tcr < self.params.ccr {
                return Err(LedgerError::TcrBelowCritical { tcr });
            }
        }

        self.add_collateral(owner, -collateral_change);
        self.add_stable(owner, debt_change);
        self.fee_pool_stable += fee;
        self.supply += debt_change + fee;
        self.troves.insert(owner, Trove { collateral, debt });

        Ok(TroveReceipt {
            collateral_change,
            debt_change: debt_change + fee,
            fee,
        })
    }

    fn liquidate_eligible(
        &mut self,
        liquidator: ParticipantId,
        batch_size: usize,
    ) -> LedgerResult<LiquidationOutcome> {
        let mut outcome = LiquidationOutcome::default();

        for _ in 0..batch_size {
            if self.troves.len() <= 1 {
                break;
            }
            let Some((owner, trove)) = self.troves_by_icr().first().copied() else {
                break;
            };
            let icr = trove.collateral_ratio(self.price);
            let tcr = self.tcr();

            let mode = if tcr >= self.params.ccr {
                if icr >= self.params.mcr {
                    break;
                }
                LiquidationMode::OffsetAndRedistribute
            } else if icr <= 1.0 {
                LiquidationMode::Redistribute
            } else if icr < self.params.mcr {
                LiquidationMode::OffsetAndRedistribute
            } else if icr < tcr && self.pool_stable() + EPS >= trove.debt {
                LiquidationMode::CappedOffset
            } else {
                break;
            };

            self.liquidate_one(owner, mode, liquidator, &mut outcome);
        }

        if outcome.liquidated.is_empty() {
            return Err(LedgerError::NothingToLiquidate);
        }
        Ok(outcome)
    }

    fn deposit_to_pool(&mut self, depositor: ParticipantId, amount: f64) -> LedgerResult<PoolReceipt> {
        Self::require_amount(amount)?;
        self.require_stable(depositor, amount)?;

        let (collateral_gain, reward_gain) = self.pay_out_gains(depositor);
        self.add_stable(depositor, -amount);
        self.deposits.entry(depositor).or_default().amount += amount;

        Ok(PoolReceipt {
            deposit_change: amount,
            collateral_gain_paid: collateral_gain,
            reward_gain_paid: reward_gain,
        })
    }

    fn withdraw_from_pool(&mut self, depositor: ParticipantId, amount: f64) -> LedgerResult<PoolReceipt> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let deposit = *self
            .deposits
            .get(&depositor)
            .ok_or(LedgerError::NoPoolDeposit(depositor))?;
        if amount > 0.0 && self.any_undercollateralized() {
            return Err(LedgerError::UndercollateralizedTroves);
        }

        let taken = amount.min(deposit.amount);
        let (collateral_gain, reward_gain) = self.pay_out_gains(depositor);
        self.add_stable(depositor, taken);

        let remaining = deposit.amount - taken;
        if remaining < EPS {
            self.deposits.remove(&depositor);
        } else if let Some(entry) = self.deposits.get_mut(&depositor) {
            entry.amount = remaining;
        }

        Ok(PoolReceipt {
            deposit_change: -taken,
            collateral_gain_paid: collateral_gain,
            reward_gain_paid: reward_gain,
        })
    }

    fn redeem(&mut self, redeemer: ParticipantId, amount: f64) -> LedgerResult<RedemptionOutcome> {
        Self::require_amount(amount)?;
        self.require_stable(redeemer, amount)?;
        let tcr = self.tcr();
        if tcr < self.params.mcr {
            return Err(LedgerError::TcrBelowCritical { tcr });
        }

        let gas = self.params.gas_compensation;
        let mut remaining = amount;
        let mut open_troves = self.troves.len();
        let mut plan: Vec<(ParticipantId, f64, bool)> = Vec::new();

        for (owner, trove) in self.troves_by_icr() {
            if remaining <= EPS {
                break;
            }
            if trove.collateral_ratio(self.price) < self.params.mcr {
                continue;
            }
            let net = trove.debt - gas;
            let redeemed = remaining.min(net);
            let left = net - redeemed;
            let full = left <= EPS;
            if full && open_troves <= 1 {
                break;
            }
            if !full && left < self.params.min_net_debt {
                break;
            }
            if full {
                open_troves -= 1;
            }
            plan.push((owner, redeemed, full));
            remaining -= redeemed;
        }

        let stable_redeemed: f64 = plan.iter().map(|(_, r, _)| r).sum();
        if stable_redeemed <= EPS {
            return Err(LedgerError::NothingToRedeem);
        }
        let fee_rate = self.redemption_rate_for(stable_redeemed);
        let supply_before = self.supply;

        let mut outcome = RedemptionOutcome {
            fee_rate,
            ..RedemptionOutcome::default()
        };
        for (owner, redeemed, full) in plan {
            let drawn = redeemed / self.price;
            outcome.collateral_drawn += drawn;
            if full {
                if let Some(trove) = self.troves.remove(&owner) {
                    self.add_collateral(owner, trove.collateral - drawn);
                    self.gas_pool -= gas;
                    self.supply -= gas;
                }
                outcome.closed.push(owner);
            } else if let Some(trove) = self.troves.get_mut(&owner) {
                trove.debt -= redeemed;
                trove.collateral -= drawn;
            }
        }

        self.supply -= stable_redeemed;
        self.add_stable(redeemer, -stable_redeemed);
        if supply_before > 0.0 {
            self.base_rate = (self.base_rate + stable_redeemed / supply_before / 2.0).min(1.0);
        }
        outcome.fee_collateral = outcome.collateral_drawn * fee_rate;
        self.fee_pool_collateral += outcome.fee_collateral;
        self.add_collateral(redeemer, outcome.collateral_drawn - outcome.fee_collateral);
        outcome.stable_redeemed = stable_redeemed;

        Ok(outcome)
    }

    fn transfer_stable(&mut self, from: ParticipantId, to: ParticipantId, amount: f64) -> LedgerResult<()> {
        Self::require_amount(amount)?;
        self.require_stable(from, amount)?;
        self.add_stable(from, -amount);
        self.add_stable(to, amount);
        Ok(())
    }

    fn price(&self) -> f64 {
        self.price
    }

    fn trove(&self, owner: ParticipantId) -> Option<Trove> {
        self.troves.get(&owner).copied()
    }

    fn trove_count(&self) -> usize {
        self.troves.len()
    }

    fn total_collateral(&self) -> f64 {
        self.troves.values().map(|t| t.collateral).sum()
    }

    fn total_debt(&self) -> f64 {
        self.troves.values().map(|t| t.debt).sum()
    }

    fn recovery_mode(&self) -> bool {
        !self.troves.is_empty() && self.tcr() < self.params.ccr
    }

    fn last_icr(&self) -> Option<f64> {
        self.troves
            .values()
            .map(|t| t.collateral_ratio(self.price))
            .min_by(|a, b| a.total_cmp(b))
    }

    fn pool_stable(&self) -> f64 {
        self.deposits.values().map(|d| d.amount).sum()
    }

    fn pool_collateral(&self) -> f64 {
        self.deposits.values().map(|d| d.collateral_gain).sum()
    }

    fn pool_deposit(&self, owner: ParticipantId) -> f64 {
        self.deposits.get(&owner).map_or(0.0, |d| d.amount)
    }

    fn pool_depositors(&self) -> Vec<ParticipantId> {
        self.deposits.keys().copied().collect()
    }

    fn depositor_gains(&self, owner: ParticipantId) -> DepositorGains {
        self.deposits.get(&owner).map_or_else(DepositorGains::default, |d| DepositorGains {
            collateral: d.collateral_gain,
            reward: d.reward_gain,
        })
    }

    fn stable_balance(&self, owner: ParticipantId) -> f64 {
        self.stable_wallets.get(&owner).copied().unwrap_or(0.0)
    }

    fn collateral_balance(&self, owner: ParticipantId) -> f64 {
        self.collateral_wallets.get(&owner).copied().unwrap_or(0.0)
    }

    fn stable_supply(&self) -> f64 {
        self.supply
    }

    fn borrowing_rate(&self) -> f64 {
        (self.params.borrowing_fee_floor + self.base_rate).min(self.params.borrowing_fee_cap)
    }

    fn redemption_rate_for(&self, amount: f64) -> f64 {
        let bump = if self.supply > 0.0 { amount / self.supply / 2.0 } else { 0.0 };
        let base_rate = (self.base_rate + bump).min(1.0);
        (self.params.redemption_fee_floor + base_rate).min(1.0)
    }

    fn reward_issued(&self) -> f64 {
        self.reward_issued
    }
}
