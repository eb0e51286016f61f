//! Read-only view of a market's aggregate ledger state.

use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: f64,
    pub trove_count: usize,
    pub total_collateral: f64,
    pub total_debt: f64,
    pub tcr: f64,
    pub recovery_mode: bool,
    pub last_icr: Option<f64>,
    pub pool_stable: f64,
    pub pool_collateral: f64,
}

impl MarketSnapshot {
    pub fn read<L: Ledger>(ledger: &L) -> Self {
        Self {
            price: ledger.price(),
            trove_count: ledger.trove_count(),
            total_collateral: ledger.total_collateral(),
            total_debt: ledger.total_debt(),
            tcr: ledger.tcr(),
            recovery_mode: ledger.recovery_mode(),
            last_icr: ledger.last_icr(),
            pool_stable: ledger.pool_stable(),
            pool_collateral: ledger.pool_collateral(),
        }
    }
}

impl std::fmt::Display for MarketSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "price={:.2} troves={} coll={:.4} debt={:.2} tcr={:.4} recovery={} pool={:.2}/{:.4}",
            self.price,
            self.trove_count,
            self.total_collateral,
            self.total_debt,
            self.tcr,
            self.recovery_mode,
            self.pool_stable,
            self.pool_collateral
        )
    }
}
