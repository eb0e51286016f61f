//! Error taxonomy for the simulation.
//!
//! Ledger reverts are recoverable and handled where they occur; everything in
//! [`SimulationError`] aborts the run.

use thiserror::Error;

use crate::population::ParticipantId;

/// Reasons a ledger transaction reverts. A reverted call leaves no trace.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("no open trove for participant {0}")]
    UnknownTrove(ParticipantId),

    #[error("participant {0} already has an open trove")]
    TroveAlreadyOpen(ParticipantId),

    #[error("insufficient collateral balance: need {needed:.6}, have {available:.6}")]
    InsufficientCollateralBalance { needed: f64, available: f64 },

    #[error("insufficient stable balance: need {needed:.6}, have {available:.6}")]
    InsufficientStableBalance { needed: f64, available: f64 },

    #[error("net debt {net_debt:.2} below minimum {minimum:.2}")]
    BelowMinimumDebt { net_debt: f64, minimum: f64 },

    #[error("collateral ratio {ratio:.4} below required {required:.4}")]
    BelowMinimumCollateralRatio { ratio: f64, required: f64 },

    #[error("operation not permitted in recovery mode")]
    RecoveryModeRestriction,

    #[error("total collateral ratio {tcr:.4} would fall below the critical ratio")]
    TcrBelowCritical { tcr: f64 },

    #[error("the last trove in the system cannot be removed")]
    LastTrove,

    #[error("nothing to liquidate")]
    NothingToLiquidate,

    #[error("nothing to redeem")]
    NothingToRedeem,

    #[error("withdrawal blocked while troves are below the minimum collateral ratio")]
    UndercollateralizedTroves,

    #[error("participant {0} has no stability pool deposit")]
    NoPoolDeposit(ParticipantId),

    #[error("invalid amount {0}")]
    InvalidAmount(f64),

    #[error("invalid oracle price {0}")]
    InvalidPrice(f64),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Configuration problems detected before a run starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal simulation failures.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("price series for {market} exhausted: index {index} >= length {len}")]
    PriceSeriesExhausted {
        market: String,
        index: usize,
        len: usize,
    },

    #[error("invariant violated at iteration {iteration}: {detail} ({snapshot})")]
    InvariantViolation {
        iteration: usize,
        detail: String,
        snapshot: String,
    },

    #[error("setup transaction reverted for {market}: {source}")]
    Setup {
        market: String,
        #[source]
        source: LedgerError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimulationError>;
