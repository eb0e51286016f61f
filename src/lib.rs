//! Multi-Collateral Stablecoin Simulation Library
//!
//! Monte-Carlo simulation of an over-collateralised stablecoin with several
//! collateral markets sharing one stable asset: troves, liquidations,
//! stability pools, redemption arbitrage and a governance token.
//!
//! ## Modules
//!
//! - `price`: exogenous collateral price paths
//! - `population`: participants and their risk profiles
//! - `ledger` / `memory_ledger`: transactional protocol boundary and its
//!   in-process implementation
//! - `lifecycle`: open, adjust and close decisions
//! - `liquidation`: per-iteration liquidation rounds
//! - `stability`: stability pool settlement and depositor behaviour
//! - `peg`: stable-asset price and redemption arbitrage
//! - `governance`: governance-token price process
//! - `state_log` / `output`: market snapshots, CSV table, JSON summary
//! - `market` / `driver`: per-market state and the iteration loop
//! - `monte_carlo`: batch runs over seeds with tail-risk metrics
//!
//! ## Usage
//!
//! ```bash
//! # One run, CSV table and JSON summary
//! cargo run --bin simulate --release -- --config scenarios/baseline.toml --summary summary.json
//!
//! # Seed batch with peg tail-risk metrics
//! cargo run --bin monte_carlo --release -- --runs 100
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod governance;
pub mod ledger;
pub mod lifecycle;
pub mod liquidation;
pub mod market;
pub mod memory_ledger;
pub mod monte_carlo;
pub mod output;
pub mod peg;
pub mod population;
pub mod price;
pub mod stability;
pub mod state_log;
