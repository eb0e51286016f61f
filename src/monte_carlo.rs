//! Monte Carlo Stress Testing
//!
//! Runs the full simulation over many seeds and measures tail risk of the
//! stable-asset peg.
//!
//! ## Metrics
//! - Depeg depth `1 - min stable price` per run
//! - Value at Risk (VaR) of depeg depth at 95%, 99%
//! - Expected Shortfall (CVaR)
//! - Failure probability (runs aborted by an invariant violation)
//! - Mean redemption volume and liquidated collateral share

use log::warn;

use crate::config::SimulationConfig;
use crate::driver::Simulation;
use crate::error::{Result, SimulationError};
use crate::output::RunSummary;

#[derive(Clone, Debug, Default)]
pub struct MonteCarloResult {
    pub runs: usize,
    pub failures: usize,

    pub summaries: Vec<RunSummary>,
    pub depeg_depths: Vec<f64>,

    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,
    pub cvar_99: f64,

    pub median_min_price: f64,
    pub worst_min_price: f64,
    pub failure_probability: f64,
    pub mean_redeemed: f64,
    pub mean_liquidated_share: f64,
    pub mean_final_governance_price: f64,
}

impl MonteCarloResult {
    pub fn print(&self) {
        println!("  Runs:                    {}", self.runs);
        println!("  Failed runs:             {}", self.failures);
        println!("  Failure probability:     {:.2}%", self.failure_probability * 100.0);
        println!("  Median min peg price:    {:.4}", self.median_min_price);
        println!("  Worst min peg price:     {:.4}", self.worst_min_price);
        println!("  Depeg VaR 95%:           {:.4}", self.var_95);
        println!("  Depeg VaR 99%:           {:.4}", self.var_99);
        println!("  Depeg CVaR 95%:          {:.4}", self.cvar_95);
        println!("  Depeg CVaR 99%:          {:.4}", self.cvar_99);
        println!("  Mean redeemed:           {:.0}", self.mean_redeemed);
        println!("  Mean liquidated share:   {:.2}%", self.mean_liquidated_share * 100.0);
        println!("  Mean governance price:   {:.4}", self.mean_final_governance_price);
    }
}

pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub fn expected_shortfall(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let cutoff_idx = (((sorted.len() as f64) * p).ceil() as usize).min(sorted.len());
    let tail = &sorted[cutoff_idx..];
    if tail.is_empty() {
        return *sorted.last().unwrap_or(&0.0);
    }
    tail.iter().sum::<f64>() / tail.len() as f64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Runs `runs` simulations with seeds `config.run.seed + k`.
///
/// Only invariant violations count as failed runs; any other error is a
/// setup problem and ends the batch.
pub fn run_monte_carlo(config: &SimulationConfig, runs: usize) -> Result<MonteCarloResult> {
    let mut summaries = Vec::with_capacity(runs);
    let mut failures = 0;

    for k in 0..runs {
        let mut run_config = config.clone();
        run_config.run.seed = config.run.seed.wrapping_add(k as u64);
        let outcome = Simulation::from_config(&run_config).and_then(|mut sim| sim.run());
        match outcome {
            Ok(summary) => summaries.push(summary),
            Err(err @ SimulationError::InvariantViolation { .. }) => {
                warn!("run with seed {} aborted: {err}", run_config.run.seed);
                failures += 1;
            }
            Err(err) => return Err(err),
        }
    }

    let mut depeg_depths: Vec<f64> = summaries.iter().map(|s| 1.0 - s.min_stable_price).collect();
    depeg_depths.sort_by(|a, b| a.total_cmp(b));
    let mut min_prices: Vec<f64> = summaries.iter().map(|s| s.min_stable_price).collect();
    min_prices.sort_by(|a, b| a.total_cmp(b));

    Ok(MonteCarloResult {
        runs,
        failures,
        var_95: percentile(&depeg_depths, 0.95),
        var_99: percentile(&depeg_depths, 0.99),
        cvar_95: expected_shortfall(&depeg_depths, 0.95),
        cvar_99: expected_shortfall(&depeg_depths, 0.99),
        median_min_price: percentile(&min_prices, 0.5),
        worst_min_price: min_prices.first().copied().unwrap_or(0.0),
        failure_probability: if runs > 0 { failures as f64 / runs as f64 } else { 0.0 },
        mean_redeemed: mean(summaries.iter().map(|s| s.total_redeemed)),
        mean_liquidated_share: mean(
            summaries
                .iter()
                .flat_map(|s| s.markets.iter().map(|m| m.liquidated_share)),
        ),
        mean_final_governance_price: mean(summaries.iter().map(|s| s.final_governance_price)),
        depeg_depths,
        summaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monte_carlo_runs() {
        let mut config = SimulationConfig::default();
        config.run.samples = 24 * 8;
        config.run.participants = 20;

        let result = run_monte_carlo(&config, 3).unwrap();

        assert_eq!(result.runs, 3);
        assert_eq!(result.summaries.len() + result.failures, 3);
        assert_eq!(result.depeg_depths.len(), result.summaries.len());
        let seeds: Vec<u64> = result.summaries.iter().map(|s| s.seed).collect();
        assert!(seeds.windows(2).all(|w| w[0] < w[1]));
    }

    fn single_market_from_csv(dir: &std::path::Path, prices: &[f64], samples: usize) -> SimulationConfig {
        let path = dir.join("eth.csv");
        let mut text = String::from("ETH\n");
        for price in prices {
            text.push_str(&format!("{price}\n"));
        }
        std::fs::write(&path, text).unwrap();

        let mut config = SimulationConfig::default();
        config.run.samples = samples;
        config.run.participants = 10;
        config.markets.truncate(1);
        config.markets[0].price_file = Some(path);
        config
    }

    #[test]
    fn test_short_price_file_is_an_error_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = single_market_from_csv(dir.path(), &[2000.0; 30], 120);

        let result = run_monte_carlo(&config, 4);
        assert!(matches!(result, Err(SimulationError::PriceSeriesExhausted { len: 30, .. })));
    }

    #[test]
    fn test_invariant_violation_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut prices = vec![2000.0; 120];
        prices[48] = 0.0;
        let config = single_market_from_csv(dir.path(), &prices, 120);

        let result = run_monte_carlo(&config, 3).unwrap();
        assert_eq!(result.failures, 3);
        assert!(result.summaries.is_empty());
        assert_eq!(result.failure_probability, 1.0);
    }

    #[test]
    fn test_var_calculation() {
        let data: Vec<f64> = (0..100).map(|i| i as f64 * 100.0).collect();
        let mut sorted = data.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let var_95 = percentile(&sorted, 0.95);
        assert!(var_95 >= 9000.0 && var_95 <= 9600.0);
        let es_95 = expected_shortfall(&sorted, 0.95);
        assert!(es_95 >= var_95);
    }

    #[test]
    fn test_empty_batch_is_zero() {
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(expected_shortfall(&[], 0.99), 0.0);
    }
}
