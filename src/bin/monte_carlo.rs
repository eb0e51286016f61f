//! Monte Carlo Stress Testing Binary
//!
//! Runs the simulation over many seeds and reports peg tail risk.
//!
//! ## Usage
//! ```bash
//! cargo run --bin monte_carlo --release -- --config scenarios/baseline.toml --runs 100
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use peg_simulation::config::SimulationConfig;
use peg_simulation::error::Result;
use peg_simulation::monte_carlo::run_monte_carlo;
use peg_simulation::price::PriceModel;

/// Seeded batch runs with tail-risk statistics
#[derive(Parser, Debug)]
#[command(name = "monte_carlo")]
#[command(version)]
struct Args {
    /// TOML configuration; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Runs per price model
    #[arg(long, default_value_t = 20)]
    runs: usize,

    /// Repeat the batch under every generated price model
    #[arg(long)]
    all_models: bool,
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };
    config.validate()?;

    println!("=======================================================");
    println!("  Monte Carlo Stress Testing");
    println!("  Peg Stability of the Multi-Collateral Stablecoin");
    println!("=======================================================");
    println!();
    println!("Parameters:");
    println!("  Runs per scenario: {}", args.runs);
    println!("  Base seed:         {}", config.run.seed);
    println!("  Participants:      {} per market", config.run.participants);
    println!();

    let models: Vec<PriceModel> = if args.all_models {
        PriceModel::all()
            .into_iter()
            .filter(|m| *m != PriceModel::Constant)
            .collect()
    } else {
        Vec::new()
    };

    if models.is_empty() {
        println!("Price models as configured");
        println!("{}", "-".repeat(50));
        run_monte_carlo(&config, args.runs)?.print();
        println!();
        return Ok(());
    }

    println!("| Model            | Median min | VaR 99% | CVaR 99% | P(failure) |");
    println!("|------------------|------------|---------|----------|------------|");
    for model in models {
        let mut model_config = config.clone();
        for market in &mut model_config.markets {
            market.price_model = model;
        }
        let result = run_monte_carlo(&model_config, args.runs)?;
        println!(
            "| {:16} | {:>10.4} | {:>7.4} | {:>8.4} | {:>9.2}% |",
            model.name(),
            result.median_min_price,
            result.var_99,
            result.cvar_99,
            result.failure_probability * 100.0
        );
    }
    println!();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("monte carlo failed: {err}");
            ExitCode::FAILURE
        }
    }
}
