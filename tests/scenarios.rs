//! End-to-end scenarios over the public API.

use std::fs;

use approx::assert_relative_eq;
use tempfile::tempdir;

use peg_simulation::config::{ProtocolConfig, SimulationConfig};
use peg_simulation::driver::Simulation;
use peg_simulation::error::SimulationError;
use peg_simulation::ledger::Ledger;
use peg_simulation::liquidation::LiquidationCoordinator;
use peg_simulation::memory_ledger::InMemoryLedger;
use peg_simulation::output::{header, CsvLogger};
use peg_simulation::population::ParticipantId;
use peg_simulation::price::PriceModel;

fn small_config(iterations: usize) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.run.samples = config.run.stride * (iterations + 1);
    config.run.participants = 40;
    config
}

#[test]
fn test_crash_liquidates_leveraged_trove() {
    let _ = env_logger::try_init();

    let mut ledger = InMemoryLedger::new(ProtocolConfig::default(), 2000.0);
    ledger.credit_collateral(ParticipantId::WHALE, 100_000.0);
    ledger.credit_collateral(ParticipantId(1), 10.0);
    ledger
        .open_position(ParticipantId::WHALE, 10_000.0, 1_000_000.0)
        .unwrap();
    ledger.deposit_to_pool(ParticipantId::WHALE, 500_000.0).unwrap();
    ledger.open_position(ParticipantId(1), 10.0, 6_000.0).unwrap();
    assert!(ledger.current_icr(ParticipantId(1)).unwrap() > 3.0);

    ledger.set_oracle_price(600.0).unwrap();
    let mut coordinator = LiquidationCoordinator::new(100, ParticipantId::WHALE);
    let report = coordinator.liquidate(&mut ledger, 1.0, 0.4);

    assert_eq!(report.liquidated, vec![ParticipantId(1)]);
    assert!(report.collateral_liquidated > 0.0);
    assert!(report.collateral_to_pool > 0.0);
    // At 600 the seized collateral is worth less than the debt it cancels.
    let expected_gain = report.collateral_to_pool * 600.0 - report.debt_offset;
    assert_relative_eq!(report.liquidation_gain, expected_gain, max_relative = 1e-12);
    assert!(report.liquidation_gain < 0.0);
    assert_relative_eq!(ledger.pool_collateral(), report.collateral_to_pool, max_relative = 1e-12);
    assert!(ledger.pool_collateral() > 0.0);
    assert!(ledger.trove(ParticipantId(1)).is_none());
    assert!(ledger.trove(ParticipantId::WHALE).is_some());

    // Nothing left below MCR, so a second round changes nothing.
    let supply = ledger.stable_supply();
    let again = coordinator.liquidate(&mut ledger, 1.0, 0.4);
    assert!(again.liquidated.is_empty());
    assert_eq!(again.collateral_liquidated, 0.0);
    assert_eq!(ledger.stable_supply(), supply);
}

#[test]
fn test_flat_prices_without_openings() {
    let _ = env_logger::try_init();

    let mut config = small_config(100);
    config.lifecycle.open_probability = 0.0;
    for market in &mut config.markets {
        market.price_model = PriceModel::Constant;
    }

    let mut sim = Simulation::from_config(&config).unwrap();
    let mut troves: Vec<usize> = sim.markets().iter().map(|m| m.ledger().trove_count()).collect();
    let indices: Vec<usize> = config.run.iteration_indices().collect();
    assert_eq!(indices.len(), 100);

    for index in indices {
        let report = sim.step(index).unwrap();
        for (i, market) in sim.markets().iter().enumerate() {
            let count = market.ledger().trove_count();
            assert!(count <= troves[i], "{} grew from {} to {count}", market.name(), troves[i]);
            troves[i] = count;
        }
        assert!((report.record.stable_price - 1.0).abs() < 0.02);
    }
}

#[test]
fn test_markets_share_one_stable_price() {
    let config = small_config(10);
    let mut sim = Simulation::from_config(&config).unwrap();

    for index in config.run.iteration_indices() {
        let report = sim.step(index).unwrap();
        assert_eq!(report.markets.len(), 2);
        assert_eq!(report.record.stable_price, report.markets[1].peg.price_after);
        assert_eq!(sim.stable_state().price, report.record.stable_price);
    }
}

#[test]
fn test_redemption_in_first_market_reaches_second() {
    let _ = env_logger::try_init();

    let mut config = small_config(3);
    config.peg.initial_price = 0.9;
    config.peg.liquidity_volatility = 0.0;
    config.lifecycle.open_probability = 0.0;

    let mut sim = Simulation::from_config(&config).unwrap();
    let report = sim.step(config.run.stride).unwrap();
    let (first, second) = (&report.markets[0].peg, &report.markets[1].peg);

    assert!(first.price_before < 0.95);
    assert!(first.redeemed > 0.0);
    assert!(first.price_after > first.price_before);
    assert_eq!(second.price_before, first.price_after);
    assert_ne!(second.price_before, first.price_before);
    assert!(report.record.total_redeemed >= first.redeemed);
}

#[test]
fn test_invariants_hold_through_volatile_run() {
    let _ = env_logger::try_init();

    let mut config = small_config(60);
    config.lifecycle.open_probability = 0.3;
    for market in &mut config.markets {
        market.price_model = PriceModel::JumpDiffusion;
        market.volatility = 0.01;
        market.jump_intensity = 0.005;
        market.jump_mean = -0.1;
    }

    let mut sim = Simulation::from_config(&config).unwrap();
    let mut redeemed = 0.0;
    for index in config.run.iteration_indices() {
        let report = sim.step(index).unwrap();
        assert!(report.record.stable_price > 0.0);
        assert!(report.record.governance_price > 0.0);
        assert!(report.record.total_redeemed >= redeemed);
        redeemed = report.record.total_redeemed;

        for market in sim.markets() {
            assert!(market.collateral_added() >= market.collateral_liquidated());
            assert!(market.population().is_partition_of(config.run.participants));
            for id in market.population().active_ids() {
                assert!(market.ledger().trove(id).is_some(), "{id} active without trove");
            }
            assert!(market.ledger().total_collateral() >= 0.0);
        }
    }

    let summary = sim.summary();
    for market in &summary.markets {
        assert!(market.liquidated_share >= 0.0 && market.liquidated_share <= 1.0);
    }
}

#[test]
fn test_crash_into_recovery_mode_keeps_peg_positive() {
    let _ = env_logger::try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.csv");

    let samples = 24 * 41;
    let mut text = String::from("ETH\n");
    for i in 0..samples {
        let price = if i < 480 { 2000.0 } else { 380.0 };
        text.push_str(&format!("{price}\n"));
    }
    fs::write(&path, text).unwrap();

    let mut config = small_config(40);
    config.run.participants = 100;
    config.lifecycle.open_probability = 0.3;
    config.markets.truncate(1);
    config.markets[0].price_file = Some(path);

    let mut sim = Simulation::from_config(&config).unwrap();
    let mut entered_recovery = None;
    let mut aborted_at = None;
    let mut liquidated_after_crash = 0;

    for index in config.run.iteration_indices() {
        let report = match sim.step(index) {
            Ok(report) => report,
            Err(SimulationError::InvariantViolation { iteration, .. }) => {
                aborted_at = Some(iteration);
                break;
            }
            Err(err) => panic!("unexpected error at {index}: {err}"),
        };

        assert!(report.record.stable_price > 0.0);
        let row = &report.record.markets[0];
        if row.snapshot.recovery_mode && entered_recovery.is_none() {
            entered_recovery = Some(index);
        }
        if index >= 480 {
            liquidated_after_crash += report.markets[0].liquidation.liquidated.len();
        }

        let market = &sim.markets()[0];
        assert!(market.collateral_added() >= market.collateral_liquidated());
        assert!(market.population().is_partition_of(config.run.participants));
    }

    // Either the run survives the crash in recovery mode or it stops loudly
    // at an iteration after the crash.
    match aborted_at {
        Some(iteration) => assert!(iteration >= 480, "aborted at {iteration} before the crash"),
        None => {
            assert_eq!(entered_recovery, Some(480));
            assert!(liquidated_after_crash > 0);
        }
    }
}

#[test]
fn test_csv_table_matches_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("simulation.csv");
    let config = small_config(12);

    let mut sim = Simulation::from_config(&config).unwrap();
    let names = sim.market_names();
    let mut logger = CsvLogger::create(&path, &names).unwrap();
    let summary = sim.run_with(|record| logger.append(record)).unwrap();
    logger.flush().unwrap();
    drop(logger);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let columns: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(columns, header(&names));
    assert_eq!(columns.len(), 26);

    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), summary.iterations);

    let last = rows.last().unwrap();
    let stable: f64 = last[3].parse().unwrap();
    assert_relative_eq!(stable, summary.final_stable_price, max_relative = 1e-9);
    let redeemed: f64 = last[columns.len() - 1].parse().unwrap();
    assert_relative_eq!(redeemed, summary.total_redeemed, max_relative = 1e-9);
}

#[test]
fn test_bundled_scenarios_parse() {
    for text in [
        include_str!("../scenarios/baseline.toml"),
        include_str!("../scenarios/crash.toml"),
    ] {
        let config = SimulationConfig::from_toml_str(text).unwrap();
        assert!(!config.markets.is_empty());
    }
}
