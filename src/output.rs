//! Iteration table and run summary output.
//!
//! The CSV column order is fixed: iteration, each market's spot price, the
//! stable-asset and governance-token prices, then one group per metric with a
//! column per market, and finally the cumulative stable asset redeemed.
//! Downstream tooling reads columns by position, so keep the order stable.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state_log::MarketSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRow {
    pub name: String,
    pub snapshot: MarketSnapshot,
    pub collateral_added: f64,
    pub collateral_liquidated: f64,
}

/// One row of the output table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub stable_price: f64,
    pub governance_price: f64,
    pub markets: Vec<MarketRow>,
    pub total_redeemed: f64,
}

impl IterationRecord {
    pub fn to_fields(&self) -> Vec<String> {
        let per_market = |f: &dyn Fn(&MarketRow) -> String| self.markets.iter().map(f).collect::<Vec<_>>();

        let mut fields = vec![self.iteration.to_string()];
        fields.extend(per_market(&|m| m.snapshot.price.to_string()));
        fields.push(self.stable_price.to_string());
        fields.push(self.governance_price.to_string());
        fields.extend(per_market(&|m| m.snapshot.trove_count.to_string()));
        fields.extend(per_market(&|m| m.snapshot.total_collateral.to_string()));
        fields.extend(per_market(&|m| m.snapshot.total_debt.to_string()));
        fields.extend(per_market(&|m| m.snapshot.tcr.to_string()));
        fields.extend(per_market(&|m| m.snapshot.recovery_mode.to_string()));
        fields.extend(per_market(&|m| {
            m.snapshot.last_icr.map(|icr| icr.to_string()).unwrap_or_default()
        }));
        fields.extend(per_market(&|m| m.snapshot.pool_stable.to_string()));
        fields.extend(per_market(&|m| m.snapshot.pool_collateral.to_string()));
        fields.extend(per_market(&|m| m.collateral_added.to_string()));
        fields.extend(per_market(&|m| m.collateral_liquidated.to_string()));
        fields.push(self.total_redeemed.to_string());
        fields
    }
}

/// Column names for markets in run order.
pub fn header(markets: &[String]) -> Vec<String> {
    let lower: Vec<String> = markets.iter().map(|m| m.to_lowercase()).collect();
    let group = |prefix: &'static str| lower.iter().map(move |m| format!("{prefix}_{m}"));

    let mut columns = vec!["iteration".to_string()];
    columns.extend(markets.iter().map(|m| format!("{m}_price")));
    columns.push("price_stable".to_string());
    columns.push("price_governance".to_string());
    columns.extend(group("num_troves"));
    columns.extend(group("total_coll"));
    columns.extend(group("total_debt"));
    columns.extend(group("TCR"));
    columns.extend(group("recovery_mode"));
    columns.extend(group("last_ICR"));
    columns.extend(markets.iter().map(|m| format!("SP_stable_{m}")));
    columns.extend(markets.iter().map(|m| format!("SP_{m}")));
    columns.extend(group("total_coll_added"));
    columns.extend(group("total_coll_liquidated"));
    columns.push("total_stable_redeemed".to_string());
    columns
}

/// Appends iteration records to a CSV sink.
pub struct CsvLogger<W: io::Write> {
    writer: csv::Writer<W>,
    columns: usize,
}

impl CsvLogger<fs::File> {
    pub fn create<P: AsRef<Path>>(path: P, markets: &[String]) -> Result<Self> {
        Self::new(csv::Writer::from_path(path)?, markets)
    }
}

impl<W: io::Write> CsvLogger<W> {
    pub fn new(mut writer: csv::Writer<W>, markets: &[String]) -> Result<Self> {
        let columns = header(markets);
        writer.write_record(&columns)?;
        Ok(Self {
            writer,
            columns: columns.len(),
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn append(&mut self, record: &IterationRecord) -> Result<()> {
        self.writer.write_record(record.to_fields())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub name: String,
    pub collateral_added: f64,
    pub collateral_liquidated: f64,
    pub liquidated_share: f64,
    pub final_troves: usize,
    pub final_tcr: f64,
    pub opened: usize,
    pub closed: usize,
    pub liquidated: usize,
}

/// End-of-run figures written next to the iteration table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub seed: u64,
    pub iterations: usize,
    pub final_stable_price: f64,
    pub min_stable_price: f64,
    pub max_stable_price: f64,
    pub final_governance_price: f64,
    pub total_redeemed: f64,
    pub total_fees: f64,
    pub markets: Vec<MarketSummary>,
}

impl RunSummary {
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn print(&self) {
        println!("\n=== Run summary (seed {}) ===", self.seed);
        println!("Iterations:            {}", self.iterations);
        println!(
            "Stable price:          final {:.4}, min {:.4}, max {:.4}",
            self.final_stable_price, self.min_stable_price, self.max_stable_price
        );
        println!("Governance price:      {:.4}", self.final_governance_price);
        println!("Total redeemed:        {:.2}", self.total_redeemed);
        println!("Total fees:            {:.2}", self.total_fees);
        for market in &self.markets {
            println!(
                "{:<6} troves {:>4}  TCR {:>8.3}  added {:>12.2}  liquidated {:>10.2} ({:.2}%)",
                market.name,
                market.final_troves,
                market.final_tcr,
                market.collateral_added,
                market.collateral_liquidated,
                market.liquidated_share * 100.0
            );
        }
    }
}
