use super::ensure_file_exists;
use crate::backtester::{BacktestReport, Backtester, SUMMARY_FILE};
use crate::config::BacktestConfig;
use crate::registry::Registry;
use anyhow::Result;
use log::{info, warn};
use std::path::Path;

pub fn run(config_path: &Path) -> Result<BacktestReport> {
    ensure_file_exists(config_path, "Backtest config")?;
    let config = BacktestConfig::load_from_file(config_path)?;
    ensure_file_exists(&config.data_file, "Market data snapshot")?;
    info!(
        "Backtesting strategy {} with {} genome(s) over {} instrument(s)",
        config.strategy,
        config.population.len(),
        config.instruments.len()
    );

    let backtester = Backtester::new(Registry::with_defaults());
    let report = backtester.run_config(&config)?;

    for summary in &report.runs {
        info!(
            "Run {}: total {:.2}, profit {:.2}, commission {:.2}, {} placed / {} rejected / {} filled",
            summary.run_id,
            summary.asset.total,
            summary.asset.profit,
            summary.asset.commission,
            summary.orders.placed,
            summary.orders.rejected,
            summary.fills
        );
    }
    for failure in &report.failures {
        warn!("Run {} failed: {}", failure.run_id, failure.error);
    }
    info!(
        "Records written to {} ({} orders, {} positions, {} assets); summary in {}",
        config.output_dir.display(),
        report.records.orders,
        report.records.positions,
        report.records.assets,
        config.output_dir.join(SUMMARY_FILE).display()
    );
    Ok(report)
}
