use crate::account::Account;
use crate::config::{BacktestConfig, EngineSettings};
use crate::contract::ContractTable;
use crate::corporate_action::CorporateActionBook;
use crate::quote::{FanOutReport, QuoteScheduler, QuoteSource};
use crate::recorder::{RecordCounts, RecorderSet};
use crate::registry::Registry;
use crate::run::{RunSummary, SimulationRun};
use crate::settlement::SettlementCoordinator;
use crate::strategy::Strategy;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

pub const SUMMARY_FILE: &str = "summary.json";

/// Everything one fan-out backtest needs besides the record sinks.
pub struct BacktestJob<'a> {
    pub source: &'a dyn QuoteSource,
    pub instruments: &'a [String],
    pub contract: &'a str,
    pub strategy: &'a str,
    /// One genome per simulation run.
    pub population: &'a [Vec<f64>],
    pub settings: &'a EngineSettings,
    pub actions: Arc<CorporateActionBook>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub run_id: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub backtest_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshots: usize,
    pub fan_out: FanOutReport,
    pub records: RecordCounts,
    pub runs: Vec<RunSummary>,
    pub failures: Vec<RunFailure>,
}

impl BacktestReport {
    pub fn best_run(&self) -> Option<&RunSummary> {
        self.runs
            .iter()
            .max_by(|a, b| a.asset.total.total_cmp(&b.asset.total))
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create backtest summary {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write backtest summary {}", path.display()))
    }
}

struct RunOutcome {
    run_id: usize,
    result: Result<RunSummary>,
}

/// Composition root: builds one account per genome, subscribes each to a
/// shared quote scheduler and runs them on their own threads.
pub struct Backtester {
    registry: Registry,
}

impl Backtester {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Loads data and corporate actions named by the config, writes records
    /// as JSON lines and a summary under the output directory.
    pub fn run_config(&self, config: &BacktestConfig) -> Result<BacktestReport> {
        config.validate()?;
        let settings = config.engine_settings()?;
        let source = (self.registry.quote_source(&config.quote_source)?)(&config.data_file)?;
        let actions = match &config.corporate_actions_file {
            Some(path) => CorporateActionBook::load_from_file(path)?,
            None => CorporateActionBook::default(),
        };
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                config.output_dir.display()
            )
        })?;
        let recorders = RecorderSet::json_lines(&config.output_dir, settings.recorder_buffer)?;

        let job = BacktestJob {
            source: source.as_ref(),
            instruments: &config.instruments,
            contract: &config.contract,
            strategy: &config.strategy,
            population: &config.population,
            settings: &settings,
            actions: Arc::new(actions),
        };
        let report = self.run(job, recorders)?;
        report.write_to_file(config.output_dir.join(SUMMARY_FILE))?;
        Ok(report)
    }

    pub fn run(&self, job: BacktestJob<'_>, recorders: RecorderSet) -> Result<BacktestReport> {
        let started_at = Utc::now();
        let backtest_id = Uuid::new_v4();
        let settings = job.settings;
        let run_count = job.population.len();
        if run_count == 0 {
            return Err(anyhow!("Backtest population is empty"));
        }

        let contract_factory = self.registry.contract(job.contract)?;
        let matcher_factory = self.registry.matcher(settings.matcher.tag())?;
        let strategy_factory = self.registry.strategy(job.strategy)?;
        let strategies = job
            .population
            .iter()
            .enumerate()
            .map(|(id, genome)| {
                strategy_factory(genome.as_slice()).with_context(|| format!("Invalid genome for run {}", id))
            })
            .collect::<Result<Vec<Box<dyn Strategy>>>>()?;

        let mut scheduler = QuoteScheduler::from_source(job.source, job.instruments, settings.queue_depth)?;
        if scheduler.is_empty() {
            warn!("No snapshots to replay for {} instrument(s)", job.instruments.len());
        }
        let snapshots = scheduler.len();
        info!(
            "Backtest {}: {} run(s) over {} snapshot(s) with {} matcher",
            backtest_id,
            run_count,
            snapshots,
            settings.matcher.tag()
        );

        let record_handles = recorders.handles()?;
        let (result_tx, result_rx): (Sender<RunOutcome>, Receiver<RunOutcome>) = bounded(run_count);

        let mut handles = Vec::with_capacity(run_count);
        for (run_id, strategy) in strategies.into_iter().enumerate() {
            let subscription = scheduler.subscribe()?;
            let account = Account::new(
                &format!("run-{}", run_id),
                settings.initial_cash,
                ContractTable::new(settings.fees.clone(), contract_factory.clone()),
            )
            .with_mode(&settings.account_mode);
            let run = SimulationRun::new(
                run_id,
                account,
                matcher_factory(settings.match_settings()),
                strategy,
                SettlementCoordinator::new(job.actions.clone(), Some(record_handles.clone())),
                settings.admission_checks(),
            );
            let result_tx = result_tx.clone();

            let handle = thread::spawn(move || {
                let result = run.drive(subscription.receiver, subscription.stop);
                if let Err(err) = &result {
                    warn!("Run {} failed: {:#}", run_id, err);
                }
                let _ = result_tx.send(RunOutcome { run_id, result });
            });
            handles.push((run_id, handle));
        }
        drop(result_tx);
        drop(record_handles);

        scheduler.run()?;

        let pb = ProgressBar::new(run_count as u64);
        match ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            Ok(style) => pb.set_style(style.progress_chars("#>-")),
            Err(err) => warn!("Progress bar template rejected: {}", err),
        }

        let mut runs = Vec::with_capacity(run_count);
        let mut failures = Vec::new();
        let mut completed = 0;
        while completed < run_count {
            match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(outcome) => {
                    completed += 1;
                    pb.set_position(completed as u64);
                    match outcome.result {
                        Ok(summary) => runs.push(summary),
                        Err(err) => failures.push(RunFailure {
                            run_id: outcome.run_id,
                            error: format!("{:#}", err),
                        }),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some runs may be lost.");
                    break;
                }
            }
        }

        if failures.is_empty() {
            pb.finish_with_message("Backtest completed");
        } else {
            warn!("Backtest completed with {} failed run(s)", failures.len());
            pb.finish_with_message("Backtest completed with errors");
        }

        for (run_id, handle) in handles {
            if handle.join().is_err() {
                warn!("Run {} thread panicked", run_id);
                if !runs.iter().any(|summary| summary.run_id == run_id)
                    && !failures.iter().any(|failure| failure.run_id == run_id)
                {
                    failures.push(RunFailure {
                        run_id,
                        error: "run thread panicked".to_string(),
                    });
                }
            }
        }

        let fan_out = scheduler.wait_for_shutdown()?;
        let records = recorders.shutdown()?;

        runs.sort_by_key(|summary| summary.run_id);
        failures.sort_by_key(|failure| failure.run_id);
        let report = BacktestReport {
            backtest_id,
            started_at,
            finished_at: Utc::now(),
            snapshots,
            fan_out,
            records,
            runs,
            failures,
        };
        if let Some(best) = report.best_run() {
            info!(
                "Backtest {} finished: best run {} ended at {:.2} (profit {:.2}, commission {:.2})",
                report.backtest_id, best.run_id, best.asset.total, best.asset.profit, best.asset.commission
            );
        }
        Ok(report)
    }
}
