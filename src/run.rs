use crate::account::{Account, Asset, Reconciliation, MONEY_EPSILON};
use crate::matcher::Matcher;
use crate::models::Snapshot;
use crate::quote::StopHandle;
use crate::settlement::SettlementCoordinator;
use crate::strategy::{AdmissionChecks, OrderContext, OrderStats, Strategy};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: usize,
    pub account: String,
    pub strategy: String,
    pub asset: Asset,
    pub reconciliation: Reconciliation,
    pub snapshots: usize,
    pub settled_days: usize,
    pub orders: OrderStats,
    pub fills: usize,
    pub expired_orders: usize,
    pub corporate_actions: usize,
    pub first_time: Option<NaiveDateTime>,
    pub last_time: Option<NaiveDateTime>,
}

/// One account driven through the snapshot sequence by one strategy.
///
/// Per snapshot: settle the previous day when the date changes, match at the
/// open, let the strategy act, match at the close, then mark positions.
pub struct SimulationRun {
    id: usize,
    account: Account,
    matcher: Box<dyn Matcher>,
    strategy: Box<dyn Strategy>,
    settlement: SettlementCoordinator,
    checks: AdmissionChecks,
    current_date: Option<NaiveDate>,
    first_time: Option<NaiveDateTime>,
    last_time: Option<NaiveDateTime>,
    snapshots: usize,
    settled_days: usize,
    orders: OrderStats,
    fills: usize,
    expired_orders: usize,
    corporate_actions: usize,
}

impl SimulationRun {
    pub fn new(
        id: usize,
        account: Account,
        matcher: Box<dyn Matcher>,
        strategy: Box<dyn Strategy>,
        settlement: SettlementCoordinator,
        checks: AdmissionChecks,
    ) -> Self {
        Self {
            id,
            account,
            matcher,
            strategy,
            settlement,
            checks,
            current_date: None,
            first_time: None,
            last_time: None,
            snapshots: 0,
            settled_days: 0,
            orders: OrderStats::default(),
            fills: 0,
            expired_orders: 0,
            corporate_actions: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn process(&mut self, snapshot: &Snapshot) -> Result<()> {
        if let Some(date) = self.current_date {
            if snapshot.date() != date {
                self.settle_day()?;
            }
        }
        self.current_date = Some(snapshot.date());
        self.first_time.get_or_insert(snapshot.time);
        self.last_time = Some(snapshot.time);
        self.snapshots += 1;

        for bar in &snapshot.bars {
            self.fills += self.matcher.on_bar_open(&mut self.account, bar).len();
        }

        {
            let mut ctx = OrderContext::new(&mut self.account, snapshot, self.checks, &mut self.orders);
            self.strategy
                .on_snapshot(&mut ctx)
                .with_context(|| format!("Strategy {} failed at {}", self.strategy.name(), snapshot.time))?;
        }

        for bar in &snapshot.bars {
            self.fills += self.matcher.on_bar_close(&mut self.account, bar).len();
        }
        for bar in &snapshot.bars {
            self.account.calc_pnl(&bar.inst_id, bar.time, bar.close);
        }
        Ok(())
    }

    fn settle_day(&mut self) -> Result<()> {
        let (Some(date), Some(time)) = (self.current_date, self.last_time) else {
            return Ok(());
        };
        let report = self
            .settlement
            .settle(&mut self.account, date, time)
            .with_context(|| format!("Settlement failed for {} on {}", self.account.name(), date))?;
        self.settled_days += 1;
        self.expired_orders += report.expired_orders;
        self.corporate_actions += report.corporate_actions;
        debug!(
            "{}: settled {} (expired {}, actions {}, total {:.2})",
            self.account.name(),
            date,
            report.expired_orders,
            report.corporate_actions,
            self.account.asset().total
        );
        self.strategy.on_day_settled(&report);
        Ok(())
    }

    /// Settles the final day and reports.
    pub fn finish(mut self) -> Result<RunSummary> {
        self.settle_day()?;
        let reconciliation = self.account.reconcile();
        if !reconciliation.is_consistent(MONEY_EPSILON) {
            warn!(
                "{}: final ledger out of balance (balance {:.9}, performance {:.9})",
                self.account.name(),
                reconciliation.balance,
                reconciliation.performance
            );
        }
        Ok(RunSummary {
            run_id: self.id,
            account: self.account.name().to_string(),
            strategy: self.strategy.name().to_string(),
            asset: self.account.asset().clone(),
            reconciliation,
            snapshots: self.snapshots,
            settled_days: self.settled_days,
            orders: self.orders,
            fills: self.fills,
            expired_orders: self.expired_orders,
            corporate_actions: self.corporate_actions,
            first_time: self.first_time,
            last_time: self.last_time,
        })
    }

    /// Consumes snapshots until the queue closes. On a fatal error the run
    /// signals stop and drops its queue so the scheduler unsubscribes it.
    pub fn drive(mut self, receiver: Receiver<Arc<Snapshot>>, stop: StopHandle) -> Result<RunSummary> {
        info!("{}: run {} started", self.account.name(), self.id);
        for snapshot in receiver.iter() {
            if let Err(err) = self.process(&snapshot) {
                stop.stop();
                drop(receiver);
                return Err(err.context(format!("Run {} aborted", self.id)));
            }
        }
        let summary = self.finish()?;
        info!(
            "{}: run {} finished over {} day(s), total asset {:.2}",
            summary.account, summary.run_id, summary.settled_days, summary.asset.total
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractTable, FeeSchedule};
    use crate::corporate_action::CorporateActionBook;
    use crate::matcher::{CurrentBarMatcher, MatchSettings};
    use crate::models::Bar;
    use crate::quote::QuoteScheduler;
    use crate::strategy::BuyAndHoldStrategy;

    fn snapshot(day: u32, hour: u32, close: f64) -> Snapshot {
        let time = NaiveDate::from_ymd_opt(2021, 9, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        Snapshot {
            time,
            bars: vec![Bar {
                inst_id: "600000.SH".to_string(),
                time,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1e7,
                amount: 1e7 * close,
            }],
        }
    }

    fn run() -> SimulationRun {
        SimulationRun::new(
            0,
            Account::new("run-0", 100_000.0, ContractTable::stock(FeeSchedule::default())),
            Box::new(CurrentBarMatcher::new(MatchSettings::default())),
            Box::new(BuyAndHoldStrategy::new()),
            SettlementCoordinator::new(Arc::new(CorporateActionBook::default()), None),
            AdmissionChecks::default(),
        )
    }

    #[test]
    fn settles_once_per_day_change() {
        let mut run = run();
        run.process(&snapshot(1, 10, 10.0)).unwrap();
        run.process(&snapshot(1, 14, 10.5)).unwrap();
        assert_eq!(run.settled_days, 0);
        assert_eq!(run.account().position("600000.SH").unwrap().available(), 0.0);
        run.process(&snapshot(2, 10, 11.0)).unwrap();
        assert_eq!(run.settled_days, 1);
        assert!(run.account().position("600000.SH").unwrap().available() > 0.0);

        let summary = run.finish().unwrap();
        assert_eq!(summary.settled_days, 2);
        assert_eq!(summary.snapshots, 3);
        assert_eq!(summary.fills, 1);
        assert_eq!(summary.orders.placed, 1);
        assert!(summary.reconciliation.is_consistent(1e-6));
        assert!(summary.asset.profit > 0.0);
    }

    #[test]
    fn drive_consumes_until_the_queue_closes() {
        let snapshots = (1..=5)
            .map(|day| Arc::new(snapshot(day, 15, 10.0 + day as f64)))
            .collect();
        let mut scheduler = QuoteScheduler::new(snapshots, 2);
        let subscription = scheduler.subscribe().unwrap();
        scheduler.run().unwrap();
        let summary = run().drive(subscription.receiver, subscription.stop).unwrap();
        let report = scheduler.wait_for_shutdown().unwrap();
        assert_eq!(report.published, 5);
        assert_eq!(summary.snapshots, 5);
        assert_eq!(summary.settled_days, 5);
        assert_eq!(
            summary.first_time.map(|time| time.date()),
            NaiveDate::from_ymd_opt(2021, 9, 1)
        );
    }
}
