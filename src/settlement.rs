use crate::account::{Account, Reconciliation, MONEY_EPSILON};
use crate::corporate_action::CorporateActionBook;
use crate::recorder::RecordHandles;
use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, warn};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReport {
    pub date: NaiveDate,
    pub expired_orders: usize,
    pub dropped_positions: usize,
    pub corporate_actions: usize,
    pub frozen_residual: f64,
    pub reconciliation: Reconciliation,
    pub records_dropped: bool,
}

/// Day close for one account. Steps always run in this order: expire orders,
/// settle positions, release frozen cash, emit records, clear the order book.
#[derive(Clone)]
pub struct SettlementCoordinator {
    actions: Arc<CorporateActionBook>,
    records: Option<RecordHandles>,
}

impl SettlementCoordinator {
    pub fn new(actions: Arc<CorporateActionBook>, records: Option<RecordHandles>) -> Self {
        Self { actions, records }
    }

    pub fn settle(
        &self,
        account: &mut Account,
        date: NaiveDate,
        time: NaiveDateTime,
    ) -> Result<SettlementReport> {
        let expired_orders = account.settle_orders(time);

        let outcomes = account.settle_positions(date, &self.actions)?;
        let corporate_actions = outcomes
            .iter()
            .filter(|(_, outcome)| outcome.applied.is_some())
            .count();
        let dropped_positions = outcomes.iter().filter(|(_, outcome)| !outcome.keep).count();
        for (inst_id, outcome) in &outcomes {
            if let Some(action) = &outcome.applied {
                debug!(
                    "{}: applied corporate action for {} registered {}",
                    account.name(),
                    inst_id,
                    action.registration_date
                );
            }
        }
        let frozen_residual = account.release_frozen();
        account.refresh_margin();

        let reconciliation = account.reconcile();
        if !reconciliation.is_consistent(MONEY_EPSILON) {
            warn!(
                "{}: ledger out of balance on {} (balance {:.9}, performance {:.9})",
                account.name(),
                date,
                reconciliation.balance,
                reconciliation.performance
            );
        }

        let records_dropped = !self.emit(account, date, time);
        account.clear_order_book();

        Ok(SettlementReport {
            date,
            expired_orders,
            dropped_positions,
            corporate_actions,
            frozen_residual,
            reconciliation,
            records_dropped,
        })
    }

    fn emit(&self, account: &Account, date: NaiveDate, time: NaiveDateTime) -> bool {
        let Some(records) = self.records.as_ref() else {
            return true;
        };
        let mut delivered = true;
        for record in account.order_records(date) {
            delivered &= records.orders.record(record);
        }
        for record in account.position_records(date, time) {
            delivered &= records.positions.record(record);
        }
        delivered &= records.assets.record(account.asset_record(date, time));
        if !delivered {
            warn!("{}: recorder closed, records for {} dropped", account.name(), date);
        }
        delivered
    }
}
