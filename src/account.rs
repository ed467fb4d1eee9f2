use crate::contract::{Contract, ContractTable};
use crate::corporate_action::CorporateActionBook;
use crate::error::OrderError;
use crate::models::{AssetRecord, Direction, OrderId, OrderRecord, OrderStatus, OrderType, PositionRecord};
use crate::order::{Order, OrderBook, Transition, QTY_EPSILON};
use crate::position::{Position, PositionDelta, SettleOutcome};
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const MONEY_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Asset {
    pub initial: f64,
    pub total: f64,
    pub available: f64,
    pub frozen: f64,
    pub margin: f64,
    pub market_value: f64,
    pub commission: f64,
    pub profit: f64,
}

/// Residuals of the two money identities; both are zero for a consistent ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reconciliation {
    /// `total - (available + frozen + market_value)`
    pub balance: f64,
    /// `total - (initial + profit - commission)`
    pub performance: f64,
}

impl Reconciliation {
    pub fn is_consistent(&self, tolerance: f64) -> bool {
        self.balance.abs() <= tolerance && self.performance.abs() <= tolerance
    }
}

impl Asset {
    pub fn new(initial: f64) -> Self {
        Self {
            initial,
            total: initial,
            available: initial,
            ..Default::default()
        }
    }

    pub fn reconcile(&self) -> Reconciliation {
        Reconciliation {
            balance: self.total - (self.available + self.frozen + self.market_value),
            performance: self.total - (self.initial + self.profit - self.commission),
        }
    }
}

/// One simulated cash account: asset ledger, positions and the intraday order book.
#[derive(Debug, Clone)]
pub struct Account {
    name: String,
    mode: String,
    asset: Asset,
    contracts: ContractTable,
    positions: BTreeMap<String, Position>,
    orders: BTreeMap<OrderId, Order>,
    book: OrderBook,
    next_order_id: OrderId,
    last_prices: HashMap<String, f64>,
}

impl Account {
    pub fn new(name: &str, initial_cash: f64, contracts: ContractTable) -> Self {
        Self {
            name: name.to_string(),
            mode: "backtest".to_string(),
            asset: Asset::new(initial_cash),
            contracts,
            positions: BTreeMap::new(),
            orders: BTreeMap::new(),
            book: OrderBook::default(),
            next_order_id: 1,
            last_prices: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = mode.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn position(&self, inst_id: &str) -> Option<&Position> {
        self.positions.get(inst_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    /// Orders created since the last settlement, terminal ones included.
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn open_orders(&self, inst_id: &str) -> Vec<OrderId> {
        self.book
            .orders_for(inst_id)
            .into_iter()
            .filter(|id| {
                self.orders
                    .get(id)
                    .map(|order| !order.is_executed())
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn contract(&self, inst_id: &str) -> Option<Arc<dyn Contract>> {
        self.contracts.get(inst_id)
    }

    pub fn resolve_contract(&mut self, inst_id: &str) -> Result<Arc<dyn Contract>, OrderError> {
        self.contracts
            .resolve(inst_id)
            .map_err(|_| OrderError::UnknownInstrument(inst_id.to_string()))
    }

    pub fn last_price(&self, inst_id: &str) -> Option<f64> {
        self.last_prices.get(inst_id).copied()
    }

    pub fn reconcile(&self) -> Reconciliation {
        self.asset.reconcile()
    }

    /// Builds an order without admitting it. Market orders are sized against
    /// `price` when given, otherwise the instrument's last seen price.
    pub fn new_order(
        &mut self,
        inst_id: &str,
        qty: f64,
        price: Option<f64>,
        direction: Direction,
        order_type: OrderType,
        time: NaiveDateTime,
    ) -> Result<Order, OrderError> {
        let contract = self.resolve_contract(inst_id)?;
        let inst_id = contract.inst_id().to_string();
        let price = match order_type {
            OrderType::Limit => price,
            OrderType::Market => price
                .filter(|value| *value > 0.0)
                .or_else(|| self.last_prices.get(&inst_id).copied()),
        };
        let mut order = Order::new(
            self.next_order_id,
            &inst_id,
            qty,
            price,
            direction,
            order_type,
            time,
        )?;
        order.est_commission = contract.calc_comm(order.qty, order.price, direction);
        self.next_order_id += 1;
        Ok(order)
    }

    /// Admits an order to the book, freezing cash or shares against it.
    /// Failed checks reject the order, keep it for the day's records and
    /// return the admission error.
    pub fn insert(
        &mut self,
        mut order: Order,
        check_cash: bool,
        check_position: bool,
    ) -> Result<OrderId, OrderError> {
        if let Err(err) = self.admit(&mut order, check_cash, check_position) {
            let time = order.create_time;
            debug!(
                "{}: rejecting {} order {} for {}: {}",
                self.name,
                order.direction.as_str(),
                order.id,
                order.inst_id,
                err
            );
            order.reject(time, &err.to_string())?;
            self.orders.insert(order.id, order);
            return Err(err);
        }

        let id = order.id;
        self.book.push(&order.inst_id, order.direction, id);
        self.orders.insert(id, order);
        self.on_order_status_change(
            id,
            Transition {
                from: OrderStatus::New,
                to: OrderStatus::New,
            },
        );
        Ok(id)
    }

    fn admit(&mut self, order: &mut Order, check_cash: bool, check_position: bool) -> Result<(), OrderError> {
        if order.is_executed() {
            return Err(OrderError::OrderTerminal {
                id: order.id,
                status: order.status,
            });
        }
        match order.direction {
            Direction::Buy => {
                if order.price <= 0.0 {
                    return Err(OrderError::InvalidOrderPriceLimit);
                }
                let required = order.amount() + order.est_commission;
                if check_cash && self.asset.available + MONEY_EPSILON < required {
                    return Err(OrderError::InsufficientCash {
                        required,
                        available: self.asset.available,
                    });
                }
                order.frozen_amount = order.amount();
                order.frozen_commission = order.est_commission;
            }
            Direction::Sell => {
                let available = self
                    .positions
                    .get(&order.inst_id)
                    .map(|position| position.available())
                    .unwrap_or(0.0);
                if check_position && available + QTY_EPSILON < order.qty {
                    return Err(OrderError::InsufficientPosition {
                        required: order.qty,
                        available,
                    });
                }
                let frozen_qty = order.qty.min(available);
                if frozen_qty > 0.0 {
                    if let Some(position) = self.positions.get_mut(&order.inst_id) {
                        position.freeze(frozen_qty)?;
                    }
                }
                order.frozen_qty = frozen_qty;
            }
        }
        Ok(())
    }

    /// Moves cash and shares between frozen and available for one status transition.
    pub fn on_order_status_change(&mut self, id: OrderId, transition: Transition) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        match transition.to {
            OrderStatus::New => {
                let reserved = order.frozen_amount + order.frozen_commission;
                self.asset.available -= reserved;
                self.asset.frozen += reserved;
            }
            OrderStatus::PartDone | OrderStatus::Rejected => {}
            OrderStatus::Done
            | OrderStatus::Canceled
            | OrderStatus::Expired
            | OrderStatus::PartDonePartCancel => {
                let released = order.frozen_amount + order.frozen_commission;
                order.frozen_amount = 0.0;
                order.frozen_commission = 0.0;
                self.asset.frozen -= released;
                self.asset.available += released;

                let frozen_qty = std::mem::take(&mut order.frozen_qty);
                if frozen_qty > 0.0 {
                    if let Some(position) = self.positions.get_mut(&order.inst_id) {
                        position.unfreeze(frozen_qty);
                    }
                }
            }
        }
    }

    /// Largest lot-rounded quantity of an open buy that reserved plus free cash can pay at `price`.
    pub fn affordable_qty(&self, id: OrderId, price: f64, wanted: f64) -> f64 {
        let Some(order) = self.orders.get(&id) else {
            return 0.0;
        };
        let Some(contract) = self.contracts.get(&order.inst_id) else {
            return 0.0;
        };
        if price <= 0.0 {
            return 0.0;
        }
        let budget = order.frozen_amount + order.frozen_commission + self.asset.available.max(0.0);
        let cost = |qty: f64| {
            let filled = order.trade_qty + qty;
            let avg_price = (order.trade_price * order.trade_qty + price * qty) / filled;
            let commission = contract.calc_comm(filled, avg_price, order.direction) - order.commission;
            qty * price + commission.max(0.0)
        };
        if wanted > 0.0 && cost(wanted) <= budget + MONEY_EPSILON {
            return wanted;
        }
        let lot = contract.lot_size();
        let mut qty = contract.calc_max_qty(wanted.min(budget / price));
        while qty > 0.0 && cost(qty) > budget + MONEY_EPSILON {
            qty -= lot;
        }
        qty.max(0.0)
    }

    /// Applies a fill to the order, the position and the asset ledger in one step.
    pub fn trade(
        &mut self,
        id: OrderId,
        price: f64,
        qty: f64,
        time: NaiveDateTime,
    ) -> Result<Transition, OrderError> {
        let order = self.orders.get_mut(&id).ok_or(OrderError::UnknownOrder(id))?;
        let contract = self
            .contracts
            .get(&order.inst_id)
            .ok_or_else(|| OrderError::UnknownInstrument(order.inst_id.clone()))?;
        if order.direction == Direction::Sell {
            let held = self
                .positions
                .get(&order.inst_id)
                .map(|position| position.history.volume)
                .unwrap_or(0.0);
            if qty > held + QTY_EPSILON {
                return Err(OrderError::InsufficientPosition {
                    required: qty,
                    available: held,
                });
            }
        }
        let remaining_before = order.remaining();
        let transition = order.trade(price, qty, time)?;
        let qty = qty.min(remaining_before);

        let total_commission = contract.calc_comm(order.trade_qty, order.trade_price, order.direction);
        let commission = (total_commission - order.commission).max(0.0);
        order.commission += commission;

        let direction = order.direction;
        let inst_id = order.inst_id.clone();
        match direction {
            Direction::Buy => {
                let released = if remaining_before > 0.0 {
                    order.frozen_amount * (qty / remaining_before)
                } else {
                    0.0
                };
                order.frozen_amount -= released;
                let from_frozen = commission.min(order.frozen_commission);
                order.frozen_commission -= from_frozen;

                self.asset.frozen -= released + from_frozen;
                self.asset.available += released - qty * price - (commission - from_frozen);

                // A fill above the reserved price draws on the rest of this order's reservation.
                if self.asset.available < 0.0 {
                    let shortfall = -self.asset.available;
                    let from_amount = shortfall.min(order.frozen_amount);
                    order.frozen_amount -= from_amount;
                    let from_commission = (shortfall - from_amount).min(order.frozen_commission);
                    order.frozen_commission -= from_commission;
                    self.asset.frozen -= from_amount + from_commission;
                    self.asset.available += from_amount + from_commission;
                }
            }
            Direction::Sell => {
                order.frozen_qty = (order.frozen_qty - qty).max(0.0);
                self.asset.available += qty * price - commission;
            }
        }

        let position = self
            .positions
            .entry(inst_id.clone())
            .or_insert_with(|| Position::new(&inst_id, time.date()));
        let delta = position.trade(direction, qty, price, contract.t_plus_one());
        self.on_trade(delta, commission);
        self.last_prices.insert(inst_id.clone(), price);

        debug!(
            "{}: order {} {} {} {} @ {:.4} ({} -> {})",
            self.name,
            id,
            direction.as_str(),
            qty,
            inst_id,
            price,
            transition.from,
            transition.to
        );

        if transition.to.is_terminal() {
            self.on_order_status_change(id, transition);
        }
        Ok(transition)
    }

    fn on_trade(&mut self, delta: PositionDelta, commission: f64) {
        self.apply_position_delta(delta);
        self.asset.commission += commission;
        self.asset.total -= commission;
    }

    pub fn apply_position_delta(&mut self, delta: PositionDelta) {
        self.asset.market_value += delta.market_value;
        self.asset.total += delta.pnl;
        self.asset.profit += delta.pnl;
    }

    pub fn cancel(&mut self, id: OrderId, time: NaiveDateTime) -> Result<Transition, OrderError> {
        let order = self.orders.get_mut(&id).ok_or(OrderError::UnknownOrder(id))?;
        let transition = order.cancel(time)?;
        self.on_order_status_change(id, transition);
        Ok(transition)
    }

    /// Marks one instrument to `price` and folds the change into the asset ledger.
    pub fn calc_pnl(&mut self, inst_id: &str, time: NaiveDateTime, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.last_prices.insert(inst_id.to_string(), price);
        let delta = match self.positions.get_mut(inst_id) {
            Some(position) => position.calc_pnl(time, price),
            None => return,
        };
        self.apply_position_delta(delta);
    }

    /// Credits `cash - tax`, debits market value by `cash`, books tax as commission.
    pub fn apply_dividend(&mut self, cash: f64, tax: f64) {
        self.asset.available += cash - tax;
        self.asset.market_value -= cash;
        self.asset.commission += tax;
        self.asset.total -= tax;
    }

    /// Expires every order still open at day end. Returns the number expired.
    pub fn settle_orders(&mut self, time: NaiveDateTime) -> usize {
        let mut expired = 0;
        for id in self.book.all_orders() {
            let Some(order) = self.orders.get_mut(&id) else {
                continue;
            };
            if let Some(transition) = order.settle(time) {
                self.on_order_status_change(id, transition);
                expired += 1;
            }
        }
        expired
    }

    /// Settles every position, applying due corporate actions and dropping empties.
    pub fn settle_positions(
        &mut self,
        date: NaiveDate,
        actions: &CorporateActionBook,
    ) -> anyhow::Result<Vec<(String, SettleOutcome)>> {
        let dividend_tax_rate = self.contracts.fees().dividend_tax_rate;
        let inst_ids: Vec<String> = self.positions.keys().cloned().collect();
        let mut outcomes = Vec::with_capacity(inst_ids.len());

        for inst_id in inst_ids {
            let Some(position) = self.positions.get_mut(&inst_id) else {
                continue;
            };
            let close_price = self
                .last_prices
                .get(&inst_id)
                .copied()
                .unwrap_or_else(|| position.last_price());
            let outcome = position.settle(
                date,
                close_price,
                actions.for_instrument(&inst_id),
                dividend_tax_rate,
            );
            if let Some(dividend) = outcome.dividend {
                self.apply_dividend(dividend.cash, dividend.tax);
            }
            self.apply_position_delta(outcome.delta);
            if let Some(exchange) = outcome.exchange.as_ref() {
                self.contracts.resolve(&exchange.target)?;
                self.asset.available += exchange.cash_in_lieu;
                let target = self
                    .positions
                    .entry(exchange.target.clone())
                    .or_insert_with(|| Position::new(&exchange.target, date));
                let arriving = target.absorb(exchange.position.clone());
                let target_price = target.last_price();
                self.apply_position_delta(arriving);
                self.last_prices.insert(exchange.target.clone(), target_price);
            }
            if !outcome.keep {
                self.positions.remove(&inst_id);
            }
            if let Some(price) = self.positions.get(&inst_id).map(|p| p.last_price()) {
                self.last_prices.insert(inst_id.clone(), price);
            }
            outcomes.push((inst_id, outcome));
        }

        Ok(outcomes)
    }

    /// Moves whatever is still frozen back to available. Returns the residual,
    /// which is only rounding noise once every order has been settled.
    pub fn release_frozen(&mut self) -> f64 {
        let residual = self.asset.frozen;
        if residual.abs() > MONEY_EPSILON {
            warn!(
                "{}: {:.6} cash still frozen after order settlement",
                self.name, residual
            );
        }
        self.asset.available += residual;
        self.asset.frozen = 0.0;
        residual
    }

    pub fn refresh_margin(&mut self) {
        let mut margin = 0.0;
        for position in self.positions.values() {
            if let Some(contract) = self.contracts.get(&position.inst_id) {
                margin += contract.calc_margin(position.volume(), position.last_price(), Direction::Buy);
            }
        }
        self.asset.margin = margin;
    }

    pub fn clear_order_book(&mut self) {
        self.book.clear();
        self.orders.clear();
    }

    pub fn order_records(&self, date: NaiveDate) -> Vec<OrderRecord> {
        self.orders
            .values()
            .map(|order| order.to_record(&self.name, date))
            .collect()
    }

    pub fn position_records(&self, date: NaiveDate, time: NaiveDateTime) -> Vec<PositionRecord> {
        self.positions
            .values()
            .map(|position| position.to_record(&self.name, date, time))
            .collect()
    }

    pub fn asset_record(&self, date: NaiveDate, time: NaiveDateTime) -> AssetRecord {
        AssetRecord {
            date,
            time,
            market_val: self.asset.market_value,
            margin: self.asset.margin,
            fund_avail: self.asset.available,
            total_asset: self.asset.total,
            profit: self.asset.profit,
            commission: self.asset.commission,
            account: self.name.clone(),
            mode: self.mode.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::FeeSchedule;
    use crate::models::CorporateAction;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    fn at(d: u32, hour: u32) -> NaiveDateTime {
        day(d).and_hms_opt(hour, 0, 0).unwrap()
    }

    fn account(cash: f64) -> Account {
        Account::new("test", cash, ContractTable::stock(FeeSchedule::default()))
    }

    fn assert_consistent(account: &Account) {
        let check = account.reconcile();
        assert!(check.is_consistent(1e-6), "ledger drifted: {:?}", check);
        assert!(account.asset().available >= -MONEY_EPSILON);
        assert!(account.asset().frozen >= -MONEY_EPSILON);
    }

    fn buy(account: &mut Account, qty: f64, price: f64, time: NaiveDateTime) -> Result<OrderId, OrderError> {
        let order = account.new_order("600000.SH", qty, Some(price), Direction::Buy, OrderType::Limit, time)?;
        account.insert(order, true, true)
    }

    fn sell(account: &mut Account, qty: f64, price: f64, time: NaiveDateTime) -> Result<OrderId, OrderError> {
        let order = account.new_order("600000.SH", qty, Some(price), Direction::Sell, OrderType::Limit, time)?;
        account.insert(order, true, true)
    }

    fn end_of_day(account: &mut Account, d: u32) {
        account.settle_orders(at(d, 15));
        account
            .settle_positions(day(d), &CorporateActionBook::default())
            .unwrap();
        account.release_frozen();
        account.clear_order_book();
    }

    #[test]
    fn order_ids_are_monotonic() {
        let mut account = account(100_000.0);
        let first = buy(&mut account, 100.0, 10.0, at(1, 10)).unwrap();
        let second = buy(&mut account, 100.0, 10.0, at(1, 10)).unwrap();
        assert!(second > first);
    }

    #[test]
    fn insert_freezes_amount_and_commission() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 1000.0, 8.1, at(1, 10)).unwrap();
        let order = account.order(id).unwrap();
        assert_eq!(order.est_commission, 5.08);
        assert!((account.asset().frozen - 8105.08).abs() < 1e-9);
        assert!((account.asset().available - (100_000.0 - 8105.08)).abs() < 1e-9);
        assert_consistent(&account);
    }

    #[test]
    fn insufficient_cash_rejects_and_keeps_record() {
        let mut account = account(1_000.0);
        let err = buy(&mut account, 1000.0, 8.1, at(1, 10)).unwrap_err();
        assert!(matches!(err, OrderError::InsufficientCash { .. }));
        let records = account.order_records(day(1));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "rejected");
        assert!(records[0].reject_reason.starts_with("insufficient cash"));
        assert_eq!(account.asset().frozen, 0.0);
        assert!(account.book().is_empty());
    }

    #[test]
    fn full_fill_pays_cash_and_commission() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        let transition = account.trade(id, 9.0, 1000.0, at(1, 11)).unwrap();
        assert_eq!(transition.to, OrderStatus::Done);
        let asset = account.asset();
        assert!(asset.frozen.abs() < 1e-9);
        assert!((asset.available - (100_000.0 - 9000.0 - 5.09)).abs() < 1e-9);
        assert_eq!(asset.market_value, 9000.0);
        assert_eq!(asset.commission, 5.09);
        assert_consistent(&account);
    }

    #[test]
    fn partial_fills_never_double_charge_minimum_fee() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        account.trade(id, 10.0, 400.0, at(1, 10)).unwrap();
        assert_eq!(account.order(id).unwrap().status, OrderStatus::PartDone);
        account.trade(id, 10.0, 600.0, at(1, 11)).unwrap();
        let order = account.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Done);
        assert!((order.commission - 5.1).abs() < 1e-9);
        assert_consistent(&account);
    }

    #[test]
    fn t_plus_one_blocks_same_day_sell() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 500.0, 10.0, at(1, 10)).unwrap();
        account.trade(id, 10.0, 500.0, at(1, 10)).unwrap();
        let err = sell(&mut account, 500.0, 10.0, at(1, 14)).unwrap_err();
        assert!(matches!(err, OrderError::InsufficientPosition { .. }));

        end_of_day(&mut account, 1);
        let sell_id = sell(&mut account, 500.0, 10.5, at(2, 10)).unwrap();
        account.trade(sell_id, 10.5, 500.0, at(2, 10)).unwrap();
        assert!(account.position("600000.SH").unwrap().is_empty());
        assert!(account.asset().profit > 0.0);
        assert_consistent(&account);
    }

    #[test]
    fn cancel_releases_frozen_cash_and_shares() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        account.trade(id, 10.0, 300.0, at(1, 10)).unwrap();
        let transition = account.cancel(id, at(1, 11)).unwrap();
        assert_eq!(transition.to, OrderStatus::PartDonePartCancel);
        assert!(account.asset().frozen.abs() < 1e-9);
        assert!(account.cancel(id, at(1, 12)).is_err());
        assert_consistent(&account);

        end_of_day(&mut account, 1);
        let sell_id = sell(&mut account, 300.0, 11.0, at(2, 10)).unwrap();
        assert_eq!(account.position("600000.SH").unwrap().available(), 0.0);
        account.cancel(sell_id, at(2, 11)).unwrap();
        assert_eq!(account.position("600000.SH").unwrap().available(), 300.0);
    }

    #[test]
    fn settlement_expires_orders_and_releases_cash() {
        let mut account = account(100_000.0);
        let open = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        let partial = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        account.trade(partial, 10.0, 200.0, at(1, 11)).unwrap();
        assert_eq!(account.settle_orders(at(1, 15)), 2);
        assert_eq!(account.order(open).unwrap().status, OrderStatus::Expired);
        assert_eq!(
            account.order(partial).unwrap().status,
            OrderStatus::PartDonePartCancel
        );
        assert!(account.release_frozen().abs() < 1e-9);
        assert_consistent(&account);
    }

    #[test]
    fn affordable_qty_is_capped_by_cash() {
        let mut account = account(10_000.0);
        let order = account
            .new_order("600000.SH", 1000.0, Some(9.0), Direction::Buy, OrderType::Market, at(1, 10))
            .unwrap();
        let id = account.insert(order, true, true).unwrap();
        // Next bar gaps up: 1000 shares at 11 no longer fit the budget.
        let qty = account.affordable_qty(id, 11.0, 1000.0);
        assert_eq!(qty, 900.0);
        account.trade(id, 11.0, qty, at(1, 11)).unwrap();
        assert!(account.asset().available >= -1e-9);
        assert_eq!(account.order(id).unwrap().status, OrderStatus::PartDone);
        assert_consistent(&account);
    }

    #[test]
    fn dividend_credits_cash_net_of_tax() {
        let fees = FeeSchedule {
            dividend_tax_rate: 0.1,
            ..FeeSchedule::default()
        };
        let mut account = Account::new("div", 100_000.0, ContractTable::stock(fees));
        let order = account
            .new_order("600000.SH", 1000.0, Some(10.0), Direction::Buy, OrderType::Limit, at(1, 10))
            .unwrap();
        let id = account.insert(order, true, true).unwrap();
        account.trade(id, 10.0, 1000.0, at(1, 10)).unwrap();
        account.settle_orders(at(1, 15));
        let actions = CorporateActionBook::new(vec![CorporateAction {
            inst_id: "600000.SH".to_string(),
            ex_date: day(3),
            registration_date: day(2),
            close_price: 10.0,
            cash_dividend: 1.0,
            stock_dividend_ratio: 0.0,
            rights_ratio: 0.0,
            rights_price: 0.0,
            exchange_ratio: 0.0,
            exchange_target: None,
            ex_price: None,
        }])
        .unwrap();
        account.settle_positions(day(1), &actions).unwrap();
        account.clear_order_book();
        let available_before = account.asset().available;
        let commission_before = account.asset().commission;

        account.calc_pnl("600000.SH", at(2, 15), 10.0);
        account.settle_positions(day(2), &actions).unwrap();
        assert!((account.asset().available - available_before - 900.0).abs() < 1e-9);
        assert!((account.asset().commission - commission_before - 100.0).abs() < 1e-9);
        assert!((account.asset().market_value - 9000.0).abs() < 1e-6);
        assert_consistent(&account);

        // The same event is not applied on a later settlement.
        account.settle_positions(day(3), &actions).unwrap();
        assert!((account.asset().available - available_before - 900.0).abs() < 1e-9);
    }

    #[test]
    fn share_exchange_relocates_position() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        account.trade(id, 10.0, 1000.0, at(1, 10)).unwrap();
        let actions = CorporateActionBook::new(vec![CorporateAction {
            inst_id: "600000.SH".to_string(),
            ex_date: day(2),
            registration_date: day(1),
            close_price: 10.0,
            cash_dividend: 0.0,
            stock_dividend_ratio: 0.0,
            rights_ratio: 0.0,
            rights_price: 0.0,
            exchange_ratio: 0.5,
            exchange_target: Some("601000.SH".to_string()),
            ex_price: None,
        }])
        .unwrap();
        account.settle_orders(at(1, 15));
        account.settle_positions(day(1), &actions).unwrap();
        assert!(account.position("600000.SH").is_none());
        let moved = account.position("601000.SH").unwrap();
        assert_eq!(moved.volume(), 500.0);
        assert_eq!(moved.last_price(), 20.0);
        assert!((account.asset().market_value - 10_000.0).abs() < 1e-6);
        assert!(account.contract("601000.SH").is_some());
        assert_consistent(&account);
    }

    fn exchange_action(ratio: f64, target: &str) -> CorporateActionBook {
        CorporateActionBook::new(vec![CorporateAction {
            inst_id: "600000.SH".to_string(),
            ex_date: day(2),
            registration_date: day(1),
            close_price: 10.0,
            cash_dividend: 0.0,
            stock_dividend_ratio: 0.0,
            rights_ratio: 0.0,
            rights_price: 0.0,
            exchange_ratio: ratio,
            exchange_target: Some(target.to_string()),
            ex_price: None,
        }])
        .unwrap()
    }

    fn held_market_value(account: &Account) -> f64 {
        account.positions().map(|position| position.market_value()).sum()
    }

    #[test]
    fn fractional_exchange_leaves_no_stray_market_value() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        account.trade(id, 10.0, 1000.0, at(1, 10)).unwrap();
        account.settle_orders(at(1, 15));
        let available_before = account.asset().available;
        let total_before = account.asset().total;

        account
            .settle_positions(day(1), &exchange_action(1.2345, "601000.SH"))
            .unwrap();
        let moved = account.position("601000.SH").unwrap();
        assert_eq!(moved.volume(), 1234.0);
        let price = moved.last_price();
        assert!((price - 10.0 / 1.2345).abs() < 1e-9);
        assert!((held_market_value(&account) - account.asset().market_value).abs() < 1e-6);
        let cash_in_lieu = account.asset().available - available_before;
        assert!((cash_in_lieu - 0.5 * price).abs() < 1e-6);
        assert!((account.asset().total - total_before).abs() < 1e-6);
        assert_consistent(&account);
        account.release_frozen();
        account.clear_order_book();

        let order = account
            .new_order("601000.SH", 1234.0, Some(price), Direction::Sell, OrderType::Limit, at(2, 10))
            .unwrap();
        let id = account.insert(order, true, true).unwrap();
        account.trade(id, price, 1234.0, at(2, 10)).unwrap();
        assert!(account.asset().market_value.abs() < 1e-6);
        end_of_day(&mut account, 2);
        assert_eq!(account.positions().count(), 0);
        assert!(account.asset().market_value.abs() < 1e-6);
        assert_consistent(&account);
    }

    #[test]
    fn exchange_into_held_instrument_keeps_its_close() {
        let mut account = account(100_000.0);
        let id = buy(&mut account, 1000.0, 10.0, at(1, 10)).unwrap();
        account.trade(id, 10.0, 1000.0, at(1, 10)).unwrap();
        let order = account
            .new_order("601000.SH", 100.0, Some(22.0), Direction::Buy, OrderType::Limit, at(1, 10))
            .unwrap();
        let target_id = account.insert(order, true, true).unwrap();
        account.trade(target_id, 22.0, 100.0, at(1, 10)).unwrap();
        account.settle_orders(at(1, 15));

        account
            .settle_positions(day(1), &exchange_action(0.5, "601000.SH"))
            .unwrap();
        let target = account.position("601000.SH").unwrap();
        assert_eq!(target.volume(), 600.0);
        assert_eq!(target.last_price(), 22.0);
        assert_eq!(account.last_price("601000.SH"), Some(22.0));
        assert!((account.asset().market_value - 600.0 * 22.0).abs() < 1e-6);
        assert!((held_market_value(&account) - account.asset().market_value).abs() < 1e-6);
        assert_consistent(&account);
    }

    #[test]
    fn records_follow_account_state() {
        let mut account = account(50_000.0).with_mode("paper");
        let id = buy(&mut account, 100.0, 10.0, at(1, 10)).unwrap();
        account.trade(id, 10.0, 100.0, at(1, 10)).unwrap();
        account.refresh_margin();
        let asset = account.asset_record(day(1), at(1, 15));
        assert_eq!(asset.mode, "paper");
        assert_eq!(asset.margin, 1000.0);
        assert_eq!(asset.market_val, 1000.0);
        let positions = account.position_records(day(1), at(1, 15));
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].volume, 100.0);
        assert_eq!(positions[0].avail_vol, 0.0);
        let orders = account.order_records(day(1));
        assert_eq!(orders[0].status, "done");
        assert!((orders[0].commission - 5.01).abs() < 1e-9);
    }
}
