use crate::error::OrderError;
use crate::models::{round_to, CorporateAction, Direction, PositionRecord};
use chrono::{NaiveDate, NaiveDateTime};
use log::debug;

pub const VOLUME_EPSILON: f64 = 1e-6;

/// Change in account-level value caused by a position mutation.
///
/// `pnl` is the part of the change the account attributes to profit (and so to
/// total asset); `market_value` is the change in marked position value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionDelta {
    pub market_value: f64,
    pub pnl: f64,
}

impl PositionDelta {
    pub fn marked(value: f64) -> Self {
        Self {
            market_value: value,
            pnl: value,
        }
    }

    pub fn merge(self, other: PositionDelta) -> Self {
        Self {
            market_value: self.market_value + other.market_value,
            pnl: self.pnl + other.pnl,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubPosition {
    pub open_price: f64,
    pub last_price: f64,
    pub volume: f64,
    pub available: f64,
    pub cost_amt: f64,
    pub pnl: f64,
}

impl SubPosition {
    pub fn is_empty(&self) -> bool {
        self.volume <= VOLUME_EPSILON
    }

    pub fn market_value(&self) -> f64 {
        self.volume * self.last_price
    }

    fn mark(&mut self, price: f64) -> f64 {
        if !price.is_finite() || price <= 0.0 || self.is_empty() {
            return 0.0;
        }
        let delta = self.volume * (price - self.last_price);
        self.pnl += delta;
        self.last_price = price;
        delta
    }

    fn add(&mut self, qty: f64, price: f64) {
        self.cost_amt += qty * price;
        self.volume += qty;
        self.last_price = price;
        self.refresh_open_price();
    }

    fn remove(&mut self, qty: f64) {
        let qty = qty.min(self.volume);
        self.cost_amt -= qty * self.open_price;
        self.volume -= qty;
        self.available = self.available.min(self.volume);
        if self.is_empty() {
            self.clear_prices();
        }
    }

    fn refresh_open_price(&mut self) {
        if self.is_empty() {
            self.clear_prices();
        } else {
            self.open_price = round_to(self.cost_amt / self.volume, 6);
        }
    }

    fn clear_prices(&mut self) {
        self.volume = 0.0;
        self.available = 0.0;
        self.cost_amt = 0.0;
        self.open_price = 0.0;
        self.last_price = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dividend {
    /// Net cash per the event: dividends received minus rights subscription paid.
    pub cash: f64,
    pub tax: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareExchange {
    pub target: String,
    pub position: SubPosition,
    /// Fractional target shares paid out in cash at the exchange price.
    pub cash_in_lieu: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettleOutcome {
    /// False once both sub-ledgers are empty; the caller drops the position.
    pub keep: bool,
    pub delta: PositionDelta,
    pub dividend: Option<Dividend>,
    pub exchange: Option<ShareExchange>,
    pub applied: Option<CorporateAction>,
}

/// One instrument's holding, split into today's purchases and settled shares.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub inst_id: String,
    pub today: SubPosition,
    pub history: SubPosition,
    opened_on: NaiveDate,
    action_cursor: usize,
    last_action_date: Option<NaiveDate>,
}

impl Position {
    pub fn new(inst_id: &str, opened_on: NaiveDate) -> Self {
        Self {
            inst_id: inst_id.to_string(),
            today: SubPosition::default(),
            history: SubPosition::default(),
            opened_on,
            action_cursor: 0,
            last_action_date: None,
        }
    }

    pub fn volume(&self) -> f64 {
        self.today.volume + self.history.volume
    }

    /// Sell-available volume.
    pub fn available(&self) -> f64 {
        self.history.available
    }

    pub fn market_value(&self) -> f64 {
        self.today.market_value() + self.history.market_value()
    }

    pub fn pnl(&self) -> f64 {
        self.today.pnl + self.history.pnl
    }

    pub fn last_price(&self) -> f64 {
        if !self.history.is_empty() {
            self.history.last_price
        } else {
            self.today.last_price
        }
    }

    pub fn cost_price(&self) -> f64 {
        let volume = self.volume();
        if volume <= VOLUME_EPSILON {
            return 0.0;
        }
        round_to((self.today.cost_amt + self.history.cost_amt) / volume, 6)
    }

    pub fn is_empty(&self) -> bool {
        self.today.is_empty() && self.history.is_empty()
    }

    pub fn last_action_date(&self) -> Option<NaiveDate> {
        self.last_action_date
    }

    /// Reserves settled shares for a pending sell.
    pub fn freeze(&mut self, qty: f64) -> Result<(), OrderError> {
        if qty > self.history.available + VOLUME_EPSILON {
            return Err(OrderError::InsufficientPosition {
                required: qty,
                available: self.history.available,
            });
        }
        self.history.available = (self.history.available - qty).max(0.0);
        Ok(())
    }

    pub fn unfreeze(&mut self, qty: f64) {
        self.history.available = (self.history.available + qty).min(self.history.volume);
    }

    /// Applies a fill. Buys land in `today` under T+1; sells draw on settled shares.
    pub fn trade(&mut self, direction: Direction, qty: f64, price: f64, t_plus_one: bool) -> PositionDelta {
        match direction {
            Direction::Buy => {
                let target = if t_plus_one {
                    &mut self.today
                } else {
                    &mut self.history
                };
                let marked = target.mark(price);
                target.add(qty, price);
                if !t_plus_one {
                    target.available += qty;
                }
                PositionDelta {
                    market_value: marked + qty * price,
                    pnl: marked,
                }
            }
            Direction::Sell => {
                let qty = qty.min(self.history.volume);
                let last = self.history.last_price;
                let realized = qty * (price - last);
                self.history.pnl += realized;
                self.history.remove(qty);
                PositionDelta {
                    market_value: -qty * last,
                    pnl: realized,
                }
            }
        }
    }

    /// Marks both sub-ledgers to `price`. Account attribution is the caller's job.
    pub fn calc_pnl(&mut self, _time: NaiveDateTime, price: f64) -> PositionDelta {
        let marked = self.today.mark(price) + self.history.mark(price);
        PositionDelta::marked(marked)
    }

    /// Merges today's shares into history, then applies at most one due
    /// corporate action from `actions` (sorted by registration date).
    pub fn settle(
        &mut self,
        date: NaiveDate,
        close_price: f64,
        actions: &[CorporateAction],
        dividend_tax_rate: f64,
    ) -> SettleOutcome {
        let mut delta = PositionDelta::marked(self.today.mark(close_price) + self.history.mark(close_price));

        if !self.today.is_empty() {
            let today = std::mem::take(&mut self.today);
            self.history.cost_amt += today.cost_amt;
            self.history.volume += today.volume;
            self.history.available += today.volume;
            self.history.pnl += today.pnl;
            self.history.last_price = today.last_price;
            self.history.refresh_open_price();
        } else {
            self.today = SubPosition::default();
        }

        let mut outcome = SettleOutcome::default();
        if let Some(action) = self.next_due_action(date, actions) {
            if !self.history.is_empty() {
                if action.is_share_exchange() {
                    let old_value = self.history.market_value();
                    let exchange = self.exchange_shares(&action);
                    // The whole old holding leaves; total keeps only the cash part until
                    // the target absorbs the exchanged shares.
                    delta = delta.merge(PositionDelta {
                        market_value: -old_value,
                        pnl: exchange.cash_in_lieu - old_value,
                    });
                    outcome.exchange = Some(exchange);
                } else {
                    let (dividend, residual) = self.adjust_for_action(&action, dividend_tax_rate);
                    delta = delta.merge(residual);
                    outcome.dividend = Some(dividend);
                }
            }
            outcome.applied = Some(action);
        }

        outcome.delta = delta;
        outcome.keep = !self.is_empty();
        outcome
    }

    /// Moves an exchanged holding into this position's settled ledger. An
    /// existing holding keeps its own price; the incoming shares are marked to it.
    pub fn absorb(&mut self, mut incoming: SubPosition) -> PositionDelta {
        let held_price = self.last_price();
        if !self.is_empty() && held_price > 0.0 {
            incoming.pnl += incoming.volume * (held_price - incoming.last_price);
            incoming.last_price = held_price;
        }
        let arriving = incoming.market_value();
        self.history.cost_amt += incoming.cost_amt;
        self.history.volume += incoming.volume;
        self.history.available += incoming.available;
        self.history.pnl += incoming.pnl;
        self.history.last_price = incoming.last_price;
        self.history.refresh_open_price();
        PositionDelta::marked(arriving)
    }

    fn next_due_action(&mut self, date: NaiveDate, actions: &[CorporateAction]) -> Option<CorporateAction> {
        while let Some(action) = actions.get(self.action_cursor) {
            let stale = action.registration_date < self.opened_on;
            let consumed = self
                .last_action_date
                .map(|last| action.registration_date <= last)
                .unwrap_or(false);
            if stale || consumed {
                self.action_cursor += 1;
                continue;
            }
            if action.registration_date > date {
                return None;
            }
            self.action_cursor += 1;
            self.last_action_date = Some(action.registration_date);
            return Some(action.clone());
        }
        None
    }

    fn exchange_shares(&mut self, action: &CorporateAction) -> ShareExchange {
        let ratio = action.exchange_ratio;
        let old = std::mem::take(&mut self.history);
        let exact = old.volume * ratio;
        let volume = (exact + VOLUME_EPSILON).floor();
        let reference = if old.last_price > 0.0 {
            old.last_price
        } else {
            action.close_price
        };
        let last_price = action
            .ex_price
            .filter(|price| price.is_finite() && *price > 0.0)
            .unwrap_or(reference / ratio);
        let cash_in_lieu = (exact - volume).max(0.0) * last_price;
        let mut moved = SubPosition {
            open_price: 0.0,
            last_price,
            volume,
            available: volume,
            cost_amt: old.cost_amt,
            pnl: old.pnl,
        };
        moved.refresh_open_price();
        debug!(
            "Share exchange {} -> {}: {} shares became {}",
            self.inst_id,
            action.exchange_target.as_deref().unwrap_or_default(),
            old.volume,
            moved.volume
        );
        ShareExchange {
            target: action.exchange_target.clone().unwrap_or_default().trim().to_uppercase(),
            position: moved,
            cash_in_lieu,
        }
    }

    fn adjust_for_action(&mut self, action: &CorporateAction, dividend_tax_rate: f64) -> (Dividend, PositionDelta) {
        let history = &mut self.history;
        let volume = history.volume;
        let reference = if history.last_price > 0.0 {
            history.last_price
        } else {
            action.close_price
        };
        let old_value = volume * reference;

        let dividend_cash = volume * action.cash_dividend.max(0.0);
        let rights_cost = volume * action.rights_ratio.max(0.0) * action.rights_price.max(0.0);
        let cash = dividend_cash - rights_cost;
        let tax = (dividend_cash * dividend_tax_rate.max(0.0)).max(0.0);

        let new_volume = (volume * action.share_multiplier() + VOLUME_EPSILON).floor();
        let new_last = action
            .ex_price
            .filter(|price| price.is_finite() && *price > 0.0)
            .unwrap_or_else(|| action.adjust_price(reference));
        history.volume = new_volume;
        history.available = new_volume;
        history.cost_amt = history.cost_amt - dividend_cash + rights_cost;
        history.last_price = new_last;
        history.refresh_open_price();

        let residual = history.market_value() - old_value + cash;
        history.pnl += residual;
        debug!(
            "Corporate action {} on {}: volume {} -> {}, cash {:.2}, tax {:.2}",
            self.inst_id, action.registration_date, volume, new_volume, cash, tax
        );
        (Dividend { cash, tax }, PositionDelta::marked(residual))
    }

    pub fn to_record(&self, account: &str, date: NaiveDate, time: NaiveDateTime) -> PositionRecord {
        PositionRecord {
            date,
            time,
            inst_id: self.inst_id.clone(),
            direction: "long".to_string(),
            cost_price: self.cost_price(),
            last_price: self.last_price(),
            volume: self.volume(),
            avail_vol: self.available(),
            amt: self.market_value(),
            pnl: self.pnl(),
            account: account.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, d).unwrap()
    }

    fn noon(d: u32) -> NaiveDateTime {
        day(d).and_hms_opt(12, 0, 0).unwrap()
    }

    fn dividend_action(reg: u32, cash: f64, stock: f64) -> CorporateAction {
        CorporateAction {
            inst_id: "600000.SH".to_string(),
            ex_date: day(reg + 1),
            registration_date: day(reg),
            close_price: 10.0,
            cash_dividend: cash,
            stock_dividend_ratio: stock,
            rights_ratio: 0.0,
            rights_price: 0.0,
            exchange_ratio: 0.0,
            exchange_target: None,
            ex_price: None,
        }
    }

    fn settled_position(volume: f64, price: f64) -> Position {
        let mut position = Position::new("600000.SH", day(1));
        position.trade(Direction::Buy, volume, price, true);
        position.settle(day(1), price, &[], 0.0);
        position
    }

    #[test]
    fn buys_are_not_sell_available_until_settlement() {
        let mut position = Position::new("600000.SH", day(1));
        let delta = position.trade(Direction::Buy, 1000.0, 10.0, true);
        assert_eq!(delta, PositionDelta { market_value: 10_000.0, pnl: 0.0 });
        assert_eq!(position.available(), 0.0);
        assert!(position.freeze(1000.0).is_err());

        let outcome = position.settle(day(1), 10.5, &[], 0.0);
        assert!(outcome.keep);
        assert_eq!(outcome.delta.market_value, 500.0);
        assert!(position.today.is_empty());
        assert_eq!(position.history.volume, 1000.0);
        assert_eq!(position.available(), 1000.0);
        assert_eq!(position.history.open_price, 10.0);
        assert_eq!(position.history.last_price, 10.5);
        assert!(position.freeze(1000.0).is_ok());
    }

    #[test]
    fn t_plus_zero_buys_are_available_immediately() {
        let mut position = Position::new("600000.SH", day(1));
        position.trade(Direction::Buy, 200.0, 5.0, false);
        assert_eq!(position.available(), 200.0);
        assert!(position.today.is_empty());
    }

    #[test]
    fn weighted_average_cost_is_rounded() {
        let mut position = Position::new("600000.SH", day(1));
        position.trade(Direction::Buy, 300.0, 10.0, true);
        let delta = position.trade(Direction::Buy, 400.0, 10.333333, true);
        // The existing 300 shares are marked to the new fill price first.
        assert!((delta.pnl - 300.0 * 0.333333).abs() < 1e-9);
        assert_eq!(position.today.open_price, round_to((3000.0 + 4133.3332) / 700.0, 6));
    }

    #[test]
    fn sell_realizes_pnl_against_last_mark() {
        let mut position = settled_position(1000.0, 10.0);
        position.freeze(400.0).unwrap();
        let delta = position.trade(Direction::Sell, 400.0, 11.0, true);
        assert_eq!(delta.market_value, -4000.0);
        assert_eq!(delta.pnl, 400.0);
        assert_eq!(position.history.volume, 600.0);
        assert_eq!(position.available(), 600.0);
        assert_eq!(position.history.cost_amt, 6000.0);
        assert!(position.available() <= position.history.volume);
    }

    #[test]
    fn selling_out_resets_prices_and_drops_at_settlement() {
        let mut position = settled_position(100.0, 10.0);
        position.freeze(100.0).unwrap();
        position.trade(Direction::Sell, 100.0, 12.0, true);
        assert_eq!(position.history.open_price, 0.0);
        assert_eq!(position.history.last_price, 0.0);
        assert_eq!(position.history.cost_amt, 0.0);
        let outcome = position.settle(day(2), 12.0, &[], 0.0);
        assert!(!outcome.keep);
    }

    #[test]
    fn calc_pnl_marks_both_ledgers() {
        let mut position = settled_position(100.0, 10.0);
        position.trade(Direction::Buy, 100.0, 10.0, true);
        let delta = position.calc_pnl(noon(2), 11.0);
        assert_eq!(delta, PositionDelta::marked(200.0));
        assert_eq!(position.today.last_price, 11.0);
        assert_eq!(position.history.last_price, 11.0);
        assert_eq!(position.pnl(), 200.0);
    }

    #[test]
    fn dividend_and_bonus_shares_preserve_value() {
        let mut position = settled_position(1000.0, 10.0);
        let actions = vec![dividend_action(2, 0.5, 0.2)];
        let outcome = position.settle(day(2), 10.0, &actions, 0.1);
        let dividend = outcome.dividend.unwrap();
        assert_eq!(dividend.cash, 500.0);
        assert_eq!(dividend.tax, 50.0);
        assert_eq!(position.history.volume, 1200.0);
        assert!((position.history.last_price - 9.5 / 1.2).abs() < 1e-9);
        // Value before (10000) equals value after plus cash paid out.
        assert!(outcome.delta.market_value.abs() < 1e-6);
        assert_eq!(position.history.cost_amt, 9500.0);
    }

    #[test]
    fn corporate_action_is_consumed_once() {
        let mut position = settled_position(1000.0, 10.0);
        let action = dividend_action(2, 0.5, 0.0);
        let actions = vec![action.clone(), action];
        assert!(position.settle(day(2), 10.0, &actions, 0.0).dividend.is_some());
        assert!(position.settle(day(2), 9.5, &actions, 0.0).dividend.is_none());
        assert!(position.settle(day(3), 9.5, &actions, 0.0).applied.is_none());
        assert_eq!(position.history.volume, 1000.0);
        assert_eq!(position.last_action_date(), Some(day(2)));
    }

    #[test]
    fn only_one_action_applies_per_settlement() {
        let mut position = settled_position(1000.0, 10.0);
        let actions = vec![dividend_action(2, 0.1, 0.0), dividend_action(3, 0.2, 0.0)];
        let first = position.settle(day(4), 10.0, &actions, 0.0);
        assert_eq!(first.applied.unwrap().registration_date, day(2));
        let second = position.settle(day(5), 9.9, &actions, 0.0);
        assert_eq!(second.applied.unwrap().registration_date, day(3));
    }

    #[test]
    fn actions_registered_before_opening_are_skipped() {
        let mut position = Position::new("600000.SH", day(10));
        position.trade(Direction::Buy, 100.0, 10.0, true);
        let actions = vec![dividend_action(5, 1.0, 0.0)];
        let outcome = position.settle(day(10), 10.0, &actions, 0.0);
        assert!(outcome.applied.is_none());
        assert_eq!(position.history.volume, 100.0);
    }

    #[test]
    fn share_exchange_moves_the_whole_holding() {
        let mut position = settled_position(1000.0, 10.0);
        let mut action = dividend_action(2, 0.5, 0.0);
        action.exchange_ratio = 2.0;
        action.exchange_target = Some("601000.sh".to_string());
        let outcome = position.settle(day(2), 10.0, &[action], 0.0);
        assert!(!outcome.keep);
        assert!(outcome.dividend.is_none());
        let exchange = outcome.exchange.unwrap();
        assert_eq!(exchange.target, "601000.SH");
        assert_eq!(exchange.position.volume, 2000.0);
        assert_eq!(exchange.position.last_price, 5.0);
        assert_eq!(exchange.position.cost_amt, 10_000.0);
        assert_eq!(exchange.cash_in_lieu, 0.0);
        assert_eq!(outcome.delta.market_value, -10_000.0);
        assert_eq!(outcome.delta.pnl, -10_000.0);

        let mut target = Position::new("601000.SH", day(2));
        let arriving = target.absorb(exchange.position);
        assert_eq!(arriving.market_value, 10_000.0);
        assert_eq!(target.available(), 2000.0);
        assert_eq!(target.history.open_price, 5.0);
    }

    #[test]
    fn fractional_exchange_pays_cash_in_lieu() {
        let mut position = settled_position(1000.0, 10.0);
        let mut action = dividend_action(2, 0.0, 0.0);
        action.exchange_ratio = 1.2345;
        action.exchange_target = Some("601000.SH".to_string());
        let outcome = position.settle(day(2), 10.0, &[action], 0.0);
        let exchange = outcome.exchange.unwrap();
        assert_eq!(exchange.position.volume, 1234.0);
        let price = 10.0 / 1.2345;
        assert!((exchange.cash_in_lieu - 0.5 * price).abs() < 1e-6);
        // The full old value leaves the position ledger.
        assert_eq!(outcome.delta.market_value, -10_000.0);
        let value_after = exchange.position.market_value() + exchange.cash_in_lieu;
        assert!((value_after - 10_000.0).abs() < 1e-6);
        assert!((outcome.delta.pnl + exchange.position.market_value()).abs() < 1e-6);
    }

    #[test]
    fn exchange_uses_quoted_ex_price() {
        let mut position = settled_position(1000.0, 10.0);
        let mut action = dividend_action(2, 0.0, 0.0);
        action.exchange_ratio = 0.5;
        action.exchange_target = Some("601000.SH".to_string());
        action.ex_price = Some(21.0);
        let outcome = position.settle(day(2), 10.0, &[action], 0.0);
        let exchange = outcome.exchange.unwrap();
        assert_eq!(exchange.position.last_price, 21.0);
        assert_eq!(exchange.position.market_value(), 10_500.0);
        assert_eq!(outcome.delta.market_value, -10_000.0);
    }

    #[test]
    fn adjustment_uses_quoted_ex_price() {
        let mut position = settled_position(1000.0, 10.0);
        let mut action = dividend_action(2, 0.5, 0.0);
        action.ex_price = Some(9.6);
        let outcome = position.settle(day(2), 10.0, &[action], 0.0);
        assert_eq!(position.history.last_price, 9.6);
        // 9600 held plus 500 paid out against 10000 before.
        assert!((outcome.delta.market_value - 100.0).abs() < 1e-6);

        let mut unquoted = settled_position(1000.0, 10.0);
        let mut action = dividend_action(2, 0.5, 0.0);
        action.ex_price = Some(0.0);
        unquoted.settle(day(2), 10.0, &[action], 0.0);
        assert!((unquoted.history.last_price - 9.5).abs() < 1e-9);
    }

    #[test]
    fn absorb_keeps_the_held_price() {
        let mut target = Position::new("601000.SH", day(1));
        target.trade(Direction::Buy, 100.0, 22.0, true);
        target.settle(day(1), 22.0, &[], 0.0);
        let incoming = SubPosition {
            open_price: 20.0,
            last_price: 20.0,
            volume: 500.0,
            available: 500.0,
            cost_amt: 10_000.0,
            pnl: 0.0,
        };
        let arriving = target.absorb(incoming);
        assert_eq!(arriving, PositionDelta::marked(11_000.0));
        assert_eq!(target.last_price(), 22.0);
        assert_eq!(target.volume(), 600.0);
        assert_eq!(target.market_value(), 600.0 * 22.0);
        assert_eq!(target.pnl(), 1000.0);
    }
}
