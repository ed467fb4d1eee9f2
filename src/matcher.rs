use crate::account::Account;
use crate::models::{Bar, Direction, OrderId, OrderStatus, OrderType};
use log::{debug, warn};
use std::fmt;

const PRICE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatchSettings {
    /// Slippage in ticks.
    pub slippage: f64,
    /// Caps a single fill at this share of the bar's volume.
    pub max_volume_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: OrderId,
    pub inst_id: String,
    pub direction: Direction,
    pub price: f64,
    pub qty: f64,
    pub status: OrderStatus,
}

/// Fill-price policy. A bar passes through `on_bar_open` before the strategy
/// sees it and through `on_bar_close` after.
pub trait Matcher: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    fn on_bar_open(&self, _account: &mut Account, _bar: &Bar) -> Vec<Fill> {
        Vec::new()
    }

    fn on_bar_close(&self, _account: &mut Account, _bar: &Bar) -> Vec<Fill> {
        Vec::new()
    }
}

/// Fills at the close of the bar the order was placed on.
#[derive(Debug, Clone)]
pub struct CurrentBarMatcher {
    settings: MatchSettings,
}

impl CurrentBarMatcher {
    pub fn new(settings: MatchSettings) -> Self {
        Self { settings }
    }
}

impl Matcher for CurrentBarMatcher {
    fn name(&self) -> &'static str {
        "current_bar"
    }

    fn on_bar_close(&self, account: &mut Account, bar: &Bar) -> Vec<Fill> {
        match_orders(account, bar, bar.close, &self.settings, None)
    }
}

/// Fills at the open of the bar after the one the order was placed on.
#[derive(Debug, Clone)]
pub struct NextBarMatcher {
    settings: MatchSettings,
}

impl NextBarMatcher {
    pub fn new(settings: MatchSettings) -> Self {
        Self { settings }
    }
}

impl Matcher for NextBarMatcher {
    fn name(&self) -> &'static str {
        "next_bar"
    }

    fn on_bar_open(&self, account: &mut Account, bar: &Bar) -> Vec<Fill> {
        match_orders(account, bar, bar.open, &self.settings, Some(bar))
    }
}

fn match_orders(
    account: &mut Account,
    bar: &Bar,
    price: f64,
    settings: &MatchSettings,
    placed_before: Option<&Bar>,
) -> Vec<Fill> {
    let mut fills = Vec::new();
    if !price.is_finite() || price <= 0.0 {
        return fills;
    }
    let Some(contract) = account.contract(&bar.inst_id) else {
        return fills;
    };

    let mut volume_left = settings
        .max_volume_ratio
        .map(|ratio| (bar.volume * ratio).max(0.0));

    for id in account.open_orders(&bar.inst_id) {
        let Some(order) = account.order(id) else {
            continue;
        };
        if order.is_executed() {
            continue;
        }
        if let Some(cutoff) = placed_before {
            if order.create_time >= cutoff.time {
                continue;
            }
        }

        let direction = order.direction;
        let fill_price = contract.calc_slip_price(price, settings.slippage, direction);
        if order.order_type == OrderType::Limit {
            let crosses = match direction {
                Direction::Buy => fill_price <= order.price + PRICE_EPSILON,
                Direction::Sell => fill_price + PRICE_EPSILON >= order.price,
            };
            if !crosses {
                continue;
            }
        }

        let mut qty = order.remaining();
        if let Some(left) = volume_left {
            let cap = contract.calc_max_qty(left);
            if cap < qty {
                qty = cap;
            }
        }
        qty = match direction {
            Direction::Buy => account.affordable_qty(id, fill_price, qty),
            Direction::Sell => {
                let held = account
                    .position(&bar.inst_id)
                    .map(|position| position.history.volume)
                    .unwrap_or(0.0);
                qty.min(held)
            }
        };
        if qty <= 0.0 {
            continue;
        }

        match account.trade(id, fill_price, qty, bar.time) {
            Ok(transition) => {
                if let Some(left) = volume_left.as_mut() {
                    *left = (*left - qty).max(0.0);
                }
                fills.push(Fill {
                    order_id: id,
                    inst_id: bar.inst_id.clone(),
                    direction,
                    price: fill_price,
                    qty,
                    status: transition.to,
                });
            }
            Err(err) => {
                warn!(
                    "{}: fill for order {} on {} skipped: {}",
                    account.name(),
                    id,
                    bar.inst_id,
                    err
                );
            }
        }
    }

    if !fills.is_empty() {
        debug!(
            "{}: {} fill(s) on {} at {}",
            account.name(),
            fills.len(),
            bar.inst_id,
            bar.time
        );
    }
    fills
}
