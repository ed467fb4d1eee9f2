use crate::error::OrderError;
use crate::models::{Direction, OrderId, OrderRecord, OrderStatus, OrderType};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;

pub const QTY_EPSILON: f64 = 1e-6;

/// A status change produced by one order mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub inst_id: String,
    pub direction: Direction,
    pub order_type: OrderType,
    /// Limit price, or the reference price a market order was sized with.
    pub price: f64,
    pub qty: f64,
    /// Commission quoted at admission for the full quantity.
    pub est_commission: f64,
    /// Commission actually charged for the traded quantity.
    pub commission: f64,
    pub trade_price: f64,
    pub trade_qty: f64,
    pub status: OrderStatus,
    pub reject_reason: String,
    pub create_time: NaiveDateTime,
    pub update_time: NaiveDateTime,
    /// Cash still reserved against the unfilled quantity.
    pub frozen_amount: f64,
    pub frozen_commission: f64,
    /// Settled shares reserved by a pending sell.
    pub frozen_qty: f64,
}

impl Order {
    pub fn new(
        id: OrderId,
        inst_id: &str,
        qty: f64,
        price: Option<f64>,
        direction: Direction,
        order_type: OrderType,
        time: NaiveDateTime,
    ) -> Result<Self, OrderError> {
        if !qty.is_finite() || qty <= 0.0 {
            return Err(OrderError::InvalidOrderQty);
        }
        let price = price.filter(|value| value.is_finite()).unwrap_or(0.0);
        if order_type == OrderType::Limit && price <= 0.0 {
            return Err(OrderError::InvalidOrderPriceLimit);
        }

        Ok(Self {
            id,
            inst_id: inst_id.to_string(),
            direction,
            order_type,
            price: price.max(0.0),
            qty,
            est_commission: 0.0,
            commission: 0.0,
            trade_price: 0.0,
            trade_qty: 0.0,
            status: OrderStatus::New,
            reject_reason: String::new(),
            create_time: time,
            update_time: time,
            frozen_amount: 0.0,
            frozen_commission: 0.0,
            frozen_qty: 0.0,
        })
    }

    pub fn remaining(&self) -> f64 {
        (self.qty - self.trade_qty).max(0.0)
    }

    pub fn is_executed(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn amount(&self) -> f64 {
        self.qty * self.price
    }

    fn ensure_open(&self) -> Result<(), OrderError> {
        if self.is_executed() {
            return Err(OrderError::OrderTerminal {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Records a fill, keeping a volume-weighted trade price.
    pub fn trade(
        &mut self,
        price: f64,
        qty: f64,
        time: NaiveDateTime,
    ) -> Result<Transition, OrderError> {
        self.ensure_open()?;
        if !qty.is_finite() || qty <= 0.0 {
            return Err(OrderError::InvalidOrderQty);
        }
        let remaining = self.remaining();
        if qty > remaining + QTY_EPSILON {
            return Err(OrderError::Overfill {
                id: self.id,
                requested: qty,
                remaining,
            });
        }
        let qty = qty.min(remaining);

        let from = self.status;
        let filled = self.trade_qty + qty;
        self.trade_price = (self.trade_price * self.trade_qty + price * qty) / filled;
        self.trade_qty = filled;
        self.update_time = time;
        self.status = if self.remaining() <= QTY_EPSILON {
            self.trade_qty = self.qty;
            OrderStatus::Done
        } else {
            OrderStatus::PartDone
        };

        Ok(Transition {
            from,
            to: self.status,
        })
    }

    pub fn cancel(&mut self, time: NaiveDateTime) -> Result<Transition, OrderError> {
        self.ensure_open()?;
        let from = self.status;
        self.status = match from {
            OrderStatus::PartDone => OrderStatus::PartDonePartCancel,
            _ => OrderStatus::Canceled,
        };
        self.update_time = time;
        Ok(Transition {
            from,
            to: self.status,
        })
    }

    pub fn reject(&mut self, time: NaiveDateTime, reason: &str) -> Result<Transition, OrderError> {
        if self.status != OrderStatus::New || self.trade_qty > 0.0 {
            return Err(OrderError::OrderTerminal {
                id: self.id,
                status: self.status,
            });
        }
        self.status = OrderStatus::Rejected;
        self.reject_reason = reason.to_string();
        self.update_time = time;
        Ok(Transition {
            from: OrderStatus::New,
            to: OrderStatus::Rejected,
        })
    }

    /// Day-end expiry. Returns `None` for orders already terminal.
    pub fn settle(&mut self, time: NaiveDateTime) -> Option<Transition> {
        let from = self.status;
        let to = match from {
            OrderStatus::New => OrderStatus::Expired,
            OrderStatus::PartDone => OrderStatus::PartDonePartCancel,
            _ => return None,
        };
        self.status = to;
        self.update_time = time;
        Some(Transition { from, to })
    }

    pub fn to_record(&self, account: &str, date: NaiveDate) -> OrderRecord {
        OrderRecord {
            date,
            account: account.to_string(),
            order_id: self.id,
            time: self.update_time,
            inst_id: self.inst_id.clone(),
            side: self.direction.as_str().to_string(),
            pos_side: "long".to_string(),
            trans_type: match self.direction {
                Direction::Buy => "open".to_string(),
                Direction::Sell => "close".to_string(),
            },
            order_price: self.price,
            order_qty: self.qty,
            trade_price: self.trade_price,
            trade_qty: self.trade_qty,
            commission: self.commission,
            status: self.status.as_str().to_string(),
            reject_reason: self.reject_reason.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct InstrumentQueues {
    buys: Vec<OrderId>,
    sells: Vec<OrderId>,
}

/// Intraday order queues per instrument and direction, in admission order.
#[derive(Debug, Default, Clone)]
pub struct OrderBook {
    queues: HashMap<String, InstrumentQueues>,
}

impl OrderBook {
    pub fn push(&mut self, inst_id: &str, direction: Direction, id: OrderId) {
        let queues = self.queues.entry(inst_id.to_string()).or_default();
        match direction {
            Direction::Buy => queues.buys.push(id),
            Direction::Sell => queues.sells.push(id),
        }
    }

    pub fn queue(&self, inst_id: &str, direction: Direction) -> &[OrderId] {
        match self.queues.get(inst_id) {
            Some(queues) => match direction {
                Direction::Buy => &queues.buys,
                Direction::Sell => &queues.sells,
            },
            None => &[],
        }
    }

    /// Both queues of one instrument merged back into admission order.
    pub fn orders_for(&self, inst_id: &str) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self
            .queue(inst_id, Direction::Buy)
            .iter()
            .chain(self.queue(inst_id, Direction::Sell))
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every queued order id across instruments, in admission order.
    pub fn all_orders(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self
            .queues
            .values()
            .flat_map(|queues| queues.buys.iter().chain(queues.sells.iter()))
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.queues
            .values()
            .all(|queues| queues.buys.is_empty() && queues.sells.is_empty())
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
