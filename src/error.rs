use crate::models::{OrderId, OrderStatus};
use thiserror::Error;

/// Errors raised while creating, admitting or mutating an order.
///
/// The admission variants are recoverable: the order is marked rejected and
/// the run continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    #[error("invalid order quantity")]
    InvalidOrderQty,
    #[error("limit order requires a positive price")]
    InvalidOrderPriceLimit,
    #[error("insufficient cash: required {required:.2}, available {available:.2}")]
    InsufficientCash { required: f64, available: f64 },
    #[error("insufficient position: required {required}, available {available}")]
    InsufficientPosition { required: f64, available: f64 },
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),
    #[error("order {id} is already {status}")]
    OrderTerminal { id: OrderId, status: OrderStatus },
    #[error("order {id} trade of {requested} exceeds remaining {remaining}")]
    Overfill {
        id: OrderId,
        requested: f64,
        remaining: f64,
    },
    #[error("unknown instrument {0}")]
    UnknownInstrument(String),
}
