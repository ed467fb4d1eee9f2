use anyhow::{anyhow, Result as AnyResult};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type OrderId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub inst_id: String,
    pub time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: f64,
}

impl Bar {
    pub fn date(&self) -> NaiveDate {
        self.time.date()
    }
}

/// One timestamp's bars across every subscribed instrument, kept in
/// subscription order.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub time: NaiveDateTime,
    pub bars: Vec<Bar>,
}

impl Snapshot {
    pub fn date(&self) -> NaiveDate {
        self.time.date()
    }

    pub fn get(&self, inst_id: &str) -> Option<&Bar> {
        self.bars.iter().find(|bar| bar.inst_id == inst_id)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.bars.iter().map(|bar| bar.inst_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Direction::Buy),
            "sell" => Ok(Direction::Sell),
            other => Err(anyhow!("Unknown direction '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartDone,
    Done,
    Canceled,
    Rejected,
    Expired,
    PartDonePartCancel,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::PartDone => "part_done",
            OrderStatus::Done => "done",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::PartDonePartCancel => "part_done_part_cancel",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::New | OrderStatus::PartDone)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ex-dividend / rights event for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateAction {
    pub inst_id: String,
    pub ex_date: NaiveDate,
    pub registration_date: NaiveDate,
    /// Reference close on the registration date.
    #[serde(default)]
    pub close_price: f64,
    #[serde(default)]
    pub cash_dividend: f64,
    #[serde(default)]
    pub stock_dividend_ratio: f64,
    #[serde(default)]
    pub rights_ratio: f64,
    #[serde(default)]
    pub rights_price: f64,
    #[serde(default)]
    pub exchange_ratio: f64,
    #[serde(default)]
    pub exchange_target: Option<String>,
    #[serde(default)]
    pub ex_price: Option<f64>,
}

impl CorporateAction {
    pub fn is_share_exchange(&self) -> bool {
        self.exchange_target
            .as_deref()
            .map(|target| !target.trim().is_empty())
            .unwrap_or(false)
            && self.exchange_ratio > 0.0
    }

    /// Divisor applied to pre-event prices: `1 + stock ratio + rights ratio`.
    pub fn share_multiplier(&self) -> f64 {
        1.0 + self.stock_dividend_ratio.max(0.0) + self.rights_ratio.max(0.0)
    }

    /// Ex-adjusted price for a pre-event reference price.
    pub fn adjust_price(&self, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        let adjusted =
            (price - self.cash_dividend + self.rights_ratio * self.rights_price) / self.share_multiplier();
        adjusted.max(0.0)
    }
}

// Persisted records. Field order is the column order downstream tooling reads.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub date: NaiveDate,
    pub account: String,
    pub order_id: OrderId,
    pub time: NaiveDateTime,
    pub inst_id: String,
    pub side: String,
    pub pos_side: String,
    pub trans_type: String,
    pub order_price: f64,
    pub order_qty: f64,
    pub trade_price: f64,
    pub trade_qty: f64,
    pub commission: f64,
    pub status: String,
    pub reject_reason: String,
}

impl OrderRecord {
    pub const COLUMNS: [&'static str; 15] = [
        "date",
        "account",
        "order-id",
        "time",
        "inst-id",
        "side",
        "pos-side",
        "trans-type",
        "order-price",
        "order-qty",
        "trade-price",
        "trade-qty",
        "commission",
        "status",
        "reject-reason",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub date: NaiveDate,
    pub time: NaiveDateTime,
    pub inst_id: String,
    pub direction: String,
    pub cost_price: f64,
    pub last_price: f64,
    pub volume: f64,
    pub avail_vol: f64,
    pub amt: f64,
    pub pnl: f64,
    pub account: String,
}

impl PositionRecord {
    pub const COLUMNS: [&'static str; 11] = [
        "date",
        "time",
        "inst-id",
        "direction",
        "cost-price",
        "last-price",
        "volume",
        "avail-vol",
        "amt",
        "pnl",
        "account",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub date: NaiveDate,
    pub time: NaiveDateTime,
    pub market_val: f64,
    pub margin: f64,
    pub fund_avail: f64,
    pub total_asset: f64,
    pub profit: f64,
    pub commission: f64,
    pub account: String,
    pub mode: String,
}

impl AssetRecord {
    pub const COLUMNS: [&'static str; 10] = [
        "date",
        "time",
        "market-val",
        "margin",
        "fund-avail",
        "total-asset",
        "profit",
        "commission",
        "account",
        "mode",
    ];
}

pub fn parse_date(raw: &str) -> AnyResult<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y%m%d"))
        .map_err(|_| anyhow!("Invalid date '{}', expected YYYY-MM-DD or YYYYMMDD", raw))
}

/// Rounds to `places` decimals, half away from zero.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Floors to `places` decimals, tolerating representation error just below the boundary.
pub fn floor_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    ((value * factor) + 1e-9).floor() / factor
}
