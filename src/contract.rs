use crate::models::{floor_to, round_to, Direction};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const STOCK_LOT_SIZE: f64 = 100.0;
pub const STOCK_TICK_SIZE: f64 = 0.01;

const QTY_EPSILON: f64 = 1e-9;

/// Static per-instrument trading capability.
pub trait Contract: Send + Sync + fmt::Debug {
    fn inst_id(&self) -> &str;
    fn lot_size(&self) -> f64;
    fn tick_size(&self) -> f64;
    fn fees(&self) -> &FeeSchedule;

    /// Whether shares bought today only become sellable after settlement.
    fn t_plus_one(&self) -> bool {
        true
    }

    fn calc_comm(&self, qty: f64, price: f64, direction: Direction) -> f64;
    fn calc_market_value(&self, qty: f64, price: f64, direction: Direction) -> f64;
    fn calc_margin(&self, qty: f64, price: f64, direction: Direction) -> f64;
    fn calc_slip_price(&self, price: f64, slippage: f64, direction: Direction) -> f64;
    /// Rounds down to whole lots; 0 when below the minimum order volume.
    fn calc_max_qty(&self, qty: f64) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub transfer_fee_rate: f64,
    pub broker_rate: f64,
    pub min_fee: f64,
    /// Stamp tax, charged on sells only.
    pub tax_rate: f64,
    pub dividend_tax_rate: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            transfer_fee_rate: 0.00001,
            broker_rate: 0.0003,
            min_fee: 5.0,
            tax_rate: 0.001,
            dividend_tax_rate: 0.0,
        }
    }
}

impl FeeSchedule {
    pub fn stock_commission(&self, amount: f64, direction: Direction) -> f64 {
        if amount <= 0.0 || !amount.is_finite() {
            return 0.0;
        }
        let transfer = round_to(self.transfer_fee_rate * amount, 2);
        let tax = match direction {
            Direction::Sell => self.tax_rate * amount,
            Direction::Buy => 0.0,
        };
        let brokerage = (self.broker_rate * amount).max(self.min_fee);
        floor_to(transfer + tax + brokerage, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Shanghai,
    Shenzhen,
}

/// Parses `600000.SH` style codes, returning the normalized code and its exchange.
pub fn parse_instrument_code(raw: &str) -> Result<(String, Exchange)> {
    let normalized = raw.trim().to_uppercase();
    let Some((symbol, suffix)) = normalized.split_once('.') else {
        return Err(anyhow!(
            "Instrument code '{}' must look like 600000.SH or 000001.SZ",
            raw
        ));
    };
    if symbol.len() != 6 || !symbol.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!(
            "Instrument code '{}' must have a 6 digit symbol",
            raw
        ));
    }
    let exchange = match suffix {
        "SH" => Exchange::Shanghai,
        "SZ" => Exchange::Shenzhen,
        other => {
            return Err(anyhow!(
                "Instrument code '{}' has unknown exchange suffix '{}'",
                raw,
                other
            ))
        }
    };
    Ok((normalized, exchange))
}

#[derive(Debug, Clone)]
pub struct StockContract {
    inst_id: String,
    fees: FeeSchedule,
    lot_size: f64,
    tick_size: f64,
    t_plus_one: bool,
}

impl StockContract {
    pub fn new(inst_id: &str, fees: FeeSchedule) -> Result<Self> {
        let (inst_id, _) = parse_instrument_code(inst_id)?;
        Ok(Self {
            inst_id,
            fees,
            lot_size: STOCK_LOT_SIZE,
            tick_size: STOCK_TICK_SIZE,
            t_plus_one: true,
        })
    }

    pub fn with_t_plus_one(mut self, enabled: bool) -> Self {
        self.t_plus_one = enabled;
        self
    }
}

impl Contract for StockContract {
    fn inst_id(&self) -> &str {
        &self.inst_id
    }

    fn lot_size(&self) -> f64 {
        self.lot_size
    }

    fn tick_size(&self) -> f64 {
        self.tick_size
    }

    fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    fn t_plus_one(&self) -> bool {
        self.t_plus_one
    }

    fn calc_comm(&self, qty: f64, price: f64, direction: Direction) -> f64 {
        if qty <= 0.0 || price <= 0.0 {
            return 0.0;
        }
        self.fees.stock_commission(qty * price, direction)
    }

    fn calc_market_value(&self, qty: f64, price: f64, _direction: Direction) -> f64 {
        qty * price
    }

    fn calc_margin(&self, qty: f64, price: f64, direction: Direction) -> f64 {
        // Cash equities are fully funded.
        self.calc_market_value(qty, price, direction)
    }

    fn calc_slip_price(&self, price: f64, slippage: f64, direction: Direction) -> f64 {
        let slipped = price + direction.sign() * self.tick_size * slippage;
        round_to(slipped.max(self.tick_size), 6)
    }

    fn calc_max_qty(&self, qty: f64) -> f64 {
        if qty <= 0.0 || !qty.is_finite() {
            return 0.0;
        }
        let lots = (qty / self.lot_size + QTY_EPSILON).floor();
        let rounded = lots * self.lot_size;
        if rounded < self.lot_size {
            0.0
        } else {
            rounded
        }
    }
}

pub type ContractFactory = Arc<dyn Fn(&str, &FeeSchedule) -> Result<Arc<dyn Contract>> + Send + Sync>;

/// Contracts known to one account, resolving unseen instruments through a factory.
#[derive(Clone)]
pub struct ContractTable {
    contracts: HashMap<String, Arc<dyn Contract>>,
    fees: FeeSchedule,
    factory: ContractFactory,
}

impl fmt::Debug for ContractTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractTable")
            .field("contracts", &self.contracts.keys().collect::<Vec<_>>())
            .field("fees", &self.fees)
            .finish()
    }
}

impl ContractTable {
    pub fn new(fees: FeeSchedule, factory: ContractFactory) -> Self {
        Self {
            contracts: HashMap::new(),
            fees,
            factory,
        }
    }

    pub fn stock(fees: FeeSchedule) -> Self {
        Self::new(fees, stock_contract_factory())
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn get(&self, inst_id: &str) -> Option<Arc<dyn Contract>> {
        self.contracts.get(inst_id).cloned()
    }

    pub fn resolve(&mut self, inst_id: &str) -> Result<Arc<dyn Contract>> {
        if let Some(contract) = self.contracts.get(inst_id) {
            return Ok(contract.clone());
        }
        let contract = (self.factory)(inst_id, &self.fees)?;
        if let Some(existing) = self.contracts.get(contract.inst_id()) {
            return Ok(existing.clone());
        }
        self.insert(contract.clone());
        Ok(contract)
    }

    pub fn insert(&mut self, contract: Arc<dyn Contract>) {
        self.contracts
            .insert(contract.inst_id().to_string(), contract);
    }
}

pub fn stock_contract_factory() -> ContractFactory {
    Arc::new(|inst_id: &str, fees: &FeeSchedule| {
        let contract: Arc<dyn Contract> = Arc::new(StockContract::new(inst_id, fees.clone())?);
        Ok(contract)
    })
}
