use crate::account::Account;
use crate::error::OrderError;
use crate::models::{Direction, OrderId, OrderType, Snapshot};
use crate::order::Transition;
use crate::settlement::SettlementReport;
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use log::debug;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Pure numeric callback: ordered indicator values in, ordered outputs out.
pub trait Evaluator: Send {
    fn evaluate(&self, inputs: &[f64]) -> Vec<f64>;
}

impl<F> Evaluator for F
where
    F: Fn(&[f64]) -> Vec<f64> + Send,
{
    fn evaluate(&self, inputs: &[f64]) -> Vec<f64> {
        self(inputs)
    }
}

/// `tanh(bias + Σ wᵢ·xᵢ)` with the genome laid out as `[bias, w₁, …, wₙ]`.
#[derive(Debug, Clone)]
pub struct LinearEvaluator {
    bias: f64,
    weights: Vec<f64>,
}

impl LinearEvaluator {
    pub fn from_genome(genome: &[f64]) -> Result<Self> {
        let Some((bias, weights)) = genome.split_first() else {
            return Err(anyhow!("Genome must contain at least a bias term"));
        };
        if let Some(bad) = genome.iter().find(|value| !value.is_finite()) {
            return Err(anyhow!("Genome contains a non-finite gene {}", bad));
        }
        Ok(Self {
            bias: *bias,
            weights: weights.to_vec(),
        })
    }

    pub fn inputs(&self) -> usize {
        self.weights.len()
    }
}

impl Evaluator for LinearEvaluator {
    fn evaluate(&self, inputs: &[f64]) -> Vec<f64> {
        let sum: f64 = self
            .weights
            .iter()
            .zip(inputs)
            .map(|(weight, input)| weight * input)
            .sum();
        vec![(self.bias + sum).tanh()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionChecks {
    pub cash: bool,
    pub position: bool,
}

impl Default for AdmissionChecks {
    fn default() -> Self {
        Self {
            cash: true,
            position: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrderStats {
    pub placed: usize,
    pub rejected: usize,
}

/// What a strategy may do while handling one snapshot.
pub struct OrderContext<'a> {
    account: &'a mut Account,
    snapshot: &'a Snapshot,
    checks: AdmissionChecks,
    stats: &'a mut OrderStats,
}

impl<'a> OrderContext<'a> {
    pub fn new(
        account: &'a mut Account,
        snapshot: &'a Snapshot,
        checks: AdmissionChecks,
        stats: &'a mut OrderStats,
    ) -> Self {
        Self {
            account,
            snapshot,
            checks,
            stats,
        }
    }

    pub fn time(&self) -> NaiveDateTime {
        self.snapshot.time
    }

    pub fn snapshot(&self) -> &Snapshot {
        self.snapshot
    }

    pub fn account(&self) -> &Account {
        self.account
    }

    pub fn place(
        &mut self,
        inst_id: &str,
        qty: f64,
        price: Option<f64>,
        direction: Direction,
        order_type: OrderType,
    ) -> Result<OrderId, OrderError> {
        let time = self.snapshot.time;
        let result = self
            .account
            .new_order(inst_id, qty, price, direction, order_type, time)
            .and_then(|order| {
                self.account
                    .insert(order, self.checks.cash, self.checks.position)
            });
        match &result {
            Ok(_) => self.stats.placed += 1,
            Err(_) => self.stats.rejected += 1,
        }
        result
    }

    pub fn buy(&mut self, inst_id: &str, qty: f64, price: Option<f64>, order_type: OrderType) -> Result<OrderId, OrderError> {
        self.place(inst_id, qty, price, Direction::Buy, order_type)
    }

    pub fn sell(&mut self, inst_id: &str, qty: f64, price: Option<f64>, order_type: OrderType) -> Result<OrderId, OrderError> {
        self.place(inst_id, qty, price, Direction::Sell, order_type)
    }

    pub fn cancel(&mut self, id: OrderId) -> Result<Transition, OrderError> {
        self.account.cancel(id, self.snapshot.time)
    }

    /// Whole-lot quantity that `budget` buys at `price`, commission included.
    pub fn lot_qty(&mut self, inst_id: &str, budget: f64, price: f64) -> f64 {
        if budget <= 0.0 || price <= 0.0 {
            return 0.0;
        }
        let Ok(contract) = self.account.resolve_contract(inst_id) else {
            return 0.0;
        };
        let lot = contract.lot_size();
        let mut qty = contract.calc_max_qty(budget / price);
        while qty > 0.0 && qty * price + contract.calc_comm(qty, price, Direction::Buy) > budget {
            qty -= lot;
        }
        qty.max(0.0)
    }
}

pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Called once per snapshot between the open and close matching passes.
    /// Admission errors are for the strategy to handle; an `Err` aborts the run.
    fn on_snapshot(&mut self, ctx: &mut OrderContext<'_>) -> Result<()>;

    fn on_day_settled(&mut self, _report: &SettlementReport) {}
}

/// Buys every instrument once with an equal share of cash, then holds.
#[derive(Debug, Default)]
pub struct BuyAndHoldStrategy {
    bought: HashSet<String>,
}

impl BuyAndHoldStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for BuyAndHoldStrategy {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    fn on_snapshot(&mut self, ctx: &mut OrderContext<'_>) -> Result<()> {
        let pending: Vec<(String, f64)> = ctx
            .snapshot()
            .bars
            .iter()
            .filter(|bar| !self.bought.contains(&bar.inst_id))
            .map(|bar| (bar.inst_id.clone(), bar.close))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let share = ctx.account().asset().available / pending.len() as f64;
        for (inst_id, close) in pending {
            let qty = ctx.lot_qty(&inst_id, share, close);
            if qty <= 0.0 {
                continue;
            }
            match ctx.buy(&inst_id, qty, Some(close), OrderType::Market) {
                Ok(_) => {
                    self.bought.insert(inst_id);
                }
                Err(err) => debug!("buy_and_hold: {} not bought: {}", inst_id, err),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSettings {
    /// Output magnitude needed to act.
    pub threshold: f64,
    /// Share of available cash committed per entry.
    pub allocation: f64,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            allocation: 0.2,
        }
    }
}

/// Feeds trailing close-to-close returns to an [`Evaluator`]; a first output
/// above the threshold opens a position, below its negative closes it.
pub struct SignalStrategy {
    evaluator: Box<dyn Evaluator>,
    lookback: usize,
    settings: SignalSettings,
    closes: HashMap<String, VecDeque<f64>>,
}

impl SignalStrategy {
    pub fn new(evaluator: Box<dyn Evaluator>, lookback: usize, settings: SignalSettings) -> Self {
        Self {
            evaluator,
            lookback: lookback.max(1),
            settings,
            closes: HashMap::new(),
        }
    }

    pub fn from_genome(genome: &[f64], settings: SignalSettings) -> Result<Self> {
        let evaluator = LinearEvaluator::from_genome(genome)?;
        let lookback = evaluator.inputs();
        Ok(Self::new(Box::new(evaluator), lookback, settings))
    }

    fn features(&mut self, inst_id: &str, close: f64) -> Option<Vec<f64>> {
        let window = self.closes.entry(inst_id.to_string()).or_default();
        window.push_back(close);
        while window.len() > self.lookback + 1 {
            window.pop_front();
        }
        if window.len() <= self.lookback {
            return None;
        }
        let latest = close;
        Some(
            (1..=self.lookback)
                .map(|lag| {
                    let past = window[window.len() - 1 - lag];
                    if past > 0.0 {
                        latest / past - 1.0
                    } else {
                        0.0
                    }
                })
                .collect(),
        )
    }
}

impl Strategy for SignalStrategy {
    fn name(&self) -> &str {
        "signal"
    }

    fn on_snapshot(&mut self, ctx: &mut OrderContext<'_>) -> Result<()> {
        let bars: Vec<(String, f64)> = ctx
            .snapshot()
            .bars
            .iter()
            .map(|bar| (bar.inst_id.clone(), bar.close))
            .collect();

        for (inst_id, close) in bars {
            let Some(inputs) = self.features(&inst_id, close) else {
                continue;
            };
            let signal = self
                .evaluator
                .evaluate(&inputs)
                .first()
                .copied()
                .filter(|value| value.is_finite())
                .unwrap_or(0.0);
            if !ctx.account().open_orders(&inst_id).is_empty() {
                continue;
            }
            let held = ctx
                .account()
                .position(&inst_id)
                .map(|position| (position.volume(), position.available()))
                .unwrap_or((0.0, 0.0));

            if signal >= self.settings.threshold && held.0 <= 0.0 {
                let budget = ctx.account().asset().available * self.settings.allocation;
                let qty = ctx.lot_qty(&inst_id, budget, close);
                if qty > 0.0 {
                    if let Err(err) = ctx.buy(&inst_id, qty, Some(close), OrderType::Market) {
                        debug!("signal: buy {} rejected: {}", inst_id, err);
                    }
                }
            } else if signal <= -self.settings.threshold && held.1 > 0.0 {
                if let Err(err) = ctx.sell(&inst_id, held.1, Some(close), OrderType::Market) {
                    debug!("signal: sell {} rejected: {}", inst_id, err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractTable, FeeSchedule};
    use crate::models::Bar;
    use chrono::NaiveDate;

    fn snapshot(day: u32, closes: &[(&str, f64)]) -> Snapshot {
        let time = NaiveDate::from_ymd_opt(2021, 8, day)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        Snapshot {
            time,
            bars: closes
                .iter()
                .map(|(inst, close)| Bar {
                    inst_id: inst.to_string(),
                    time,
                    open: *close,
                    high: *close,
                    low: *close,
                    close: *close,
                    volume: 1e6,
                    amount: 1e6 * close,
                })
                .collect(),
        }
    }

    fn account() -> Account {
        Account::new("s", 100_000.0, ContractTable::stock(FeeSchedule::default()))
    }

    #[test]
    fn linear_evaluator_is_bounded() {
        let evaluator = LinearEvaluator::from_genome(&[0.0, 100.0]).unwrap();
        assert_eq!(evaluator.inputs(), 1);
        let out = evaluator.evaluate(&[1.0]);
        assert!(out[0] <= 1.0 && out[0] > 0.99);
        assert!(LinearEvaluator::from_genome(&[]).is_err());
        assert!(LinearEvaluator::from_genome(&[f64::NAN]).is_err());
    }

    #[test]
    fn closures_are_evaluators() {
        let doubler = |inputs: &[f64]| inputs.iter().map(|x| x * 2.0).collect::<Vec<f64>>();
        assert_eq!(doubler.evaluate(&[1.0, 2.0]), vec![2.0, 4.0]);
    }

    #[test]
    fn buy_and_hold_buys_each_instrument_once() {
        let mut account = account();
        let mut stats = OrderStats::default();
        let mut strategy = BuyAndHoldStrategy::new();
        let first = snapshot(2, &[("600000.SH", 10.0), ("000001.SZ", 20.0)]);
        {
            let mut ctx = OrderContext::new(&mut account, &first, AdmissionChecks::default(), &mut stats);
            strategy.on_snapshot(&mut ctx).unwrap();
        }
        assert_eq!(stats.placed, 2);
        assert_eq!(account.open_orders("600000.SH").len(), 1);
        let order = account.order(account.open_orders("000001.SZ")[0]).unwrap();
        assert_eq!(order.qty, 2400.0);
        {
            let mut ctx = OrderContext::new(&mut account, &first, AdmissionChecks::default(), &mut stats);
            strategy.on_snapshot(&mut ctx).unwrap();
        }
        assert_eq!(stats.placed, 2);
    }

    #[test]
    fn signal_strategy_waits_for_lookback_then_buys() {
        let mut account = account();
        let mut stats = OrderStats::default();
        let mut strategy = SignalStrategy::new(
            Box::new(|inputs: &[f64]| vec![inputs[0].signum()]),
            1,
            SignalSettings::default(),
        );
        let first = snapshot(2, &[("600000.SH", 10.0)]);
        let mut ctx = OrderContext::new(&mut account, &first, AdmissionChecks::default(), &mut stats);
        strategy.on_snapshot(&mut ctx).unwrap();
        assert_eq!(stats.placed, 0);

        let second = snapshot(3, &[("600000.SH", 11.0)]);
        let mut ctx = OrderContext::new(&mut account, &second, AdmissionChecks::default(), &mut stats);
        strategy.on_snapshot(&mut ctx).unwrap();
        assert_eq!(stats.placed, 1);
        let id = account.open_orders("600000.SH")[0];
        // 20% of 100k at 11 is 1818 shares, rounded down to whole lots.
        assert_eq!(account.order(id).unwrap().qty, 1800.0);
    }

    #[test]
    fn rejected_orders_are_counted() {
        let mut account = account();
        let mut stats = OrderStats::default();
        let bar = snapshot(2, &[("600000.SH", 10.0)]);
        let mut ctx = OrderContext::new(&mut account, &bar, AdmissionChecks::default(), &mut stats);
        let err = ctx.sell("600000.SH", 100.0, Some(10.0), OrderType::Limit).unwrap_err();
        assert!(matches!(err, OrderError::InsufficientPosition { .. }));
        assert!(ctx.buy("600000.SH", 0.0, Some(10.0), OrderType::Limit).is_err());
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.placed, 0);
    }
}
