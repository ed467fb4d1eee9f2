use crate::contract::{stock_contract_factory, Contract, ContractFactory, FeeSchedule, StockContract};
use crate::matcher::{CurrentBarMatcher, MatchSettings, Matcher, NextBarMatcher};
use crate::quote::{QuoteSource, SnapshotFileSource};
use crate::strategy::{BuyAndHoldStrategy, SignalSettings, SignalStrategy, Strategy};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub type MatcherFactory = Arc<dyn Fn(MatchSettings) -> Box<dyn Matcher> + Send + Sync>;
pub type QuoteSourceFactory = Arc<dyn Fn(&Path) -> Result<Box<dyn QuoteSource>> + Send + Sync>;
pub type StrategyFactory = Arc<dyn Fn(&[f64]) -> Result<Box<dyn Strategy>> + Send + Sync>;

/// Type tag to constructor lookup, built once by the composition root.
#[derive(Clone, Default)]
pub struct Registry {
    contracts: BTreeMap<String, ContractFactory>,
    matchers: BTreeMap<String, MatcherFactory>,
    quote_sources: BTreeMap<String, QuoteSourceFactory>,
    strategies: BTreeMap<String, StrategyFactory>,
}

impl Registry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();

        registry.register_contract("stock", stock_contract_factory());
        registry.register_contract(
            "stock_t0",
            Arc::new(|inst_id: &str, fees: &FeeSchedule| {
                let contract: Arc<dyn Contract> =
                    Arc::new(StockContract::new(inst_id, fees.clone())?.with_t_plus_one(false));
                Ok(contract)
            }),
        );

        registry.register_matcher(
            "current_bar",
            Arc::new(|settings| Box::new(CurrentBarMatcher::new(settings)) as Box<dyn Matcher>),
        );
        registry.register_matcher(
            "next_bar",
            Arc::new(|settings| Box::new(NextBarMatcher::new(settings)) as Box<dyn Matcher>),
        );

        registry.register_quote_source(
            "snapshot",
            Arc::new(|path: &Path| {
                let source: Box<dyn QuoteSource> = Box::new(SnapshotFileSource::open(path)?);
                Ok(source)
            }),
        );

        registry.register_strategy(
            "signal",
            Arc::new(|genome: &[f64]| {
                let strategy: Box<dyn Strategy> =
                    Box::new(SignalStrategy::from_genome(genome, SignalSettings::default())?);
                Ok(strategy)
            }),
        );
        registry.register_strategy(
            "buy_and_hold",
            Arc::new(|_genome: &[f64]| {
                let strategy: Box<dyn Strategy> = Box::new(BuyAndHoldStrategy::new());
                Ok(strategy)
            }),
        );

        registry
    }

    pub fn register_contract(&mut self, tag: &str, factory: ContractFactory) {
        self.contracts.insert(normalize(tag), factory);
    }

    pub fn register_matcher(&mut self, tag: &str, factory: MatcherFactory) {
        self.matchers.insert(normalize(tag), factory);
    }

    pub fn register_quote_source(&mut self, tag: &str, factory: QuoteSourceFactory) {
        self.quote_sources.insert(normalize(tag), factory);
    }

    pub fn register_strategy(&mut self, tag: &str, factory: StrategyFactory) {
        self.strategies.insert(normalize(tag), factory);
    }

    pub fn contract(&self, tag: &str) -> Result<ContractFactory> {
        lookup(&self.contracts, "contract", tag)
    }

    pub fn matcher(&self, tag: &str) -> Result<MatcherFactory> {
        lookup(&self.matchers, "matcher", tag)
    }

    pub fn quote_source(&self, tag: &str) -> Result<QuoteSourceFactory> {
        lookup(&self.quote_sources, "quote source", tag)
    }

    pub fn strategy(&self, tag: &str) -> Result<StrategyFactory> {
        lookup(&self.strategies, "strategy", tag)
    }
}

fn normalize(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

fn lookup<T: Clone>(table: &BTreeMap<String, T>, kind: &str, tag: &str) -> Result<T> {
    table.get(&normalize(tag)).cloned().ok_or_else(|| {
        let known: Vec<&str> = table.keys().map(|key| key.as_str()).collect();
        anyhow!(
            "Unknown {} type '{}' (known: {})",
            kind,
            tag,
            known.join(", ")
        )
    })
}
