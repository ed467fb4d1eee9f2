pub mod account;
pub mod backtester;
pub mod commands;
pub mod config;
pub mod contract;
pub mod corporate_action;
pub mod error;
pub mod matcher;
pub mod models;
pub mod order;
pub mod position;
pub mod quote;
pub mod recorder;
pub mod registry;
pub mod run;
pub mod settlement;
pub mod strategy;
