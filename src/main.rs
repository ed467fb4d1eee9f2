use anyhow::Result;
use backtest_kernel::commands::{backtest, inspect_data};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "backtest-kernel")]
#[command(about = "Discrete-event equity backtesting kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every genome in the config as its own simulated account
    Backtest {
        /// Path to the JSON backtest config
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
    },
    /// Summarise a market data snapshot file
    InspectData {
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: PathBuf,
    },
}

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting backtest kernel. Simulated fills only; not financial advice.");

    match command {
        Commands::Backtest { config } => {
            backtest::run(&config)?;
        }
        Commands::InspectData { data_file } => {
            inspect_data::run(&data_file)?;
        }
    }

    Ok(())
}
