pub mod backtest;
pub mod inspect_data;

use anyhow::{anyhow, Result};
use std::path::Path;

pub fn ensure_file_exists(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    Err(anyhow!("{} not found at {}", what, path.display()))
}
