use crate::contract::FeeSchedule;
use crate::matcher::MatchSettings;
use crate::quote::DEFAULT_QUEUE_DEPTH;
use crate::recorder::DEFAULT_RECORDER_BUFFER;
use crate::strategy::AdmissionChecks;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    CurrentBar,
    NextBar,
}

impl MatcherKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "current_bar" | "current" => Ok(Self::CurrentBar),
            "next_bar" | "next" => Ok(Self::NextBar),
            other => Err(anyhow!(
                "MATCHER must be current_bar or next_bar (value: {})",
                other
            )),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::CurrentBar => "current_bar",
            Self::NextBar => "next_bar",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub initial_cash: f64,
    pub fees: FeeSchedule,
    pub slippage_ticks: f64,
    pub matcher: MatcherKind,
    pub queue_depth: usize,
    pub recorder_buffer: usize,
    pub max_volume_ratio: Option<f64>,
    pub check_cash: bool,
    pub check_position: bool,
    pub account_mode: String,
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let initial_cash = require_setting_f64(settings, "INITIAL_CASH", Some(0.0), None)?;
        if initial_cash <= 0.0 {
            return Err(anyhow!(
                "Setting INITIAL_CASH must be > 0 (value: {})",
                initial_cash
            ));
        }
        let defaults = FeeSchedule::default();
        let fees = FeeSchedule {
            transfer_fee_rate: optional_setting_f64(
                settings,
                "TRANSFER_FEE_RATE",
                defaults.transfer_fee_rate,
                Some(0.0),
                Some(1.0),
            )?,
            broker_rate: optional_setting_f64(settings, "BROKER_RATE", defaults.broker_rate, Some(0.0), Some(1.0))?,
            min_fee: optional_setting_f64(settings, "MIN_FEE", defaults.min_fee, Some(0.0), None)?,
            tax_rate: optional_setting_f64(settings, "TAX_RATE", defaults.tax_rate, Some(0.0), Some(1.0))?,
            dividend_tax_rate: optional_setting_f64(
                settings,
                "DIVIDEND_TAX_RATE",
                defaults.dividend_tax_rate,
                Some(0.0),
                Some(1.0),
            )?,
        };
        let slippage_ticks = optional_setting_f64(settings, "SLIPPAGE_TICKS", 0.0, Some(0.0), None)?;
        let matcher = match optional_setting(settings, "MATCHER") {
            Some(raw) => MatcherKind::parse(raw)?,
            None => MatcherKind::CurrentBar,
        };
        let queue_depth = optional_setting_usize(settings, "QUEUE_DEPTH", DEFAULT_QUEUE_DEPTH, 1)?;
        let recorder_buffer =
            optional_setting_usize(settings, "RECORDER_BUFFER", DEFAULT_RECORDER_BUFFER, 1)?;
        let max_volume_ratio = match optional_setting(settings, "MAX_VOLUME_RATIO") {
            Some(_) => {
                let ratio = require_setting_f64(settings, "MAX_VOLUME_RATIO", Some(0.0), Some(1.0))?;
                if ratio <= 0.0 {
                    return Err(anyhow!(
                        "Setting MAX_VOLUME_RATIO must be > 0 (value: {})",
                        ratio
                    ));
                }
                Some(ratio)
            }
            None => None,
        };
        let check_cash = optional_setting_bool(settings, "CHECK_CASH", true)?;
        let check_position = optional_setting_bool(settings, "CHECK_POSITION", true)?;
        let account_mode = optional_setting(settings, "ACCOUNT_MODE")
            .unwrap_or("backtest")
            .to_string();

        Ok(Self {
            initial_cash,
            fees,
            slippage_ticks,
            matcher,
            queue_depth,
            recorder_buffer,
            max_volume_ratio,
            check_cash,
            check_position,
            account_mode,
        })
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            slippage: self.slippage_ticks,
            max_volume_ratio: self.max_volume_ratio,
        }
    }

    pub fn admission_checks(&self) -> AdmissionChecks {
        AdmissionChecks {
            cash: self.check_cash,
            position: self.check_position,
        }
    }
}

fn default_quote_source() -> String {
    "snapshot".to_string()
}

fn default_contract() -> String {
    "stock".to_string()
}

/// Backtest run description loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct BacktestConfig {
    pub data_file: PathBuf,
    #[serde(default = "default_quote_source")]
    pub quote_source: String,
    pub instruments: Vec<String>,
    #[serde(default)]
    pub corporate_actions_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    #[serde(default = "default_contract")]
    pub contract: String,
    pub settings: HashMap<String, String>,
    pub strategy: String,
    /// One genome per simulation run.
    pub population: Vec<Vec<f64>>,
}

impl BacktestConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read backtest config {}", path.display()))?;
        let mut config: BacktestConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed backtest config {}", path.display()))?;
        // Relative paths are resolved against the config file's directory.
        if let Some(base) = path.parent() {
            config.data_file = resolve_relative(base, &config.data_file);
            config.output_dir = resolve_relative(base, &config.output_dir);
            config.corporate_actions_file = config
                .corporate_actions_file
                .as_ref()
                .map(|file| resolve_relative(base, file));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instruments.is_empty() {
            return Err(anyhow!("Backtest config lists no instruments"));
        }
        if self.population.is_empty() {
            return Err(anyhow!("Backtest config has an empty population"));
        }
        EngineSettings::from_settings_map(&self.settings)?;
        Ok(())
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        EngineSettings::from_settings_map(&self.settings)
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || base.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    if optional_setting(settings, key).is_none() {
        return Ok(default);
    }
    require_setting_f64(settings, key, min, max)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn optional_setting_bool(settings: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(anyhow!(
            "Setting {} must be true or false (value: {})",
            key,
            raw
        )),
    }
}
