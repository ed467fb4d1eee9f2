use super::ensure_file_exists;
use crate::quote::{load_snapshots, MarketDataSnapshot};
use anyhow::Result;
use chrono::NaiveDateTime;
use log::info;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesStats {
    pub bars: usize,
    pub first: NaiveDateTime,
    pub last: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataInspection {
    pub version: u32,
    pub series: BTreeMap<String, SeriesStats>,
    pub snapshots: usize,
}

/// Summarises a market data snapshot file and checks that every series merges.
pub fn run(data_file: &Path) -> Result<DataInspection> {
    ensure_file_exists(data_file, "Market data snapshot")?;
    let snapshot = MarketDataSnapshot::load_from_file(data_file)?;
    let version = snapshot.version;
    info!(
        "Snapshot {} version {} generated {} with {} bar(s)",
        data_file.display(),
        version,
        snapshot.generated_at,
        snapshot.bars.len()
    );

    let mut series: BTreeMap<String, SeriesStats> = BTreeMap::new();
    for bar in &snapshot.bars {
        series
            .entry(bar.inst_id.to_uppercase())
            .and_modify(|stats| {
                stats.bars += 1;
                stats.first = stats.first.min(bar.time);
                stats.last = stats.last.max(bar.time);
            })
            .or_insert(SeriesStats {
                bars: 1,
                first: bar.time,
                last: bar.time,
            });
    }

    let instruments: Vec<String> = series.keys().cloned().collect();
    let snapshots = load_snapshots(&snapshot.into_source(), &instruments)?.len();
    for (inst_id, stats) in &series {
        info!(
            "{}: {} bar(s) from {} to {}",
            inst_id, stats.bars, stats.first, stats.last
        );
    }
    info!(
        "{} instrument(s) merge into {} snapshot(s)",
        series.len(),
        snapshots
    );

    Ok(DataInspection {
        version,
        series,
        snapshots,
    })
}
