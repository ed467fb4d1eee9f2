use crate::contract::parse_instrument_code;
use crate::models::{Bar, Snapshot};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Supplier of per-instrument bar series.
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &str;
    fn instruments(&self) -> Vec<String>;
    fn load_series(&self, inst_id: &str) -> Result<Vec<Bar>>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQuoteSource {
    series: HashMap<String, Vec<Bar>>,
}

impl MemoryQuoteSource {
    pub fn new(bars: Vec<Bar>) -> Self {
        let mut series: HashMap<String, Vec<Bar>> = HashMap::new();
        for bar in bars {
            let inst_id = bar.inst_id.trim().to_uppercase();
            series.entry(inst_id).or_default().push(bar);
        }
        Self { series }
    }

    pub fn insert(&mut self, inst_id: &str, bars: Vec<Bar>) {
        self.series.insert(inst_id.to_string(), bars);
    }
}

impl QuoteSource for MemoryQuoteSource {
    fn name(&self) -> &str {
        "memory"
    }

    fn instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.series.keys().cloned().collect();
        instruments.sort();
        instruments
    }

    fn load_series(&self, inst_id: &str) -> Result<Vec<Bar>> {
        self.series
            .get(inst_id)
            .cloned()
            .ok_or_else(|| anyhow!("No bar series for instrument {}", inst_id))
    }
}

/// On-disk bar set. `.bin` files are bincode, anything else JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub bars: Vec<Bar>,
}

impl MarketDataSnapshot {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            bars,
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot = if is_binary(path) {
            bincode::deserialize_from(reader).context("Snapshot decode failed")?
        } else {
            serde_json::from_reader(reader).context("Snapshot decode failed")?
        };

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }
        if snapshot.bars.is_empty() {
            return Err(anyhow!(
                "Market data snapshot {} has no bars",
                path.display()
            ));
        }
        Ok(snapshot)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }
        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        if is_binary(path) {
            bincode::serialize_into(&mut writer, self)
                .context("Failed to serialize market data snapshot")?;
        } else {
            serde_json::to_writer(&mut writer, self)
                .context("Failed to serialize market data snapshot")?;
        }
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn into_source(self) -> MemoryQuoteSource {
        MemoryQuoteSource::new(self.bars)
    }
}

fn is_binary(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("bin"))
        .unwrap_or(false)
}

/// Quote source backed by a [`MarketDataSnapshot`] file.
pub struct SnapshotFileSource {
    label: String,
    inner: MemoryQuoteSource,
}

impl SnapshotFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let snapshot = MarketDataSnapshot::load_from_file(path)?;
        info!(
            "Loaded market data snapshot {} ({} bars, generated {})",
            path.display(),
            snapshot.bars.len(),
            snapshot.generated_at
        );
        Ok(Self {
            label: path.display().to_string(),
            inner: snapshot.into_source(),
        })
    }
}

impl QuoteSource for SnapshotFileSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn instruments(&self) -> Vec<String> {
        self.inner.instruments()
    }

    fn load_series(&self, inst_id: &str) -> Result<Vec<Bar>> {
        self.inner.load_series(inst_id)
    }
}

/// Loads every instrument in parallel and merges the series into one
/// ascending sequence of snapshots. Bars inside a snapshot follow the order
/// of `instruments`.
pub fn load_snapshots(source: &dyn QuoteSource, instruments: &[String]) -> Result<Vec<Arc<Snapshot>>> {
    if instruments.is_empty() {
        return Err(anyhow!("No instruments subscribed"));
    }
    let series = instruments
        .par_iter()
        .map(|raw| {
            let (inst_id, _) = parse_instrument_code(raw)?;
            let bars = source
                .load_series(&inst_id)
                .with_context(|| format!("Missing bar series for {} in {}", inst_id, source.name()))?;
            clean_series(&inst_id, bars)
        })
        .collect::<Result<Vec<Vec<Bar>>>>()?;
    Ok(merge_series(series))
}

fn clean_series(inst_id: &str, mut bars: Vec<Bar>) -> Result<Vec<Bar>> {
    if bars.is_empty() {
        return Err(anyhow!("Bar series for {} is empty", inst_id));
    }
    for bar in &mut bars {
        for (label, value) in [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!(
                    "Bar for {} at {} has invalid {} price {}",
                    inst_id,
                    bar.time,
                    label,
                    value
                ));
            }
        }
        bar.inst_id = inst_id.to_string();
    }

    if bars.windows(2).any(|pair| pair[0].time > pair[1].time) {
        warn!("Bar series for {} was out of order; sorting", inst_id);
        bars.sort_by_key(|bar| bar.time);
    }
    let before = bars.len();
    // Keep the last bar seen for a repeated timestamp.
    bars.reverse();
    bars.dedup_by_key(|bar| bar.time);
    bars.reverse();
    if bars.len() != before {
        warn!(
            "Dropped {} duplicate bar(s) for {}",
            before - bars.len(),
            inst_id
        );
    }
    Ok(bars)
}

fn merge_series(series: Vec<Vec<Bar>>) -> Vec<Arc<Snapshot>> {
    let mut heap = BinaryHeap::new();
    for (index, bars) in series.iter().enumerate() {
        if let Some(bar) = bars.first() {
            heap.push(Reverse((bar.time, index, 0usize)));
        }
    }

    let mut snapshots: Vec<Arc<Snapshot>> = Vec::new();
    let mut current: Option<Snapshot> = None;
    while let Some(Reverse((time, index, position))) = heap.pop() {
        let bar = series[index][position].clone();
        if let Some(next) = series[index].get(position + 1) {
            heap.push(Reverse((next.time, index, position + 1)));
        }
        match current.as_mut() {
            Some(snapshot) if snapshot.time == time => snapshot.bars.push(bar),
            _ => {
                if let Some(done) = current.take() {
                    snapshots.push(Arc::new(done));
                }
                current = Some(Snapshot {
                    time,
                    bars: vec![bar],
                });
            }
        }
    }
    if let Some(done) = current {
        snapshots.push(Arc::new(done));
    }
    snapshots
}

/// Cooperative stop signal for one subscription.
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Sender<()>,
}

impl StopHandle {
    /// Asks the scheduler to drop this subscriber. Idempotent.
    pub fn stop(&self) {
        let _ = self.sender.try_send(());
    }
}

pub struct Subscription {
    pub id: usize,
    pub receiver: Receiver<Arc<Snapshot>>,
    pub stop: StopHandle,
}

struct Subscriber {
    id: usize,
    sender: Sender<Arc<Snapshot>>,
    stop: Receiver<()>,
    stop_closed: bool,
}

enum Delivery {
    Sent,
    Stopped,
    Disconnected,
}

impl Subscriber {
    fn deliver(&mut self, snapshot: &Arc<Snapshot>) -> Delivery {
        if !self.stop_closed {
            match self.stop.try_recv() {
                Ok(()) => return Delivery::Stopped,
                Err(TryRecvError::Disconnected) => self.stop_closed = true,
                Err(TryRecvError::Empty) => {}
            }
        }
        if self.stop_closed {
            return self.send_blocking(snapshot);
        }
        let sender = &self.sender;
        let stop = &self.stop;
        let outcome = select! {
            send(sender, snapshot.clone()) -> sent => match sent {
                Ok(()) => Some(Delivery::Sent),
                Err(_) => Some(Delivery::Disconnected),
            },
            recv(stop) -> signal => match signal {
                Ok(()) => Some(Delivery::Stopped),
                Err(_) => None,
            },
        };
        match outcome {
            Some(delivery) => delivery,
            None => {
                // The stop handle was dropped without signalling; keep publishing.
                self.stop_closed = true;
                self.send_blocking(snapshot)
            }
        }
    }

    fn send_blocking(&self, snapshot: &Arc<Snapshot>) -> Delivery {
        match self.sender.send(snapshot.clone()) {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub published: usize,
    pub stopped: usize,
    pub disconnected: usize,
}

/// Replays one merged snapshot sequence to every subscriber through its own
/// bounded queue. Subscribe first, then `run` once.
pub struct QuoteScheduler {
    snapshots: Arc<Vec<Arc<Snapshot>>>,
    depth: usize,
    pending: Vec<Subscriber>,
    next_id: usize,
    started: bool,
    worker: Option<JoinHandle<FanOutReport>>,
}

impl QuoteScheduler {
    pub fn new(snapshots: Vec<Arc<Snapshot>>, depth: usize) -> Self {
        Self {
            snapshots: Arc::new(snapshots),
            depth: depth.max(1),
            pending: Vec::new(),
            next_id: 0,
            started: false,
            worker: None,
        }
    }

    pub fn from_source(source: &dyn QuoteSource, instruments: &[String], depth: usize) -> Result<Self> {
        let snapshots = load_snapshots(source, instruments)?;
        info!(
            "Merged {} instrument series into {} snapshots",
            instruments.len(),
            snapshots.len()
        );
        Ok(Self::new(snapshots, depth))
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.pending.len()
    }

    pub fn subscribe(&mut self) -> Result<Subscription> {
        if self.started {
            return Err(anyhow!("Cannot subscribe after the quote scheduler has started"));
        }
        let (sender, receiver) = bounded(self.depth);
        let (stop_tx, stop_rx) = bounded(1);
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push(Subscriber {
            id,
            sender,
            stop: stop_rx,
            stop_closed: false,
        });
        Ok(Subscription {
            id,
            receiver,
            stop: StopHandle { sender: stop_tx },
        })
    }

    /// Starts the fan-out thread. Every subscriber queue is closed exactly once,
    /// when the sequence ends or the subscriber leaves.
    pub fn run(&mut self) -> Result<()> {
        if self.started {
            return Err(anyhow!("Quote scheduler already started"));
        }
        self.started = true;
        let subscribers = std::mem::take(&mut self.pending);
        let snapshots = self.snapshots.clone();
        info!(
            "Publishing {} snapshots to {} subscriber(s)",
            snapshots.len(),
            subscribers.len()
        );
        self.worker = Some(thread::spawn(move || fan_out(&snapshots, subscribers)));
        Ok(())
    }

    pub fn wait_for_shutdown(&mut self) -> Result<FanOutReport> {
        let Some(worker) = self.worker.take() else {
            return Ok(FanOutReport::default());
        };
        worker
            .join()
            .map_err(|_| anyhow!("Quote scheduler fan-out thread panicked"))
    }
}

fn fan_out(snapshots: &[Arc<Snapshot>], mut subscribers: Vec<Subscriber>) -> FanOutReport {
    let mut report = FanOutReport::default();
    for snapshot in snapshots {
        if subscribers.is_empty() {
            info!("All subscribers left; stopping replay at {}", snapshot.time);
            break;
        }
        subscribers.retain_mut(|subscriber| match subscriber.deliver(snapshot) {
            Delivery::Sent => true,
            Delivery::Stopped => {
                debug!("Subscriber {} stopped at {}", subscriber.id, snapshot.time);
                report.stopped += 1;
                false
            }
            Delivery::Disconnected => {
                warn!(
                    "Subscriber {} dropped its queue at {}; unsubscribing",
                    subscriber.id, snapshot.time
                );
                report.disconnected += 1;
                false
            }
        });
        report.published += 1;
    }
    info!(
        "Quote replay finished: {} snapshot(s) published, {} stopped, {} disconnected",
        report.published, report.stopped, report.disconnected
    );
    // Dropping the remaining senders closes their queues.
    drop(subscribers);
    report
}
