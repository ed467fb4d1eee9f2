use crate::models::{AssetRecord, OrderRecord, PositionRecord};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub const DEFAULT_RECORDER_BUFFER: usize = 10_000;

/// Append-only destination for one record kind.
pub trait RecordSink<R>: Send {
    fn write(&mut self, record: &R) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps records in memory behind a shared handle.
pub struct MemorySink<R> {
    records: Arc<Mutex<Vec<R>>>,
}

impl<R> Clone for MemorySink<R> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
        }
    }
}

impl<R> Default for MemorySink<R> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<R: Clone> MemorySink<R> {
    pub fn records(&self) -> Vec<R> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl<R: Clone + Send> RecordSink<R> for MemorySink<R> {
    fn write(&mut self, record: &R) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("Memory sink lock poisoned"))?;
        records.push(record.clone());
        Ok(())
    }
}

/// One JSON object per line, fields in declaration order.
pub struct JsonLinesSink<R> {
    path: PathBuf,
    writer: BufWriter<File>,
    _marker: PhantomData<fn(&R)>,
}

impl<R> JsonLinesSink<R> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create record directory {}", parent.display())
                })?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("Unable to create record file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            _marker: PhantomData,
        })
    }
}

impl<R: Serialize> RecordSink<R> for JsonLinesSink<R> {
    fn write(&mut self, record: &R) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .with_context(|| format!("Failed to encode record for {}", self.path.display()))?;
        self.writer
            .write_all(b"\n")
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))
    }
}

/// Cloneable sending side of a [`Recorder`].
pub struct RecordHandle<R> {
    sender: Sender<R>,
}

impl<R> Clone for RecordHandle<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<R> RecordHandle<R> {
    /// Blocks only while the buffer is full. Returns false once the recorder is gone.
    pub fn record(&self, record: R) -> bool {
        self.sender.send(record).is_ok()
    }
}

/// Buffered record channel drained by a dedicated worker thread.
pub struct Recorder<R> {
    name: String,
    sender: Option<Sender<R>>,
    worker: Option<JoinHandle<usize>>,
}

impl<R: Send + 'static> Recorder<R> {
    pub fn spawn(name: &str, sink: Box<dyn RecordSink<R>>, buffer: usize) -> Self {
        let (sender, receiver): (Sender<R>, Receiver<R>) = bounded(buffer.max(1));
        let label = name.to_string();
        let worker = thread::spawn(move || drain(&label, sink, receiver));
        Self {
            name: name.to_string(),
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> Option<RecordHandle<R>> {
        self.sender.as_ref().map(|sender| RecordHandle {
            sender: sender.clone(),
        })
    }

    /// Closes the channel and waits for the worker to write everything queued.
    /// Handles still held elsewhere keep the worker alive until they drop.
    pub fn shutdown(mut self) -> Result<usize> {
        self.sender.take();
        let Some(worker) = self.worker.take() else {
            return Ok(0);
        };
        worker
            .join()
            .map_err(|_| anyhow!("Recorder {} worker panicked", self.name))
    }
}

impl<R> Drop for Recorder<R> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drain<R>(name: &str, mut sink: Box<dyn RecordSink<R>>, receiver: Receiver<R>) -> usize {
    let mut written = 0;
    let mut failures = 0;
    for record in receiver.iter() {
        match sink.write(&record) {
            Ok(()) => written += 1,
            Err(err) => {
                failures += 1;
                if failures == 1 {
                    warn!("Recorder {}: {:#}", name, err);
                }
            }
        }
    }
    if let Err(err) = sink.flush() {
        warn!("Recorder {}: {:#}", name, err);
    }
    if failures > 1 {
        warn!("Recorder {}: {} record(s) failed to write", name, failures);
    }
    written
}

/// Order, position and asset recorders for one backtest.
pub struct RecorderSet {
    orders: Recorder<OrderRecord>,
    positions: Recorder<PositionRecord>,
    assets: Recorder<AssetRecord>,
}

/// Sending sides of a [`RecorderSet`], handed to each run.
#[derive(Clone)]
pub struct RecordHandles {
    pub orders: RecordHandle<OrderRecord>,
    pub positions: RecordHandle<PositionRecord>,
    pub assets: RecordHandle<AssetRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub orders: usize,
    pub positions: usize,
    pub assets: usize,
}

impl RecorderSet {
    pub fn new(
        orders: Box<dyn RecordSink<OrderRecord>>,
        positions: Box<dyn RecordSink<PositionRecord>>,
        assets: Box<dyn RecordSink<AssetRecord>>,
        buffer: usize,
    ) -> Self {
        Self {
            orders: Recorder::spawn("orders", orders, buffer),
            positions: Recorder::spawn("positions", positions, buffer),
            assets: Recorder::spawn("assets", assets, buffer),
        }
    }

    /// `orders.jsonl`, `positions.jsonl` and `assets.jsonl` under `dir`.
    pub fn json_lines<P: AsRef<Path>>(dir: P, buffer: usize) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self::new(
            Box::new(JsonLinesSink::<OrderRecord>::create(dir.join("orders.jsonl"))?),
            Box::new(JsonLinesSink::<PositionRecord>::create(dir.join("positions.jsonl"))?),
            Box::new(JsonLinesSink::<AssetRecord>::create(dir.join("assets.jsonl"))?),
            buffer,
        ))
    }

    pub fn handles(&self) -> Result<RecordHandles> {
        match (
            self.orders.handle(),
            self.positions.handle(),
            self.assets.handle(),
        ) {
            (Some(orders), Some(positions), Some(assets)) => Ok(RecordHandles {
                orders,
                positions,
                assets,
            }),
            _ => Err(anyhow!("Recorders already shut down")),
        }
    }

    pub fn shutdown(self) -> Result<RecordCounts> {
        let RecorderSet {
            orders,
            positions,
            assets,
        } = self;
        let counts = RecordCounts {
            orders: orders.shutdown()?,
            positions: positions.shutdown()?,
            assets: assets.shutdown()?,
        };
        info!(
            "Recorders drained: {} order, {} position, {} asset record(s)",
            counts.orders, counts.positions, counts.assets
        );
        Ok(counts)
    }
}
