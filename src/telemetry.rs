//! Tick/event schema and the bounded ring buffer that carries them to
//! external observers (dashboard, TUI, batch runner — none of which live in
//! this crate).

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const TICK_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Switch,
    Compaction,
    Idle,
    Resume,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp_seconds: f64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpsByKind {
    pub put: u64,
    pub get: u64,
    pub del: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PercentileSet {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub overall: PercentileSet,
    pub put: PercentileSet,
    pub get: PercentileSet,
    pub del: PercentileSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHeatmap {
    pub rows: usize,
    pub cols: usize,
    pub matrix: Vec<Vec<u64>>,
    pub max: u64,
    pub total: u64,
    pub slot_span: usize,
    pub original_slots: usize,
}

impl Default for KeyHeatmap {
    fn default() -> Self {
        KeyHeatmap {
            rows: 0,
            cols: 0,
            matrix: Vec::new(),
            max: 0,
            total: 0,
            slot_span: 1,
            original_slots: 0,
        }
    }
}

/// A periodic structured health record produced by the replay engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub schema_version: u16,
    pub elapsed_seconds: f64,
    pub backend_label: String,
    pub total_ops: u64,
    pub ops_by_kind: OpsByKind,
    pub migrations_total: u64,
    pub compactions_total: u64,
    pub load_factor: f64,
    pub max_group_len: usize,
    pub avg_probe_estimate: f64,
    pub tombstone_ratio: f64,
    pub probe_histogram: Vec<(usize, usize)>,
    pub key_heatmap: KeyHeatmap,
    pub latency_percentiles: LatencyPercentiles,
    /// Percentiles over full-iteration ("loop") timings rather than the bare
    /// backend call — includes row parsing and bookkeeping overhead the
    /// backend-only reservoir above excludes.
    pub loop_latency_percentiles: LatencyPercentiles,
    pub latency_cumulative_histogram_by_kind: std::collections::BTreeMap<String, Vec<(f64, u64)>>,
    pub latency_bucket_preset_name: String,
    pub events: Vec<Event>,
    pub alerts: Vec<String>,
    pub state: RunState,
}

/// Single-producer (the replay engine) / multiple-observer ring buffer of
/// ticks and events. Drops the oldest entry on overflow; observers must
/// tolerate gaps.
pub struct TelemetryBus {
    ticks: VecDeque<Tick>,
    events: VecDeque<Event>,
    capacity: usize,
}

impl TelemetryBus {
    pub fn new(capacity: usize) -> Self {
        TelemetryBus {
            ticks: VecDeque::with_capacity(capacity.min(1024)),
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push_tick(&mut self, tick: Tick) {
        for event in &tick.events {
            self.push_event(event.clone());
        }
        if self.ticks.len() == self.capacity {
            self.ticks.pop_front();
        }
        self.ticks.push_back(tick);
    }

    fn push_event(&mut self, event: Event) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn latest_tick(&self) -> Option<&Tick> {
        self.ticks.back()
    }

    pub fn recent_ticks(&self) -> impl Iterator<Item = &Tick> {
        self.ticks.iter()
    }

    pub fn recent_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

/// Newline-delimited tick log writer. In append mode, each tick is written
/// as one more line on the file opened once and kept open. In retention mode
/// (`N` set), the writer instead keeps the last `N` serialized lines in
/// memory and rewrites the whole file on every emission, so the file on disk
/// never holds more than `N` ticks — matching the "rewrite-in-place of the
/// last N ticks" ring policy.
pub enum TickLogWriter {
    Append { writer: BufWriter<File> },
    Retention { path: PathBuf, capacity: usize, lines: VecDeque<String> },
}

impl TickLogWriter {
    /// `retention = None` appends forever; `retention = Some(n)` keeps only
    /// the last `n` ticks in the file, rewritten on each emission.
    pub fn create(path: &Path, retention: Option<usize>) -> Result<Self> {
        Ok(match retention {
            None => {
                let file = OpenOptions::new().create(true).append(true).truncate(false).open(path)?;
                TickLogWriter::Append { writer: BufWriter::new(file) }
            }
            Some(capacity) => {
                // Starting with a truncated, empty file keeps this mode's
                // on-disk state consistent with "contains only the last N
                // ticks" from the very first emission.
                File::create(path)?;
                TickLogWriter::Retention {
                    path: path.to_path_buf(),
                    capacity: capacity.max(1),
                    lines: VecDeque::new(),
                }
            }
        })
    }

    pub fn write_tick(&mut self, tick: &Tick) -> Result<()> {
        let line = serde_json::to_string(tick).map_err(|e| crate::error::EngineError::IoError(e.to_string()))?;
        match self {
            TickLogWriter::Append { writer } => {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
                writer.flush()?;
            }
            TickLogWriter::Retention { path, capacity, lines } => {
                if lines.len() == *capacity {
                    lines.pop_front();
                }
                lines.push_back(line);
                let mut out = String::new();
                for l in lines.iter() {
                    out.push_str(l);
                    out.push('\n');
                }
                std::fs::write(path, out)?;
            }
        }
        Ok(())
    }
}
