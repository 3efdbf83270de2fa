// Scalar metric sinks.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const METRICS_FILE: &str = "metrics.jsonl";

/// One point of a named series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

pub trait MetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per scalar to `<dir>/metrics.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create metrics dir {}", dir.display()))?;
        let path = dir.join(METRICS_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            name: name.to_string(),
            value,
            step,
        };
        debug!(metric = name, value, step, "scalar");
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Keeps every scalar in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<ScalarRecord>,
}

impl MemorySink {
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|r| r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }

    pub fn steps(&self, name: &str) -> Vec<usize> {
        self.series(name).into_iter().map(|(s, _)| s).collect()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.records.push(ScalarRecord {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

/// Buffers per-batch values and emits their mean once `window` values of a
/// series have been collected, at the step of the last value.
#[derive(Debug)]
pub struct MeanTracker {
    window: usize,
    pending: HashMap<String, Vec<f64>>,
}

impl MeanTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            pending: HashMap::new(),
        }
    }

    pub fn track<S: MetricsSink + ?Sized>(
        &mut self,
        sink: &mut S,
        name: &str,
        value: f64,
        step: usize,
    ) -> Result<()> {
        let buf = self.pending.entry(name.to_string()).or_default();
        buf.push(value);
        if buf.len() >= self.window {
            let mean = buf.iter().sum::<f64>() / buf.len() as f64;
            buf.clear();
            sink.add_scalar(name, mean, step)?;
        }
        Ok(())
    }
}
