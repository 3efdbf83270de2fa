// Model checkpointing (safetensors) and best-score bookkeeping.

use anyhow::{anyhow, ensure, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub fn save_checkpoint(varmap: &VarMap, path: &Path) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter store lock poisoned"))?;
    let named: HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    candle_core::safetensors::save(&named, path)
        .with_context(|| format!("failed to save checkpoint {}", path.display()))?;
    info!(params = named.len(), path = %path.display(), "saved checkpoint");
    Ok(())
}

/// Overwrite every parameter in `varmap` from `path`. A missing file or a
/// checkpoint that does not cover every parameter is an error.
pub fn load_checkpoint(varmap: &VarMap, path: &Path, device: &Device) -> Result<()> {
    ensure!(path.exists(), "checkpoint {} does not exist", path.display());
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter store lock poisoned"))?;
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        let saved = tensors
            .get(name)
            .ok_or_else(|| anyhow!("checkpoint {} has no tensor '{name}'", path.display()))?;
        var.set(saved)
            .with_context(|| format!("shape mismatch for '{name}'"))?;
        loaded += 1;
    }
    info!(loaded, path = %path.display(), "loaded checkpoint");
    Ok(())
}

// ---------------------------------------------------------------------------
// File naming
// ---------------------------------------------------------------------------

/// New best test score during self-critical training.
pub fn best_name(test_bleu: f64, epoch: usize) -> String {
    format!("bleu_{test_bleu:.3}_{epoch:02}.safetensors")
}

/// Periodic snapshot during self-critical training.
pub fn periodic_name(epoch: usize, argmax_bleu: f64, test_bleu: f64) -> String {
    format!("epoch_{epoch:03}_{argmax_bleu:.3}_{test_bleu:.3}.safetensors")
}

/// New best test score during cross-entropy training.
pub fn crossent_name(epoch: usize, test_bleu: f64) -> String {
    format!("epoch_{epoch:03}_{test_bleu:.3}.safetensors")
}

pub fn run_dir(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

// ---------------------------------------------------------------------------
// Best score
// ---------------------------------------------------------------------------

/// Highest score seen so far; unset until the first observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestScore {
    best: Option<f64>,
}

impl BestScore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<f64> {
        self.best
    }

    /// Record `score`; true when it beats everything seen before.
    pub fn update(&mut self, score: f64) -> bool {
        match self.best {
            Some(b) if score <= b => false,
            _ => {
                self.best = Some(score);
                true
            }
        }
    }
}
