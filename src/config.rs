use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cornell::{MAX_TOKENS, MIN_TOKEN_FREQ};
use crate::data::{SHUFFLE_SEED, TRAIN_RATIO};

/// Complete configuration for both training modes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub data: DataConfig,
    pub scst: ScstConfig,
    pub crossent: CrossEntropyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub embedding_dim: usize,
    pub hidden_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Longest phrase (in words) kept as a training pair; also the decode limit.
    pub max_tokens: usize,
    pub min_token_freq: usize,
    pub train_ratio: f64,
    pub shuffle_seed: u64,
}

/// Self-critical training.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScstConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Adam epsilon. Large on purpose: policy gradients are noisy.
    pub adam_eps: f64,
    pub max_epochs: usize,
    /// Sampled trajectories per non-skipped example.
    pub samples: usize,
    pub skip_enabled: bool,
    /// Greedy reward above which an example counts as solved.
    pub skip_threshold: f64,
    /// Periodic checkpoint interval in epochs.
    pub save_every: usize,
    /// Number of per-batch values averaged before a metric point is written.
    pub tracker_window: usize,
}

/// Teacher-forced cross-entropy pre-training.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEntropyConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub max_epochs: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 50,
            hidden_size: 512,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_tokens: MAX_TOKENS,
            min_token_freq: MIN_TOKEN_FREQ,
            train_ratio: TRAIN_RATIO,
            shuffle_seed: SHUFFLE_SEED,
        }
    }
}

impl Default for ScstConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            learning_rate: 1e-4,
            adam_eps: 1e-3,
            max_epochs: 5000,
            samples: 4,
            skip_enabled: true,
            skip_threshold: 0.99,
            save_every: 10,
            tracker_window: 100,
        }
    }
}

impl Default for CrossEntropyConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            learning_rate: 1e-3,
            max_epochs: 100,
        }
    }
}

impl Config {
    /// Small model and short runs, for tests.
    pub fn tiny() -> Self {
        Self {
            model: ModelConfig {
                embedding_dim: 8,
                hidden_size: 16,
            },
            data: DataConfig {
                max_tokens: 6,
                min_token_freq: 1,
                ..DataConfig::default()
            },
            scst: ScstConfig {
                batch_size: 4,
                learning_rate: 1e-2,
                max_epochs: 2,
                samples: 2,
                save_every: 1,
                tracker_window: 1,
                ..ScstConfig::default()
            },
            crossent: CrossEntropyConfig {
                batch_size: 4,
                learning_rate: 1e-2,
                max_epochs: 2,
            },
        }
    }

    /// Read a JSON config, or fall back to defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config from {}", p.display()))?;
                serde_json::from_str::<Config>(&text)
                    .with_context(|| format!("failed to parse config from {}", p.display()))?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.model.embedding_dim > 0, "model.embedding_dim must be positive");
        ensure!(self.model.hidden_size > 0, "model.hidden_size must be positive");
        ensure!(self.data.max_tokens > 0, "data.max_tokens must be positive");
        ensure!(
            self.data.train_ratio > 0.0 && self.data.train_ratio <= 1.0,
            "data.train_ratio must be in (0, 1], got {}",
            self.data.train_ratio
        );
        ensure!(self.scst.batch_size > 0, "scst.batch_size must be positive");
        ensure!(self.scst.samples > 0, "scst.samples must be positive");
        ensure!(self.scst.save_every > 0, "scst.save_every must be positive");
        ensure!(self.scst.tracker_window > 0, "scst.tracker_window must be positive");
        ensure!(self.crossent.batch_size > 0, "crossent.batch_size must be positive");
        Ok(())
    }
}
