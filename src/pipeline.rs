// End-to-end training runs.
//
//   prepare_data:  corpus -> vocabulary -> encoded pairs -> seeded split -> grouped
//   run_crossent:  fresh PhraseModel, teacher-forced pre-training
//   run_scst:      PhraseModel from a checkpoint, self-critical fine-tuning
//
// Checkpoints and vocab.json land in <saves>/<name>/, metrics in
// <runs>/<name>/metrics.jsonl.

use anyhow::{ensure, Result};
use candle_core::Device;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::checkpoint::{load_checkpoint, run_dir};
use crate::config::{Config, DataConfig};
use crate::cornell::load_data;
use crate::crossent::CrossEntropyTrainer;
use crate::data::{group_by_source, shuffle_with_seed, split_train_test, PhrasePair};
use crate::metrics::JsonlSink;
use crate::model::{PhraseModel, SequenceModel};
use crate::scst::ScstTrainer;
use crate::vocab::{Vocabulary, VOCAB_FILE};

/// Where a named run writes its files.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub saves_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub name: String,
}

impl RunPaths {
    pub fn new(saves_dir: impl Into<PathBuf>, runs_dir: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            saves_dir: saves_dir.into(),
            runs_dir: runs_dir.into(),
            name: name.to_string(),
        }
    }

    pub fn save_dir(&self) -> PathBuf {
        run_dir(&self.saves_dir, &self.name)
    }

    pub fn metrics_dir(&self) -> PathBuf {
        run_dir(&self.runs_dir, &self.name)
    }
}

pub struct PreparedData {
    pub train: Vec<PhrasePair>,
    pub test: Vec<PhrasePair>,
    pub vocab: Vocabulary,
}

/// Load the corpus and build grouped train/test sets. The split happens on
/// raw pairs, before grouping, after a shuffle with a fixed seed.
pub fn prepare_data(corpus: &Path, genre: &str, cfg: &DataConfig) -> Result<PreparedData> {
    let (pairs, vocab) = load_data(corpus, genre, cfg.max_tokens, cfg.min_token_freq)?;
    info!(pairs = pairs.len(), words = vocab.len(), "obtained phrase pairs");

    let mut encoded = vocab.encode_phrase_pairs(&pairs);
    ensure!(
        !encoded.is_empty(),
        "no phrase pairs left after dropping unknown words"
    );
    shuffle_with_seed(&mut encoded, cfg.shuffle_seed);
    let (train, test) = split_train_test(encoded, cfg.train_ratio);
    info!(samples = train.len(), "training data converted");

    let train = group_by_source(train);
    let test = group_by_source(test);
    info!(train = train.len(), test = test.len(), "grouped by source phrase");
    Ok(PreparedData { train, test, vocab })
}

/// Cross-entropy pre-training from scratch. Returns the best test BLEU.
pub fn run_crossent(
    config: &Config,
    corpus: &Path,
    genre: &str,
    paths: &RunPaths,
    device: &Device,
) -> Result<Option<f64>> {
    let data = prepare_data(corpus, genre, &config.data)?;
    let save_dir = paths.save_dir();
    std::fs::create_dir_all(&save_dir)?;
    data.vocab.save(&save_dir)?;

    let model = PhraseModel::new(config.model.clone(), data.vocab.len(), device)?;
    let mut sink = JsonlSink::create(&paths.metrics_dir())?;
    let mut trainer = CrossEntropyTrainer::new(model, config.crossent.clone(), config.data.max_tokens)?
        .with_save_dir(save_dir);
    trainer.fit(data.train, &data.test, &mut sink)
}

/// Self-critical training resumed from `load`. Returns the best test BLEU.
pub fn run_scst(
    config: &Config,
    corpus: &Path,
    genre: &str,
    paths: &RunPaths,
    load: &Path,
    device: &Device,
) -> Result<Option<f64>> {
    ensure!(load.exists(), "checkpoint {} does not exist", load.display());
    let data = prepare_data(corpus, genre, &config.data)?;

    // a vocabulary saved next to the checkpoint must agree with the corpus
    if let Some(dir) = load.parent() {
        if dir.join(VOCAB_FILE).exists() {
            let saved = Vocabulary::load(dir)?;
            ensure!(
                saved.len() == data.vocab.len(),
                "checkpoint vocabulary has {} words, corpus gives {}",
                saved.len(),
                data.vocab.len()
            );
        }
    }

    let save_dir = paths.save_dir();
    std::fs::create_dir_all(&save_dir)?;
    data.vocab.save(&save_dir)?;

    let model = PhraseModel::new(config.model.clone(), data.vocab.len(), device)?;
    info!(params = model.param_count(), "model created");
    load_checkpoint(model.varmap(), load, device)?;
    info!(path = %load.display(), "model loaded, continuing in RL mode");

    let mut sink = JsonlSink::create(&paths.metrics_dir())?;
    let mut trainer = ScstTrainer::new(model, config.scst.clone(), config.data.max_tokens)?
        .with_vocab(data.vocab)
        .with_save_dir(save_dir);
    trainer.fit(data.train, &data.test, &mut sink)
}
