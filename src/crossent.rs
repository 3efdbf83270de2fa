// Teacher-forced cross-entropy pre-training of the phrase model. Produces the
// checkpoint that self-critical training resumes from.

use anyhow::{ensure, Result};
use candle_core::{Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;

use crate::bleu::bleu_many;
use crate::checkpoint::{crossent_name, save_checkpoint, BestScore};
use crate::config::CrossEntropyConfig;
use crate::data::{iterate_batches, shuffle_epoch, PhrasePair};
use crate::eval::run_test;
use crate::metrics::MetricsSink;
use crate::model::{PhraseModel, SequenceModel};
use crate::vocab::{TOK_BEG, TOK_END};

pub struct CrossEntropyTrainer {
    model: PhraseModel,
    optimizer: AdamW,
    config: CrossEntropyConfig,
    max_tokens: usize,
    rng: StdRng,
    best: BestScore,
    save_dir: Option<PathBuf>,
}

/// Loss and teacher-forced BLEU of one batch.
#[derive(Debug, Clone)]
pub struct CrossEntropyBatch {
    pub loss: f64,
    pub bleus: Vec<f64>,
}

impl CrossEntropyTrainer {
    pub fn new(model: PhraseModel, config: CrossEntropyConfig, max_tokens: usize) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..ParamsAdamW::default()
        };
        let optimizer = AdamW::new(model.varmap().all_vars(), params)?;
        Ok(Self {
            model,
            optimizer,
            config,
            max_tokens,
            rng: StdRng::from_entropy(),
            best: BestScore::new(),
            save_dir: None,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_save_dir(mut self, dir: PathBuf) -> Self {
        self.save_dir = Some(dir);
        self
    }

    pub fn model(&self) -> &PhraseModel {
        &self.model
    }

    pub fn into_model(self) -> PhraseModel {
        self.model
    }

    /// One optimizer step over every reference of every example in `batch`.
    /// Inputs are a reference without its last token, targets the same
    /// reference without its first.
    pub fn train_batch(&mut self, batch: &[PhrasePair]) -> Result<Option<CrossEntropyBatch>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let sources: Vec<&[u32]> = batch.iter().map(|p| p.source.as_slice()).collect();
        let encoded = self.model.encode(&sources)?;

        let mut logits = Vec::new();
        let mut targets: Vec<u32> = Vec::new();
        let mut bleus = Vec::new();
        for (idx, pair) in batch.iter().enumerate() {
            let item = self.model.encoded_item(&encoded, idx)?;
            for reference in pair.references.iter().filter(|r| r.len() >= 2) {
                let out = self
                    .model
                    .decode_teacher(&item, &reference[..reference.len() - 1])?;
                let predicted = out.argmax(D::Minus1)?.to_vec1::<u32>()?;
                bleus.push(bleu_many(&predicted, &[&reference[1..]]));
                targets.extend_from_slice(&reference[1..]);
                logits.push(out);
            }
        }
        if logits.is_empty() {
            return Ok(None);
        }

        let logits = Tensor::cat(&logits, 0)?;
        let n = targets.len();
        let targets = Tensor::from_vec(targets, n, self.model.device())?;
        let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;
        self.optimizer.backward_step(&loss)?;

        Ok(Some(CrossEntropyBatch {
            loss: loss.to_scalar::<f32>()? as f64,
            bleus,
        }))
    }

    /// Train for `config.max_epochs` epochs. Returns the best test score.
    pub fn fit(
        &mut self,
        mut train: Vec<PhrasePair>,
        test: &[PhrasePair],
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<f64>> {
        ensure!(!train.is_empty(), "training set is empty");
        info!(
            train = train.len(),
            test = test.len(),
            params = self.model.param_count(),
            "starting cross-entropy training"
        );
        for epoch in 0..self.config.max_epochs {
            shuffle_epoch(&mut train, &mut self.rng);
            let mut losses = Vec::new();
            let mut bleus = Vec::new();
            for batch in iterate_batches(&train, self.config.batch_size) {
                if let Some(out) = self.train_batch(batch)? {
                    losses.push(out.loss);
                    bleus.extend(out.bleus);
                }
            }

            let loss = losses.iter().sum::<f64>() / losses.len().max(1) as f64;
            let bleu = bleus.iter().sum::<f64>() / bleus.len().max(1) as f64;
            let bleu_test = run_test(&self.model, test, TOK_BEG, TOK_END, self.max_tokens)?;
            sink.add_scalar("loss", loss, epoch)?;
            sink.add_scalar("bleu", bleu, epoch)?;
            sink.add_scalar("bleu_test", bleu_test, epoch)?;
            sink.flush()?;
            info!(epoch, loss, bleu, bleu_test, "epoch finished");

            if self.best.update(bleu_test) {
                if let Some(dir) = &self.save_dir {
                    save_checkpoint(self.model.varmap(), &dir.join(crossent_name(epoch, bleu_test)))?;
                }
            }
        }
        Ok(self.best.get())
    }
}
