// Self-critical sequence training.
//
// Per example the greedy decode is the baseline: sampled decodes are rewarded
// by how much their BLEU beats it, and that advantage scales the log
// probability of every sampled token.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::bleu::{bleu_many, strip_begin};
use crate::checkpoint::{best_name, periodic_name, save_checkpoint, BestScore};
use crate::config::ScstConfig;
use crate::data::{iterate_batches, shuffle_epoch, PhrasePair};
use crate::eval::run_test;
use crate::metrics::{MeanTracker, MetricsSink};
use crate::model::{SequenceModel, Trajectory};
use crate::vocab::{Vocabulary, TOK_BEG, TOK_END};

// ---------------------------------------------------------------------------
// Policy loss
// ---------------------------------------------------------------------------

/// Sampled trajectories of one batch, flattened in matching order.
#[derive(Debug, Default)]
pub struct PolicyBatch {
    pub logits: Vec<Tensor>,
    pub actions: Vec<u32>,
    pub advantages: Vec<f32>,
}

impl PolicyBatch {
    pub fn is_empty(&self) -> bool {
        self.logits.is_empty()
    }

    pub fn trajectories(&self) -> usize {
        self.logits.len()
    }

    pub fn push(&mut self, trajectory: Trajectory, advantage: f64) {
        let n = trajectory.tokens.len();
        self.actions.extend_from_slice(&trajectory.tokens);
        self.advantages.extend(std::iter::repeat(advantage as f32).take(n));
        self.logits.push(trajectory.logits);
    }

    pub fn mean_advantage(&self) -> f64 {
        if self.advantages.is_empty() {
            return 0.0;
        }
        self.advantages.iter().map(|&a| a as f64).sum::<f64>() / self.advantages.len() as f64
    }

    pub fn loss(&self, device: &Device) -> Result<Tensor> {
        ensure!(!self.is_empty(), "policy batch has no trajectories");
        let logits = Tensor::cat(&self.logits, 0)?;
        policy_loss(&logits, &self.actions, &self.advantages, device)
    }
}

/// `-mean(adv_i * log_softmax(logits)[i, action_i])`
pub fn policy_loss(
    logits: &Tensor,
    actions: &[u32],
    advantages: &[f32],
    device: &Device,
) -> Result<Tensor> {
    let rows = logits.dim(0)?;
    ensure!(
        rows == actions.len() && rows == advantages.len(),
        "policy loss shape mismatch: {rows} logit rows, {} actions, {} advantages",
        actions.len(),
        advantages.len()
    );
    ensure!(rows > 0, "policy loss over zero tokens");
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let actions = Tensor::from_vec(actions.to_vec(), (rows, 1), device)?;
    let picked = log_probs.gather(&actions, 1)?.squeeze(1)?;
    let adv = Tensor::from_vec(advantages.to_vec(), rows, device)?;
    Ok(picked.mul(&adv)?.mean_all()?.neg()?)
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Rewards and counters of one pass over the training set.
#[derive(Debug, Default, Clone)]
pub struct EpochStats {
    pub argmax_rewards: Vec<f64>,
    pub sample_rewards: Vec<f64>,
    pub total: usize,
    pub skipped: usize,
}

impl EpochStats {
    pub fn mean_argmax(&self) -> f64 {
        mean(&self.argmax_rewards)
    }

    pub fn mean_sample(&self) -> f64 {
        mean(&self.sample_rewards)
    }

    pub fn skip_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.skipped as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchReport {
    pub batch_idx: usize,
    pub loss: f64,
    pub advantage: f64,
    pub trajectories: usize,
    pub tokens: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EpochSummary {
    pub epoch: usize,
    pub bleu_test: f64,
    pub bleu_argmax: f64,
    pub bleu_sample: f64,
    pub skip_rate: f64,
    pub new_best: bool,
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct ScstTrainer<M: SequenceModel> {
    model: M,
    optimizer: AdamW,
    config: ScstConfig,
    max_tokens: usize,
    rng: StdRng,
    tracker: MeanTracker,
    batch_idx: usize,
    best: BestScore,
    vocab: Option<Vocabulary>,
    save_dir: Option<PathBuf>,
}

impl<M: SequenceModel> ScstTrainer<M> {
    pub fn new(model: M, config: ScstConfig, max_tokens: usize) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: config.adam_eps,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(model.varmap().all_vars(), params)?;
        Ok(Self {
            model,
            optimizer,
            tracker: MeanTracker::new(config.tracker_window),
            config,
            max_tokens,
            rng: StdRng::from_entropy(),
            batch_idx: 0,
            best: BestScore::new(),
            vocab: None,
            save_dir: None,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Used to render the diagnostic dialogue as text.
    pub fn with_vocab(mut self, vocab: Vocabulary) -> Self {
        self.vocab = Some(vocab);
        self
    }

    /// Enables checkpointing into `dir`.
    pub fn with_save_dir(mut self, dir: PathBuf) -> Self {
        self.save_dir = Some(dir);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn batch_idx(&self) -> usize {
        self.batch_idx
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.get()
    }

    fn render(&self, ids: &[u32]) -> String {
        match &self.vocab {
            Some(v) => v.decode_text(ids),
            None => format!("{ids:?}"),
        }
    }

    /// Decode every example of `batch` and gather the sampled trajectories.
    pub fn collect_batch(
        &mut self,
        batch: &[PhrasePair],
        stats: &mut EpochStats,
    ) -> Result<PolicyBatch> {
        let mut policy = PolicyBatch::default();
        if batch.is_empty() {
            return Ok(policy);
        }
        let sources: Vec<&[u32]> = batch.iter().map(|p| p.source.as_slice()).collect();
        let encoded = self.model.encode(&sources)?;
        let start = self.model.embed(&[TOK_BEG])?;

        let mut dialogue_shown = false;
        for (idx, pair) in batch.iter().enumerate() {
            let item = self.model.encoded_item(&encoded, idx)?;
            self.process_example(&item, &start, pair, &mut policy, stats, &mut dialogue_shown)?;
        }
        Ok(policy)
    }

    fn process_example(
        &mut self,
        item: &M::Encoded,
        start: &Tensor,
        pair: &PhrasePair,
        policy: &mut PolicyBatch,
        stats: &mut EpochStats,
        dialogue_shown: &mut bool,
    ) -> Result<()> {
        stats.total += 1;
        let refs = strip_begin(&pair.references);

        let greedy = self.model.decode_greedy(item, start, self.max_tokens, TOK_END)?;
        let argmax_reward = bleu_many(&greedy.tokens, &refs);
        stats.argmax_rewards.push(argmax_reward);

        if self.config.skip_enabled && argmax_reward > self.config.skip_threshold {
            stats.skipped += 1;
            return Ok(());
        }

        let show = !*dialogue_shown;
        if show {
            let refs_text: Vec<String> = refs.iter().map(|r| self.render(r)).collect();
            debug!(input = %self.render(&pair.source), "dialogue");
            debug!(refs = %refs_text.join(" ~~|~~ "), "dialogue");
            debug!(argmax = %self.render(&greedy.tokens), bleu = argmax_reward, "dialogue");
        }

        for _ in 0..self.config.samples {
            let sample = self.model.decode_sample(
                item,
                start,
                self.max_tokens,
                TOK_END,
                &mut self.rng,
            )?;
            let sample_reward = bleu_many(&sample.tokens, &refs);
            if show {
                debug!(sample = %self.render(&sample.tokens), bleu = sample_reward, "dialogue");
            }
            policy.push(sample, sample_reward - argmax_reward);
            stats.sample_rewards.push(sample_reward);
        }
        *dialogue_shown = true;
        Ok(())
    }

    /// One optimizer step on `batch`. `None` when every example was skipped:
    /// no update and nothing logged for this batch index.
    pub fn train_batch(
        &mut self,
        batch: &[PhrasePair],
        stats: &mut EpochStats,
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<BatchReport>> {
        self.batch_idx += 1;
        let policy = self.collect_batch(batch, stats)?;
        if policy.is_empty() {
            return Ok(None);
        }

        let loss = policy.loss(self.model.device())?;
        self.optimizer.backward_step(&loss)?;

        let loss_value = loss.to_scalar::<f32>()? as f64;
        let advantage = policy.mean_advantage();
        self.tracker.track(sink, "advantage", advantage, self.batch_idx)?;
        self.tracker.track(sink, "loss_policy", loss_value, self.batch_idx)?;
        self.tracker.track(sink, "loss_total", loss_value, self.batch_idx)?;

        Ok(Some(BatchReport {
            batch_idx: self.batch_idx,
            loss: loss_value,
            advantage,
            trajectories: policy.trajectories(),
            tokens: policy.actions.len(),
        }))
    }

    /// Shuffle `train` and run every batch once.
    pub fn run_epoch(
        &mut self,
        train: &mut [PhrasePair],
        sink: &mut dyn MetricsSink,
    ) -> Result<EpochStats> {
        shuffle_epoch(train, &mut self.rng);
        let mut stats = EpochStats::default();
        for batch in iterate_batches(train, self.config.batch_size) {
            self.train_batch(batch, &mut stats, sink)?;
        }
        Ok(stats)
    }

    /// Evaluate, emit epoch metrics and write checkpoints.
    pub fn end_epoch(
        &mut self,
        epoch: usize,
        stats: &EpochStats,
        test: &[PhrasePair],
        sink: &mut dyn MetricsSink,
    ) -> Result<EpochSummary> {
        let bleu_test = run_test(&self.model, test, TOK_BEG, TOK_END, self.max_tokens)?;
        let summary = EpochSummary {
            epoch,
            bleu_test,
            bleu_argmax: stats.mean_argmax(),
            bleu_sample: stats.mean_sample(),
            skip_rate: stats.skip_rate(),
            new_best: self.best.update(bleu_test),
        };

        let step = self.batch_idx;
        sink.add_scalar("bleu_test", summary.bleu_test, step)?;
        sink.add_scalar("bleu_argmax", summary.bleu_argmax, step)?;
        sink.add_scalar("bleu_sample", summary.bleu_sample, step)?;
        sink.add_scalar("skipped_samples", summary.skip_rate, step)?;
        sink.add_scalar("epoch", step as f64, epoch)?;
        sink.flush()?;
        info!(
            epoch,
            bleu_test = summary.bleu_test,
            bleu_argmax = summary.bleu_argmax,
            skipped = stats.skipped,
            "epoch finished"
        );

        if let Some(dir) = &self.save_dir {
            if summary.new_best {
                info!(bleu_test, "best bleu updated");
                save_checkpoint(self.model.varmap(), &dir.join(best_name(bleu_test, epoch)))?;
            }
            if epoch % self.config.save_every == 0 {
                let name = periodic_name(epoch, summary.bleu_argmax, bleu_test);
                save_checkpoint(self.model.varmap(), &dir.join(name))?;
            }
        }
        Ok(summary)
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
            samples = self.config.samples,
            skip = self.config.skip_enabled,
            "starting self-critical training"
        );
        for epoch in 0..self.config.max_epochs {
            let stats = self.run_epoch(&mut train, sink)?;
            self.end_epoch(epoch, &stats, test, sink)?;
        }
        Ok(self.best.get())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
