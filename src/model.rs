// Phrase model: embedding + LSTM encoder + LSTM decoder + output projection.
//
// The trainer only sees the `SequenceModel` capability interface; any model
// that can embed, encode a batch, slice one example out of the encoding and
// decode greedily or by sampling can be trained.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};
use rand::Rng;

use crate::config::ModelConfig;

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

/// Generated tokens with the per-step logits that produced them.
/// `logits` is `(tokens.len(), vocab)`; row `i` scored `tokens[i]`.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub logits: Tensor,
    pub tokens: Vec<u32>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

pub trait SequenceModel {
    /// Encoder output for a batch, or for one example after `encoded_item`.
    type Encoded: Clone;

    fn device(&self) -> &Device;

    /// Trainable parameters (optimizer + checkpoints).
    fn varmap(&self) -> &VarMap;

    /// `(ids.len(), embedding_dim)`
    fn embed(&self, ids: &[u32]) -> Result<Tensor>;

    /// Encode every source of a batch in one call.
    fn encode(&self, sources: &[&[u32]]) -> Result<Self::Encoded>;

    fn encoded_item(&self, encoded: &Self::Encoded, index: usize) -> Result<Self::Encoded>;

    /// Highest-scoring token at every step. Stops after emitting `stop_token`
    /// or after `max_len` tokens.
    fn decode_greedy(
        &self,
        encoded: &Self::Encoded,
        start: &Tensor,
        max_len: usize,
        stop_token: u32,
    ) -> Result<Trajectory>;

    /// Tokens drawn from the softmax of the logits. Same stopping rule.
    fn decode_sample<R: Rng + ?Sized>(
        &self,
        encoded: &Self::Encoded,
        start: &Tensor,
        max_len: usize,
        stop_token: u32,
        rng: &mut R,
    ) -> Result<Trajectory>;
}

// ---------------------------------------------------------------------------
// Token selection
// ---------------------------------------------------------------------------

pub fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Temperature sampling over a logit row.
pub fn sample_with_temperature<R: Rng + ?Sized>(logits: &[f32], temperature: f64, rng: &mut R) -> u32 {
    if logits.is_empty() {
        return 0;
    }
    let temp = temperature.max(1e-6) as f32;
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    let exps: Vec<f32> = logits.iter().map(|&l| ((l - max_logit) / temp).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let r: f32 = rng.gen::<f32>() * sum;
    let mut cumulative = 0.0f32;
    for (i, &e) in exps.iter().enumerate() {
        cumulative += e;
        if r < cumulative {
            return i as u32;
        }
    }
    (exps.len() - 1) as u32
}

// ---------------------------------------------------------------------------
// Gradient-safe LSTM cell (basic tensor ops only)
// ---------------------------------------------------------------------------

fn grad_sigmoid(x: &Tensor) -> Result<Tensor> {
    let denom = (x.neg()?.exp()? + 1.0)?;
    denom.recip().map_err(Into::into)
}

/// Hidden and cell state, both `(batch, hidden)`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

impl LstmState {
    pub fn zeros(batch: usize, hidden: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            h: Tensor::zeros((batch, hidden), DType::F32, device)?,
            c: Tensor::zeros((batch, hidden), DType::F32, device)?,
        })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.h.dim(0)?)
    }

    /// Row `index` as a batch of one.
    pub fn item(&self, index: usize) -> Result<Self> {
        Ok(Self {
            h: self.h.narrow(0, index, 1)?,
            c: self.c.narrow(0, index, 1)?,
        })
    }

    /// Rows where `mask` is 1 take `next`, the others keep `self`.
    fn blend(&self, next: &LstmState, mask: &Tensor) -> Result<Self> {
        let keep = mask.affine(-1.0, 1.0)?;
        let h = (next.h.broadcast_mul(mask)? + self.h.broadcast_mul(&keep)?)?;
        let c = (next.c.broadcast_mul(mask)? + self.c.broadcast_mul(&keep)?)?;
        Ok(Self { h, c })
    }
}

pub struct GradLstm {
    input_proj: Linear,
    hidden_proj: Linear,
    hidden: usize,
}

impl GradLstm {
    pub fn new(input: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_proj: linear(input, 4 * hidden, vb.pp("ih"))?,
            hidden_proj: linear(hidden, 4 * hidden, vb.pp("hh"))?,
            hidden,
        })
    }

    /// One step. `x`: `(batch, input)`.
    pub fn step(&self, x: &Tensor, state: &LstmState) -> Result<LstmState> {
        let gates = (self.input_proj.forward(x)? + self.hidden_proj.forward(&state.h)?)?;
        let gates = gates.chunk(4, 1)?;
        let i = grad_sigmoid(&gates[0])?;
        let f = grad_sigmoid(&gates[1])?;
        let g = gates[2].tanh()?;
        let o = grad_sigmoid(&gates[3])?;
        let c = (f.mul(&state.c)? + i.mul(&g)?)?;
        let h = o.mul(&c.tanh()?)?;
        Ok(LstmState { h, c })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }
}

// ---------------------------------------------------------------------------
// PhraseModel
// ---------------------------------------------------------------------------

pub struct PhraseModel {
    pub config: ModelConfig,
    vocab_size: usize,
    emb: Embedding,
    encoder: GradLstm,
    decoder: GradLstm,
    output: Linear,
    varmap: VarMap,
    device: Device,
}

impl PhraseModel {
    pub fn new(config: ModelConfig, vocab_size: usize, device: &Device) -> Result<Self> {
        ensure!(vocab_size > 0, "vocabulary is empty");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let emb = embedding(vocab_size, config.embedding_dim, vb.pp("emb"))?;
        let encoder = GradLstm::new(config.embedding_dim, config.hidden_size, vb.pp("encoder"))?;
        let decoder = GradLstm::new(config.embedding_dim, config.hidden_size, vb.pp("decoder"))?;
        let output = linear(config.hidden_size, vocab_size, vb.pp("output"))?;

        Ok(Self {
            config,
            vocab_size,
            emb,
            encoder,
            decoder,
            output,
            varmap,
            device: device.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn param_count(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// One decoder step: logits `(1, vocab)` and the next state.
    fn decode_one(&self, state: &LstmState, input: &Tensor) -> Result<(Tensor, LstmState)> {
        let next = self.decoder.step(input, state)?;
        let logits = self.output.forward(&next.h)?;
        Ok((logits, next))
    }

    fn decode_chain<F>(
        &self,
        encoded: &LstmState,
        start: &Tensor,
        max_len: usize,
        stop_token: u32,
        mut pick: F,
    ) -> Result<Trajectory>
    where
        F: FnMut(&[f32]) -> u32,
    {
        let mut state = encoded.clone();
        let mut cur = start.clone();
        let mut rows: Vec<Tensor> = Vec::with_capacity(max_len);
        let mut tokens: Vec<u32> = Vec::with_capacity(max_len);

        for _ in 0..max_len {
            let (logits, next) = self.decode_one(&state, &cur)?;
            state = next;
            let token = pick(&logits.i(0)?.to_vec1::<f32>()?);
            rows.push(logits);
            tokens.push(token);
            if token == stop_token {
                break;
            }
            cur = self.embed(&[token])?;
        }

        let logits = if rows.is_empty() {
            Tensor::zeros((0, self.vocab_size), DType::F32, &self.device)?
        } else {
            Tensor::cat(&rows, 0)?
        };
        Ok(Trajectory { logits, tokens })
    }

    /// Teacher forcing: feed `inputs` one by one, return logits `(inputs.len(), vocab)`.
    pub fn decode_teacher(&self, encoded: &LstmState, inputs: &[u32]) -> Result<Tensor> {
        ensure!(!inputs.is_empty(), "teacher forcing needs at least one input token");
        let embs = self.embed(inputs)?;
        let mut state = encoded.clone();
        let mut hidden = Vec::with_capacity(inputs.len());
        for t in 0..inputs.len() {
            state = self.decoder.step(&embs.narrow(0, t, 1)?, &state)?;
            hidden.push(state.h.clone());
        }
        let hidden = Tensor::cat(&hidden, 0)?;
        self.output.forward(&hidden).map_err(Into::into)
    }
}

impl SequenceModel for PhraseModel {
    type Encoded = LstmState;

    fn device(&self) -> &Device {
        &self.device
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn embed(&self, ids: &[u32]) -> Result<Tensor> {
        let ids = Tensor::new(ids, &self.device)?;
        self.emb.forward(&ids).map_err(Into::into)
    }

    /// Sources may differ in length: rows stop updating once their own
    /// sequence is exhausted, so each row holds the state after its last token.
    fn encode(&self, sources: &[&[u32]]) -> Result<LstmState> {
        ensure!(!sources.is_empty(), "cannot encode an empty batch");
        let batch = sources.len();
        let max_len = sources.iter().map(|s| s.len()).max().unwrap_or(0);

        let mut flat = Vec::with_capacity(batch * max_len);
        for s in sources {
            flat.extend_from_slice(s);
            flat.resize(flat.len() + max_len - s.len(), 0);
        }
        let ids = Tensor::from_vec(flat, (batch, max_len), &self.device)?;
        let embs = self.emb.forward(&ids)?;

        let mut state = LstmState::zeros(batch, self.encoder.hidden_size(), &self.device)?;
        for t in 0..max_len {
            let x = embs.i((.., t, ..))?.contiguous()?;
            let next = self.encoder.step(&x, &state)?;
            if sources.iter().all(|s| t < s.len()) {
                state = next;
            } else {
                let mask: Vec<f32> = sources
                    .iter()
                    .map(|s| if t < s.len() { 1.0 } else { 0.0 })
                    .collect();
                let mask = Tensor::from_vec(mask, (batch, 1), &self.device)?;
                state = state.blend(&next, &mask)?;
            }
        }
        Ok(state)
    }

    fn encoded_item(&self, encoded: &LstmState, index: usize) -> Result<LstmState> {
        let batch = encoded.batch_size()?;
        ensure!(index < batch, "item {index} out of range for batch of {batch}");
        encoded.item(index)
    }

    fn decode_greedy(
        &self,
        encoded: &LstmState,
        start: &Tensor,
        max_len: usize,
        stop_token: u32,
    ) -> Result<Trajectory> {
        self.decode_chain(encoded, start, max_len, stop_token, argmax)
    }

    fn decode_sample<R: Rng + ?Sized>(
        &self,
        encoded: &LstmState,
        start: &Tensor,
        max_len: usize,
        stop_token: u32,
        rng: &mut R,
    ) -> Result<Trajectory> {
        self.decode_chain(encoded, start, max_len, stop_token, |row| {
            sample_with_temperature(row, 1.0, rng)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
