// Deterministic SequenceModel for trainer tests: outputs are looked up per
// source, logits come from one trainable bias row.

use anyhow::{anyhow, ensure, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use rand::Rng;
use std::cell::Cell;
use std::collections::HashMap;

use crate::model::{SequenceModel, Trajectory};

pub struct ScriptedModel {
    varmap: VarMap,
    bias: Var,
    vocab: usize,
    device: Device,
    greedy: HashMap<Vec<u32>, Vec<u32>>,
    sampled: HashMap<Vec<u32>, Vec<u32>>,
    pub encode_calls: Cell<usize>,
    pub greedy_calls: Cell<usize>,
    pub sample_calls: Cell<usize>,
}

impl ScriptedModel {
    pub fn new(vocab: usize) -> Result<Self> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints(vocab, "bias", Init::Const(0.0))?;
        let bias = varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .get("bias")
            .cloned()
            .ok_or_else(|| anyhow!("bias not registered"))?;
        Ok(Self {
            varmap,
            bias,
            vocab,
            device,
            greedy: HashMap::new(),
            sampled: HashMap::new(),
            encode_calls: Cell::new(0),
            greedy_calls: Cell::new(0),
            sample_calls: Cell::new(0),
        })
    }

    /// Greedy output for `source`.
    pub fn with_greedy(mut self, source: &[u32], tokens: &[u32]) -> Self {
        self.greedy.insert(source.to_vec(), tokens.to_vec());
        self
    }

    /// Every sampled output for `source`.
    pub fn with_sample(mut self, source: &[u32], tokens: &[u32]) -> Self {
        self.sampled.insert(source.to_vec(), tokens.to_vec());
        self
    }

    pub fn bias(&self) -> Result<Vec<f32>> {
        Ok(self.bias.as_tensor().to_vec1::<f32>()?)
    }

    fn trajectory(&self, tokens: &[u32], max_len: usize, stop: u32) -> Result<Trajectory> {
        let mut out = Vec::new();
        for &t in tokens.iter().take(max_len) {
            out.push(t);
            if t == stop {
                break;
            }
        }
        let logits = self
            .bias
            .as_tensor()
            .unsqueeze(0)?
            .broadcast_as((out.len(), self.vocab))?
            .contiguous()?;
        Ok(Trajectory { logits, tokens: out })
    }
}

impl SequenceModel for ScriptedModel {
    type Encoded = Vec<Vec<u32>>;

    fn device(&self) -> &Device {
        &self.device
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn embed(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::zeros((ids.len(), 1), DType::F32, &self.device)?)
    }

    fn encode(&self, sources: &[&[u32]]) -> Result<Self::Encoded> {
        self.encode_calls.set(self.encode_calls.get() + 1);
        Ok(sources.iter().map(|s| s.to_vec()).collect())
    }

    fn encoded_item(&self, encoded: &Self::Encoded, index: usize) -> Result<Self::Encoded> {
        ensure!(index < encoded.len(), "item {index} out of range");
        Ok(vec![encoded[index].clone()])
    }

    fn decode_greedy(
        &self,
        encoded: &Self::Encoded,
        _start: &Tensor,
        max_len: usize,
        stop_token: u32,
    ) -> Result<Trajectory> {
        self.greedy_calls.set(self.greedy_calls.get() + 1);
        let tokens = self
            .greedy
            .get(&encoded[0])
            .ok_or_else(|| anyhow!("no greedy script for {:?}", encoded[0]))?;
        self.trajectory(tokens, max_len, stop_token)
    }

    fn decode_sample<R: Rng + ?Sized>(
        &self,
        encoded: &Self::Encoded,
        _start: &Tensor,
        max_len: usize,
        stop_token: u32,
        _rng: &mut R,
    ) -> Result<Trajectory> {
        self.sample_calls.set(self.sample_calls.get() + 1);
        let tokens = self
            .sampled
            .get(&encoded[0])
            .ok_or_else(|| anyhow!("no sample script for {:?}", encoded[0]))?;
        self.trajectory(tokens, max_len, stop_token)
    }
}
