// Training data shaping: grouping replies by source phrase, the train/test
// split and per-epoch batching.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Seed of the one-off shuffle that precedes the train/test split.
pub const SHUFFLE_SEED: u64 = 5871;
pub const TRAIN_RATIO: f64 = 0.95;

/// One encoded (source, reply) pair.
pub type TokenPair = (Vec<u32>, Vec<u32>);

/// A source phrase with every reference reply observed for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhrasePair {
    pub source: Vec<u32>,
    pub references: Vec<Vec<u32>>,
}

/// Group replies by source. One entry per distinct source, in first-seen
/// order; each reference list keeps every reply in input order.
pub fn group_by_source(pairs: Vec<TokenPair>) -> Vec<PhrasePair> {
    let mut index: HashMap<Vec<u32>, usize> = HashMap::new();
    let mut groups: Vec<PhrasePair> = Vec::new();
    for (source, reply) in pairs {
        match index.get(&source) {
            Some(&i) => groups[i].references.push(reply),
            None => {
                index.insert(source.clone(), groups.len());
                groups.push(PhrasePair {
                    source,
                    references: vec![reply],
                });
            }
        }
    }
    groups
}

/// Deterministic shuffle used once before splitting.
pub fn shuffle_with_seed<T>(data: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    data.shuffle(&mut rng);
}

/// Split at `ratio`; the head is the training part.
pub fn split_train_test<T>(mut data: Vec<T>, ratio: f64) -> (Vec<T>, Vec<T>) {
    let count = ((data.len() as f64) * ratio.clamp(0.0, 1.0)) as usize;
    let test = data.split_off(count);
    (data, test)
}

/// Fresh full permutation for one epoch.
pub fn shuffle_epoch<T, R: Rng + ?Sized>(data: &mut [T], rng: &mut R) {
    data.shuffle(rng);
}

/// Contiguous batches of at most `batch_size`; the last one may be shorter.
pub fn iterate_batches<T>(data: &[T], batch_size: usize) -> impl Iterator<Item = &[T]> {
    data.chunks(batch_size.max(1))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
