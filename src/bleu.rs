// Reward scorer: sentence-level BLEU over token ids.
//
// Orders 1 and 2 with equal weights, clipped precision, brevity penalty and
// "method 1" smoothing (zero numerators become EPSILON). Multi-reference
// scoring takes the best single-reference score.

use std::collections::HashMap;

const WEIGHTS: [f64; 2] = [0.5, 0.5];
const EPSILON: f64 = 0.1;

/// Lowest score the scorer can return.
pub const MIN_SCORE: f64 = 0.0;

fn ngram_counts(tokens: &[u32], n: usize) -> HashMap<&[u32], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

/// (clipped matches, total candidate n-grams) for order `n`.
fn modified_precision(candidate: &[u32], reference: &[u32], n: usize) -> (usize, usize) {
    let cand = ngram_counts(candidate, n);
    let refs = ngram_counts(reference, n);
    let total: usize = cand.values().sum();
    let matched = cand
        .iter()
        .map(|(gram, &count)| count.min(refs.get(gram).copied().unwrap_or(0)))
        .sum();
    (matched, total)
}

fn brevity_penalty(cand_len: usize, ref_len: usize) -> f64 {
    if cand_len == 0 {
        return 0.0;
    }
    if cand_len > ref_len {
        1.0
    } else {
        (1.0 - ref_len as f64 / cand_len as f64).exp()
    }
}

/// BLEU of `candidate` against a single reference, in [0, 1].
pub fn sentence_bleu(candidate: &[u32], reference: &[u32]) -> f64 {
    if candidate.is_empty() {
        return MIN_SCORE;
    }

    let mut log_sum = 0.0f64;
    for (i, &w) in WEIGHTS.iter().enumerate() {
        let (matched, total) = modified_precision(candidate, reference, i + 1);
        if i == 0 && matched == 0 {
            return MIN_SCORE;
        }
        let denom = total.max(1) as f64;
        let p = if matched == 0 {
            EPSILON / denom
        } else {
            matched as f64 / denom
        };
        log_sum += w * p.ln();
    }

    let score = brevity_penalty(candidate.len(), reference.len()) * log_sum.exp();
    score.clamp(MIN_SCORE, 1.0)
}

/// Best-of-N score of `candidate` against every reference.
pub fn bleu_many<R: AsRef<[u32]>>(candidate: &[u32], references: &[R]) -> f64 {
    references
        .iter()
        .map(|r| sentence_bleu(candidate, r.as_ref()))
        .fold(MIN_SCORE, f64::max)
}

/// Drop the leading begin marker from every reference.
pub fn strip_begin(references: &[Vec<u32>]) -> Vec<&[u32]> {
    references
        .iter()
        .map(|r| if r.is_empty() { &r[..] } else { &r[1..] })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
