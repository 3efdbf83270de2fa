// Held-out evaluation: greedy decoding scored against every reference.

use anyhow::Result;

use crate::bleu::{bleu_many, strip_begin};
use crate::data::PhrasePair;
use crate::model::SequenceModel;

/// Mean greedy BLEU over `test_data`. Each source is encoded on its own.
/// Reads parameters only; an empty set scores 0.
pub fn run_test<M: SequenceModel>(
    model: &M,
    test_data: &[PhrasePair],
    begin_token: u32,
    end_token: u32,
    max_tokens: usize,
) -> Result<f64> {
    if test_data.is_empty() {
        return Ok(0.0);
    }
    let start = model.embed(&[begin_token])?;
    let mut bleu_sum = 0.0;
    for pair in test_data {
        let encoded = model.encode(&[pair.source.as_slice()])?;
        let item = model.encoded_item(&encoded, 0)?;
        let greedy = model.decode_greedy(&item, &start, max_tokens, end_token)?;
        bleu_sum += bleu_many(&greedy.tokens, &strip_begin(&pair.references));
    }
    Ok(bleu_sum / test_data.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::PhraseModel;
    use crate::scripted::ScriptedModel;
    use candle_core::Device;
    use std::collections::BTreeMap;

    fn pair(source: &[u32], refs: &[&[u32]]) -> PhrasePair {
        PhrasePair {
            source: source.to_vec(),
            references: refs.iter().map(|r| r.to_vec()).collect(),
        }
    }

    #[test]
    fn test_empty_set_scores_zero() -> Result<()> {
        let model = ScriptedModel::new(8)?;
        assert_eq!(run_test(&model, &[], 1, 2, 5)?, 0.0);
        assert_eq!(model.greedy_calls.get(), 0);
        Ok(())
    }

    #[test]
    fn test_mean_of_best_reference_scores() -> Result<()> {
        let model = ScriptedModel::new(8)?
            .with_greedy(&[1, 3, 2], &[4, 5, 2])
            .with_greedy(&[1, 6, 2], &[7, 7, 7]);
        let data = vec![
            // second reference matches exactly once #BEG is stripped
            pair(&[1, 3, 2], &[&[1, 6, 2], &[1, 4, 5, 2]]),
            pair(&[1, 6, 2], &[&[1, 3, 2]]),
        ];
        let score = run_test(&model, &data, 1, 2, 5)?;
        assert!((score - 0.5).abs() < 1e-9, "score {score}");
        assert_eq!(model.encode_calls.get(), 2);
        Ok(())
    }

    #[test]
    fn test_evaluation_is_idempotent_and_read_only() -> Result<()> {
        let model = PhraseModel::new(
            ModelConfig {
                embedding_dim: 6,
                hidden_size: 10,
            },
            9,
            &Device::Cpu,
        )?;
        let data = vec![
            pair(&[1, 3, 4, 2], &[&[1, 5, 2], &[1, 6, 7, 2]]),
            pair(&[1, 8, 2], &[&[1, 3, 2]]),
        ];
        let snapshot = |m: &PhraseModel| -> Result<BTreeMap<String, Vec<f32>>> {
            let data = m.varmap().data().lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            let values: Result<BTreeMap<String, Vec<f32>>> = data
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
                .collect();
            values
        };
        let before = snapshot(&model)?;
        let a = run_test(&model, &data, 1, 2, 6)?;
        let b = run_test(&model, &data, 1, 2, 6)?;
        assert_eq!(a, b);
        assert!((0.0..=1.0).contains(&a));
        assert_eq!(before, snapshot(&model)?);
        Ok(())
    }
}
