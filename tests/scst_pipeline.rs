// End-to-end runs on a toy Cornell-format corpus with a test-sized model:
// cross-entropy pre-training, then self-critical training from its checkpoint.

use anyhow::{anyhow, Result};
use candle_core::Device;
use scst_dialogue::config::Config;
use scst_dialogue::metrics::{ScalarRecord, METRICS_FILE};
use scst_dialogue::pipeline::{prepare_data, run_crossent, run_scst, RunPaths};
use scst_dialogue::vocab::{TOK_BEG, TOK_END, VOCAB_FILE};
use std::io::Write;
use std::path::{Path, PathBuf};

const LINES: &[&str] = &[
    "Hello there.",
    "Hi!",
    "How are you?",
    "Fine, thanks.",
    "Where are you going?",
    "Home.",
    "Why?",
    "I am tired.",
    "Go to bed.",
    "I will.",
    "Good night.",
    "Good night!",
];

fn write_corpus(dir: &Path) -> Result<()> {
    let mut titles = std::fs::File::create(dir.join("movie_titles_metadata.txt"))?;
    writeln!(titles, "m0 +++$+++ toy +++$+++ 2000 +++$+++ 7.0 +++$+++ 10 +++$+++ ['comedy']")?;
    writeln!(titles, "m1 +++$+++ other +++$+++ 2001 +++$+++ 5.0 +++$+++ 10 +++$+++ ['horror']")?;

    let mut lines = std::fs::File::create(dir.join("movie_lines.txt"))?;
    let mut ids = Vec::new();
    for (i, text) in LINES.iter().enumerate() {
        writeln!(lines, "L{i} +++$+++ u{} +++$+++ m0 +++$+++ X +++$+++ {text}", i % 2)?;
        ids.push(format!("'L{i}'"));
    }
    writeln!(lines, "L99 +++$+++ u5 +++$+++ m1 +++$+++ Y +++$+++ Run!")?;

    let mut convs = std::fs::File::create(dir.join("movie_conversations.txt"))?;
    writeln!(convs, "u0 +++$+++ u1 +++$+++ m0 +++$+++ [{}]", ids.join(", "))?;
    writeln!(convs, "u5 +++$+++ u6 +++$+++ m1 +++$+++ ['L99']")?;
    Ok(())
}

fn read_metrics(dir: &Path) -> Result<Vec<ScalarRecord>> {
    let text = std::fs::read_to_string(dir.join(METRICS_FILE))?;
    Ok(text
        .lines()
        .map(serde_json::from_str)
        .collect::<std::result::Result<_, _>>()?)
}

fn checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |x| x == "safetensors"))
        .collect();
    out.sort();
    Ok(out)
}

#[test]
fn test_prepare_data_split_and_grouping() -> Result<()> {
    let corpus = tempfile::tempdir()?;
    write_corpus(corpus.path())?;
    let cfg = Config::tiny();
    let data = prepare_data(corpus.path(), "comedy", &cfg.data)?;

    // 12 consecutive lines give 11 pairs; 95% of 11 rounds down to 10
    let refs = |v: &[scst_dialogue::data::PhrasePair]| -> usize {
        v.iter().map(|p| p.references.len()).sum()
    };
    assert_eq!(refs(&data.train) + refs(&data.test), 11);
    assert_eq!(refs(&data.test), 1);
    for pair in data.train.iter().chain(&data.test) {
        assert_eq!(pair.source.first(), Some(&TOK_BEG));
        assert_eq!(pair.source.last(), Some(&TOK_END));
    }
    assert_eq!(data.vocab.id("run"), 0, "horror lines must be filtered out");

    let again = prepare_data(corpus.path(), "comedy", &cfg.data)?;
    assert_eq!(again.train, data.train);
    Ok(())
}

#[test]
fn test_crossent_then_scst() -> Result<()> {
    let corpus = tempfile::tempdir()?;
    write_corpus(corpus.path())?;
    let out = tempfile::tempdir()?;
    let saves = out.path().join("saves");
    let runs = out.path().join("runs");
    let cfg = Config::tiny();
    let device = Device::Cpu;

    let pre = RunPaths::new(&saves, &runs, "pre");
    let best = run_crossent(&cfg, corpus.path(), "comedy", &pre, &device)?;
    assert!(best.is_some());
    assert!(pre.save_dir().join(VOCAB_FILE).exists());
    let pre_ckpts = checkpoints(&pre.save_dir())?;
    let start = pre_ckpts
        .last()
        .ok_or_else(|| anyhow!("cross-entropy run saved no checkpoint"))?;

    let rl = RunPaths::new(&saves, &runs, "rl");
    let best = run_scst(&cfg, corpus.path(), "comedy", &rl, start, &device)?;
    let best = best.ok_or_else(|| anyhow!("no test score"))?;
    assert!((0.0..=1.0).contains(&best));

    let records = read_metrics(&rl.metrics_dir())?;
    let epochs: Vec<usize> = records
        .iter()
        .filter(|r| r.name == "epoch")
        .map(|r| r.step)
        .collect();
    assert_eq!(epochs, vec![0, 1]);
    for name in ["bleu_test", "bleu_argmax", "bleu_sample", "skipped_samples"] {
        let n = records.iter().filter(|r| r.name == name).count();
        assert_eq!(n, 2, "{name} should be written once per epoch");
    }
    for r in records.iter().filter(|r| r.name == "skipped_samples") {
        assert!((0.0..=1.0).contains(&r.value));
    }

    let names: Vec<String> = checkpoints(&rl.save_dir())?
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    assert!(names.iter().any(|n| n.starts_with("bleu_")));
    assert!(names.iter().any(|n| n.starts_with("epoch_000_")));
    assert!(names.iter().any(|n| n.starts_with("epoch_001_")));
    Ok(())
}

#[test]
fn test_scst_without_checkpoint_fails() -> Result<()> {
    let corpus = tempfile::tempdir()?;
    write_corpus(corpus.path())?;
    let out = tempfile::tempdir()?;
    let paths = RunPaths::new(out.path().join("saves"), out.path().join("runs"), "rl");
    let missing = out.path().join("nope.safetensors");
    let res = run_scst(&Config::tiny(), corpus.path(), "comedy", &paths, &missing, &Device::Cpu);
    assert!(res.is_err());
    Ok(())
}

#[test]
fn test_unknown_genre_fails() -> Result<()> {
    let corpus = tempfile::tempdir()?;
    write_corpus(corpus.path())?;
    assert!(prepare_data(corpus.path(), "western", &Config::tiny().data).is_err());
    Ok(())
}
