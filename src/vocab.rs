// Word-level vocabulary for the dialogue model.
// Special tokens occupy the first three ids; every other id is a corpus word
// that passed the frequency cut.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::data::TokenPair;

// ---------------------------------------------------------------------------
// Special tokens
// ---------------------------------------------------------------------------

pub const UNKNOWN_TOKEN: &str = "#UNK";
pub const BEGIN_TOKEN: &str = "#BEG";
pub const END_TOKEN: &str = "#END";

pub const TOK_UNK: u32 = 0;
pub const TOK_BEG: u32 = 1;
pub const TOK_END: u32 = 2;

pub const VOCAB_FILE: &str = "vocab.json";

/// A phrase pair as words, before encoding.
pub type WordPair = (Vec<String>, Vec<String>);

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Lowercase word tokenizer. Apostrophes stay inside words ("don't"),
/// every other ASCII punctuation mark becomes its own token.
pub fn tokenize(s: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut cur = String::new();
    fn flush(out: &mut Vec<String>, cur: &mut String) {
        if !cur.is_empty() {
            out.push(std::mem::take(cur));
        }
    }
    for ch in s.chars() {
        if ch.is_alphanumeric() || ch == '\'' {
            cur.extend(ch.to_lowercase());
            continue;
        }
        flush(&mut out, &mut cur);
        if ch.is_ascii_punctuation() {
            out.push(ch.to_string());
        }
    }
    flush(&mut out, &mut cur);
    out
}

/// Join words back into a sentence. Punctuation and clitics attach to the
/// previous word.
pub fn untokenize<S: AsRef<str>>(words: &[S]) -> String {
    let mut out = String::new();
    for w in words {
        let w = w.as_ref();
        let attach = w.starts_with('\'')
            || (w.chars().count() == 1 && w.chars().all(|c| c.is_ascii_punctuation()));
        if !attach && !out.is_empty() {
            out.push(' ');
        }
        out.push_str(w);
    }
    out
}

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vocabulary {
    words: Vec<String>,
    #[serde(skip)]
    ids: HashMap<String, u32>,
}

impl Vocabulary {
    pub fn from_words(words: Vec<String>) -> Self {
        let ids = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        Self { words, ids }
    }

    /// Build the vocabulary from phrase pairs, keeping only words in `freq_set`.
    /// Ids are assigned in first-seen order after the special tokens.
    pub fn from_phrase_pairs(pairs: &[WordPair], freq_set: &HashSet<String>) -> Self {
        let mut words = vec![
            UNKNOWN_TOKEN.to_string(),
            BEGIN_TOKEN.to_string(),
            END_TOKEN.to_string(),
        ];
        let mut seen: HashSet<String> = words.iter().cloned().collect();
        for (p1, p2) in pairs {
            for w in p1.iter().chain(p2.iter()) {
                let w = w.to_lowercase();
                if freq_set.contains(&w) && seen.insert(w.clone()) {
                    words.push(w);
                }
            }
        }
        Self::from_words(words)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn id(&self, word: &str) -> u32 {
        self.ids.get(word).copied().unwrap_or(TOK_UNK)
    }

    pub fn word(&self, id: u32) -> &str {
        self.words
            .get(id as usize)
            .map(|s| s.as_str())
            .unwrap_or(UNKNOWN_TOKEN)
    }

    pub fn begin_id(&self) -> u32 {
        self.id(BEGIN_TOKEN)
    }

    pub fn end_id(&self) -> u32 {
        self.id(END_TOKEN)
    }

    /// Encode words as `[#BEG, w.., #END]`; unknown words map to `#UNK`.
    pub fn encode_words<S: AsRef<str>>(&self, words: &[S]) -> Vec<u32> {
        let mut out = Vec::with_capacity(words.len() + 2);
        out.push(self.begin_id());
        out.extend(words.iter().map(|w| self.id(&w.as_ref().to_lowercase())));
        out.push(self.end_id());
        out
    }

    /// Encode every pair, dropping pairs that contain an unknown word.
    pub fn encode_phrase_pairs(&self, pairs: &[WordPair]) -> Vec<TokenPair> {
        pairs
            .iter()
            .map(|(p1, p2)| (self.encode_words(p1), self.encode_words(p2)))
            .filter(|(src, tgt)| !src.contains(&TOK_UNK) && !tgt.contains(&TOK_UNK))
            .collect()
    }

    pub fn decode_words(&self, ids: &[u32]) -> Vec<&str> {
        ids.iter().map(|&id| self.word(id)).collect()
    }

    /// Decode to a display string, skipping the begin/end markers.
    pub fn decode_text(&self, ids: &[u32]) -> String {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| id != TOK_BEG && id != TOK_END)
            .map(|&id| self.word(id))
            .collect();
        untokenize(&words)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(VOCAB_FILE);
        let json = serde_json::to_string(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write vocabulary to {}", path.display()))?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(VOCAB_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read vocabulary from {}", path.display()))?;
        let raw: Vocabulary = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse vocabulary {}", path.display()))?;
        Ok(Self::from_words(raw.words))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
