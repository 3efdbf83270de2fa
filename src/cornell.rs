// Cornell movie-dialogs corpus loader.
//
// Layout (fields separated by " +++$+++ ", latin-1 text):
//   movie_titles_metadata.txt   movie_id, title, year, rating, votes, ['genre', ...]
//   movie_lines.txt             line_id, user_id, movie_id, character, text
//   movie_conversations.txt     user_a, user_b, movie_id, ['L1', 'L2', ...]

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::vocab::{tokenize, Vocabulary, WordPair};

const SEPARATOR: &str = " +++$+++ ";
const TITLES_FILE: &str = "movie_titles_metadata.txt";
const LINES_FILE: &str = "movie_lines.txt";
const CONVERSATIONS_FILE: &str = "movie_conversations.txt";

pub const MAX_TOKENS: usize = 20;
pub const MIN_TOKEN_FREQ: usize = 10;

/// A dialogue is an ordered list of tokenized phrases.
pub type Dialogue = Vec<Vec<String>>;

fn read_latin1_lines(path: &Path) -> Result<Vec<String>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let text: String = bytes.iter().map(|&b| b as char).collect();
    Ok(text.lines().map(str::to_string).collect())
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split(SEPARATOR).map(str::trim).collect()
}

/// Parse a python-style list literal: "['a', 'b']" -> ["a", "b"].
fn parse_list(field: &str) -> Vec<String> {
    field
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().trim_matches('\'').trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Movie ids whose genre list contains `genre`.
pub fn read_movie_set(dir: &Path, genre: &str) -> Result<HashSet<String>> {
    let mut movies = HashSet::new();
    for line in read_latin1_lines(&dir.join(TITLES_FILE))? {
        let fields = split_fields(&line);
        if fields.len() < 6 {
            continue;
        }
        if parse_list(fields[5]).iter().any(|g| g == genre) {
            movies.insert(fields[0].to_string());
        }
    }
    Ok(movies)
}

/// Tokenized lines keyed by line id, optionally restricted to `movies`.
pub fn read_phrases(
    dir: &Path,
    movies: Option<&HashSet<String>>,
) -> Result<HashMap<String, Vec<String>>> {
    let mut phrases = HashMap::new();
    for line in read_latin1_lines(&dir.join(LINES_FILE))? {
        let fields = split_fields(&line);
        if fields.len() < 5 {
            continue;
        }
        if let Some(set) = movies {
            if !set.contains(fields[2]) {
                continue;
            }
        }
        let tokens = tokenize(fields[4]);
        if !tokens.is_empty() {
            phrases.insert(fields[0].to_string(), tokens);
        }
    }
    Ok(phrases)
}

pub fn load_conversations(
    dir: &Path,
    phrases: &HashMap<String, Vec<String>>,
    movies: Option<&HashSet<String>>,
) -> Result<Vec<Dialogue>> {
    let mut dialogues = Vec::new();
    for line in read_latin1_lines(&dir.join(CONVERSATIONS_FILE))? {
        let fields = split_fields(&line);
        if fields.len() < 4 {
            continue;
        }
        if let Some(set) = movies {
            if !set.contains(fields[2]) {
                continue;
            }
        }
        let dial: Dialogue = parse_list(fields[3])
            .iter()
            .filter_map(|id| phrases.get(id).cloned())
            .collect();
        if !dial.is_empty() {
            dialogues.push(dial);
        }
    }
    Ok(dialogues)
}

/// Load dialogues, restricted to one genre unless `genre_filter` is empty.
pub fn load_dialogues(dir: &Path, genre_filter: &str) -> Result<Vec<Dialogue>> {
    let movies = if genre_filter.is_empty() {
        None
    } else {
        let set = read_movie_set(dir, genre_filter)?;
        info!(movies = set.len(), genre = genre_filter, "loaded movie set");
        Some(set)
    };
    let phrases = read_phrases(dir, movies.as_ref())?;
    info!(phrases = phrases.len(), "read and tokenized phrases");
    load_conversations(dir, &phrases, movies.as_ref())
}

/// Consecutive phrases of each dialogue become (prompt, reply) pairs when both
/// fit in `max_tokens`.
pub fn dialogues_to_pairs(dialogues: &[Dialogue], max_tokens: usize) -> Vec<WordPair> {
    let mut pairs = Vec::new();
    for dial in dialogues {
        for w in dial.windows(2) {
            if w[0].len() <= max_tokens && w[1].len() <= max_tokens {
                pairs.push((w[0].clone(), w[1].clone()));
            }
        }
    }
    pairs
}

/// Load phrase pairs and the vocabulary of words seen at least
/// `min_token_freq` times.
pub fn load_data(
    dir: &Path,
    genre_filter: &str,
    max_tokens: usize,
    min_token_freq: usize,
) -> Result<(Vec<WordPair>, Vocabulary)> {
    let dialogues = load_dialogues(dir, genre_filter)?;
    if dialogues.is_empty() {
        bail!(
            "no dialogues found in {} for genre filter '{}'",
            dir.display(),
            genre_filter
        );
    }
    let n_phrases: usize = dialogues.iter().map(Vec::len).sum();
    info!(
        dialogues = dialogues.len(),
        phrases = n_phrases,
        "generating training pairs"
    );
    let pairs = dialogues_to_pairs(&dialogues, max_tokens);

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for phrase in dialogues.iter().flatten() {
        for w in phrase {
            *counts.entry(w.as_str()).or_insert(0) += 1;
        }
    }
    let freq_set: HashSet<String> = counts
        .iter()
        .filter(|&(_, &c)| c >= min_token_freq)
        .map(|(w, _)| w.to_string())
        .collect();
    info!(
        unique = counts.len(),
        frequent = freq_set.len(),
        min_token_freq,
        "counted word frequencies"
    );

    let vocab = Vocabulary::from_phrase_pairs(&pairs, &freq_set);
    Ok((pairs, vocab))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
