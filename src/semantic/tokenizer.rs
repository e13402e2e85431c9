//! CLIP byte-pair-encoding tokenizer for text queries.
//!
//! Text queries have to land in the same embedding space as the vision
//! encoder, so this reproduces the CLIP vocabulary/merge-rank algorithm:
//!
//! 1. Drop every character outside `[A-Za-z0-9 ]` and lowercase the rest
//! 2. Split into words on whitespace
//! 3. Split each word into characters, marking the last one with `</w>`
//! 4. Repeatedly merge the adjacent pair with the lowest merge rank
//! 5. Look every resulting subword up in the vocabulary
//!
//! The caller wraps the content ids into a fixed [`TokenSequence`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Begin-of-sequence sentinel of the CLIP vocabulary
pub const BOS_TOKEN: u32 = 49406;

/// End-of-sequence sentinel of the CLIP vocabulary
pub const EOS_TOKEN: u32 = 49407;

/// Fixed length of every sequence fed to the text encoder
pub const CONTEXT_LENGTH: usize = 77;

/// Room left for content once both sentinels are placed
pub const MAX_CONTENT_TOKENS: usize = CONTEXT_LENGTH - 2;

/// Marker appended to the last symbol of every word
pub const WORD_END: &str = "</w>";

static QUERY_FILTER: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^A-Za-z0-9 ]").expect("query filter regex is valid"));

/// Errors raised while loading tokenizer assets or encoding text.
#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vocabulary is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed merge rule on line {line}: {content:?}")]
    MalformedMerge { line: usize, content: String },

    #[error("subword {0:?} is not in the vocabulary")]
    UnknownToken(String),
}

/// What to do with a subword that has no vocabulary entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTokenPolicy {
    /// Drop the subword and keep encoding
    #[default]
    Skip,
    /// Abort encoding with [`TokenizerError::UnknownToken`]
    Fail,
}

/// Subword string to token id mapping.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    ids: HashMap<String, u32>,
}

impl Vocabulary {
    /// Parse a `vocab.json` object of `{"subword": id}` entries.
    pub fn from_json(json: &str) -> Result<Self, TokenizerError> {
        let ids: HashMap<String, u32> = serde_json::from_str(json)?;
        Ok(Self { ids })
    }

    pub fn load(path: &Path) -> Result<Self, TokenizerError> {
        let json = read_asset(path)?;
        Self::from_json(&json)
    }

    pub fn get(&self, subword: &str) -> Option<u32> {
        self.ids.get(subword).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for Vocabulary {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(|(s, id)| (s.into(), id)).collect(),
        }
    }
}

/// Ordered pair of subwords to merge rank. Lower rank merges first.
#[derive(Debug, Clone, Default)]
pub struct MergeTable {
    /// left subword -> right subword -> rank
    ranks: HashMap<String, HashMap<String, u32>>,
    len: usize,
}

impl MergeTable {
    /// Build a table from pairs listed in priority order.
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, S)>) -> Self {
        let mut ranks: HashMap<String, HashMap<String, u32>> = HashMap::new();
        let mut len = 0;
        for (rank, (left, right)) in pairs.into_iter().enumerate() {
            let rights = ranks.entry(left.into()).or_default();
            if rights.insert(right.into(), rank as u32).is_none() {
                len += 1;
            }
        }
        Self { ranks, len }
    }

    /// Parse a `merges.txt` listing: one space separated pair per line,
    /// line order is the rank. A leading `#version` header is skipped.
    pub fn parse(text: &str) -> Result<Self, TokenizerError> {
        let mut pairs = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || (idx == 0 && line.starts_with("#version")) {
                continue;
            }

            let mut parts = line.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(left), Some(right), None) if !left.is_empty() && !right.is_empty() => {
                    pairs.push((left.to_string(), right.to_string()));
                }
                _ => {
                    return Err(TokenizerError::MalformedMerge {
                        line: idx + 1,
                        content: line.to_string(),
                    })
                }
            }
        }

        Ok(Self::from_pairs(pairs))
    }

    pub fn load(path: &Path) -> Result<Self, TokenizerError> {
        let text = read_asset(path)?;
        Self::parse(&text)
    }

    pub fn rank(&self, left: &str, right: &str) -> Option<u32> {
        self.ranks.get(left)?.get(right).copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn read_asset(path: &Path) -> Result<String, TokenizerError> {
    std::fs::read_to_string(path).map_err(|source| TokenizerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// CLIP BPE tokenizer. Immutable once built and safe to share.
pub struct BpeTokenizer {
    vocab: Vocabulary,
    merges: MergeTable,
    unknown: UnknownTokenPolicy,
}

impl BpeTokenizer {
    pub fn new(vocab: Vocabulary, merges: MergeTable, unknown: UnknownTokenPolicy) -> Self {
        Self {
            vocab,
            merges,
            unknown,
        }
    }

    /// Load `vocab.json` and `merges.txt` from disk.
    pub fn from_files(
        vocab_path: &Path,
        merges_path: &Path,
        unknown: UnknownTokenPolicy,
    ) -> Result<Self, TokenizerError> {
        let vocab = Vocabulary::load(vocab_path)?;
        let merges = MergeTable::load(merges_path)?;
        log::debug!(
            "loaded tokenizer: {} subwords, {} merge rules",
            vocab.len(),
            merges.len()
        );
        Ok(Self::new(vocab, merges, unknown))
    }

    /// Encode text into content token ids, without sentinels.
    ///
    /// At most [`MAX_CONTENT_TOKENS`] ids are returned.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        let cleaned = clean_text(text);
        let mut ids = Vec::new();

        for word in cleaned.split_whitespace() {
            for subword in self.bpe(word) {
                match self.vocab.get(&subword) {
                    Some(id) => ids.push(id),
                    None => match self.unknown {
                        UnknownTokenPolicy::Skip => {
                            log::debug!("dropping out-of-vocabulary subword {subword:?}");
                        }
                        UnknownTokenPolicy::Fail => {
                            return Err(TokenizerError::UnknownToken(subword));
                        }
                    },
                }
            }

            if ids.len() >= MAX_CONTENT_TOKENS {
                break;
            }
        }

        ids.truncate(MAX_CONTENT_TOKENS);
        Ok(ids)
    }

    /// Encode text straight into the fixed-length model input.
    pub fn encode_sequence(&self, text: &str) -> Result<TokenSequence, TokenizerError> {
        Ok(TokenSequence::wrap(&self.encode(text)?))
    }

    /// Split one word into merged subwords.
    fn bpe(&self, word: &str) -> Vec<String> {
        let mut symbols: Vec<String> = word.chars().map(String::from).collect();
        match symbols.last_mut() {
            Some(last) => last.push_str(WORD_END),
            None => return symbols,
        }

        while symbols.len() > 1 {
            let Some((left, right)) = self.best_pair(&symbols) else {
                break;
            };
            symbols = merge_pair(symbols, &left, &right);
        }

        symbols
    }

    /// Lowest-ranked adjacent pair; the leftmost one wins a tie.
    fn best_pair(&self, symbols: &[String]) -> Option<(String, String)> {
        let mut best: Option<(u32, usize)> = None;

        for (pos, pair) in symbols.windows(2).enumerate() {
            if let Some(rank) = self.merges.rank(&pair[0], &pair[1]) {
                if best.map_or(true, |(best_rank, _)| rank < best_rank) {
                    best = Some((rank, pos));
                }
            }
        }

        best.map(|(_, pos)| (symbols[pos].clone(), symbols[pos + 1].clone()))
    }
}

/// Merge every non-overlapping occurrence of `left right`, scanning left to right.
fn merge_pair(symbols: Vec<String>, left: &str, right: &str) -> Vec<String> {
    let mut merged = Vec::with_capacity(symbols.len());
    let mut iter = symbols.into_iter().peekable();

    while let Some(symbol) = iter.next() {
        if symbol == left && iter.peek().is_some_and(|next| next == right) {
            let next = iter.next().unwrap_or_default();
            merged.push(symbol + &next);
        } else {
            merged.push(symbol);
        }
    }

    merged
}

/// Strip everything outside `[A-Za-z0-9 ]` and lowercase.
pub fn clean_text(text: &str) -> String {
    QUERY_FILTER.replace_all(text, "").to_lowercase()
}

/// Fixed-length token ids plus attention mask, as the text encoder expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSequence {
    pub ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

impl TokenSequence {
    /// Wrap content ids in BOS/EOS, then pad or truncate to [`CONTEXT_LENGTH`].
    pub fn wrap(content: &[u32]) -> Self {
        let mut ids: Vec<i64> = Vec::with_capacity(CONTEXT_LENGTH);
        ids.push(BOS_TOKEN as i64);
        ids.extend(content.iter().map(|&id| id as i64));
        ids.push(EOS_TOKEN as i64);
        ids.truncate(CONTEXT_LENGTH);

        let mut attention_mask = vec![1; ids.len()];
        attention_mask.resize(CONTEXT_LENGTH, 0);
        ids.resize(CONTEXT_LENGTH, 0);

        Self {
            ids,
            attention_mask,
        }
    }

    /// Number of real tokens, sentinels included.
    pub fn len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
