//! Query entry point: turns a text or photo query into a ranked id list.
//!
//! Text queries go through the tokenizer and the text encoder. Photo queries
//! reuse the stored embedding of an already indexed photo. Both are ranked
//! against the same repository snapshot.

use std::sync::Arc;

use crate::semantic::extractor::{EmbeddingExtractor, ExtractionError};
use crate::semantic::ranker::{self, RankError, ScoredId};
use crate::semantic::storage::{EmbeddingRepository, RepositoryError};
use crate::semantic::tokenizer::{BpeTokenizer, TokenizerError};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Rank error: {0}")]
    Rank(#[from] RankError),

    #[error("Photo {0} has not been indexed")]
    NotIndexed(u64),

    #[error("Text search is unavailable without a text encoder")]
    TextSearchUnavailable,
}

/// What to search for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Free text, e.g. "dog on a beach"
    Text(String),
    /// Photos similar to an indexed photo
    Photo(u64),
}

struct TextEncoder {
    tokenizer: BpeTokenizer,
    extractor: EmbeddingExtractor,
}

pub struct SearchService {
    repository: Arc<dyn EmbeddingRepository>,
    text: Option<TextEncoder>,
}

impl SearchService {
    /// A service that can only answer [`Query::Photo`].
    pub fn new(repository: Arc<dyn EmbeddingRepository>) -> Self {
        Self {
            repository,
            text: None,
        }
    }

    pub fn with_text_encoder(mut self, tokenizer: BpeTokenizer, extractor: EmbeddingExtractor) -> Self {
        self.text = Some(TextEncoder {
            tokenizer,
            extractor,
        });
        self
    }

    pub fn repository(&self) -> &Arc<dyn EmbeddingRepository> {
        &self.repository
    }

    /// Unit-length vector for `query`.
    pub fn query_vector(&self, query: &Query) -> Result<Vec<f32>, SearchError> {
        match query {
            Query::Text(text) => {
                let encoder = self.text.as_ref().ok_or(SearchError::TextSearchUnavailable)?;
                let tokens = encoder.tokenizer.encode_sequence(text)?;
                Ok(encoder.extractor.extract_text(tokens)?)
            }
            Query::Photo(id) => self
                .repository
                .get_by_id(*id)?
                .map(|record| record.vector)
                .ok_or(SearchError::NotIndexed(*id)),
        }
    }

    /// Rank the indexed photos against `query`, best match first.
    ///
    /// `limit = None` ranks the whole collection.
    pub fn search(&self, query: &Query, limit: Option<usize>) -> Result<Vec<ScoredId>, SearchError> {
        let vector = self.query_vector(query)?;
        let snapshot = self.repository.load_all()?;
        let corpus = snapshot.iter().map(|r| (r.id, r.vector.as_slice()));

        let results = match limit {
            Some(k) => ranker::top_k(&vector, corpus, k)?,
            None => ranker::rank_scored(&vector, corpus)?,
        };

        log::debug!(
            "{query:?}: ranked {} photos, returning {}",
            snapshot.len(),
            results.len()
        );
        Ok(results)
    }
}
