//! Similarity ranking of embeddings against a query vector.
//!
//! Stored and query vectors are unit length, so cosine similarity is a plain
//! dot product. Ranking is a stable sort by descending score: candidates
//! with equal scores keep the order they were passed in.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::Serialize;

/// Below this many candidates scoring stays on the calling thread
const PARALLEL_MIN_LEN: usize = 1024;

/// A ranked candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredId {
    pub id: u64,
    /// Cosine similarity in [-1.0, 1.0]
    pub score: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum RankError {
    #[error("candidate {id} has {got} dimensions, query has {expected}")]
    DimensionMismatch { id: u64, expected: usize, got: usize },
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Score every candidate, preserving input order.
fn score_all<'a>(
    query: &[f32],
    corpus: impl IntoIterator<Item = (u64, &'a [f32])>,
) -> Result<Vec<ScoredId>, RankError> {
    let candidates: Vec<(u64, &[f32])> = corpus.into_iter().collect();

    candidates
        .par_iter()
        .with_min_len(PARALLEL_MIN_LEN)
        .map(|&(id, vector)| {
            if vector.len() != query.len() {
                return Err(RankError::DimensionMismatch {
                    id,
                    expected: query.len(),
                    got: vector.len(),
                });
            }
            Ok(ScoredId {
                id,
                score: dot(query, vector),
            })
        })
        .collect()
}

fn by_score_desc(a: &ScoredId, b: &ScoredId) -> Ordering {
    b.score.total_cmp(&a.score)
}

/// Rank the whole corpus, most similar first, with scores.
pub fn rank_scored<'a>(
    query: &[f32],
    corpus: impl IntoIterator<Item = (u64, &'a [f32])>,
) -> Result<Vec<ScoredId>, RankError> {
    let mut scored = score_all(query, corpus)?;
    // sort_by is stable
    scored.sort_by(by_score_desc);
    Ok(scored)
}

/// Rank the whole corpus, most similar first.
pub fn rank<'a>(
    query: &[f32],
    corpus: impl IntoIterator<Item = (u64, &'a [f32])>,
) -> Result<Vec<u64>, RankError> {
    Ok(rank_scored(query, corpus)?
        .into_iter()
        .map(|s| s.id)
        .collect())
}

/// First `k` entries of [`rank_scored`], without sorting the whole corpus.
pub fn top_k<'a>(
    query: &[f32],
    corpus: impl IntoIterator<Item = (u64, &'a [f32])>,
    k: usize,
) -> Result<Vec<ScoredId>, RankError> {
    let scored = score_all(query, corpus)?;
    if k == 0 {
        return Ok(Vec::new());
    }
    if k >= scored.len() {
        let mut scored = scored;
        scored.sort_by(by_score_desc);
        return Ok(scored);
    }

    // the position tie-break makes the unstable selection agree with the stable sort
    let mut indexed: Vec<(usize, ScoredId)> = scored.into_iter().enumerate().collect();
    let cmp = |a: &(usize, ScoredId), b: &(usize, ScoredId)| {
        by_score_desc(&a.1, &b.1).then(a.0.cmp(&b.0))
    };
    indexed.select_nth_unstable_by(k - 1, cmp);
    indexed.truncate(k);
    indexed.sort_by(cmp);

    Ok(indexed.into_iter().map(|(_, s)| s).collect())
}
