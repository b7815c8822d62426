//! Threshold and top-K candidate selection over the [`VectorIndex`].
//!
//! The threshold is applied before the cap, so fewer than `top_k`
//! candidates is a normal outcome. The threshold is always an explicit
//! argument; there is no process-wide "current threshold".

use crate::error::Result;
use crate::index::VectorIndex;
use crate::models::{Passage, SimilarityCandidate};

/// Per-call selection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonParams {
    /// Minimum cosine similarity (inclusive).
    pub threshold: f32,
    /// Maximum candidates per focus passage.
    pub top_k: usize,
}

impl ComparisonParams {
    pub fn new(threshold: f32, top_k: usize) -> Self {
        Self { threshold, top_k }
    }
}

/// Selects related-passage candidates for a focus passage.
pub struct CandidateSelector<'a> {
    index: &'a VectorIndex,
}

impl<'a> CandidateSelector<'a> {
    pub fn new(index: &'a VectorIndex) -> Self {
        Self { index }
    }

    /// Candidates in `target_corpus_id` with similarity `>= threshold`,
    /// capped to `top_k`, best first.
    ///
    /// `focus_vector` is the focus passage's embedding. The focus passage
    /// itself is never returned when it lives in the target corpus.
    ///
    /// # Errors
    ///
    /// [`RelationError::NotIndexed`](crate::RelationError::NotIndexed)
    /// when the target corpus has no vectors; the orchestrator indexes it
    /// on demand before calling.
    pub fn select(
        &self,
        focus: &Passage,
        focus_vector: &[f32],
        target_corpus_id: &str,
        params: &ComparisonParams,
    ) -> Result<Vec<SimilarityCandidate>> {
        if params.top_k == 0 {
            return Ok(Vec::new());
        }
        let limit = self.index.vector_count(target_corpus_id).max(1);
        let mut candidates: Vec<SimilarityCandidate> = self
            .index
            .query(target_corpus_id, focus_vector, limit)?
            .into_iter()
            .filter(|c| !(c.corpus_id == focus.corpus_id && c.passage_id == focus.id))
            .filter(|c| c.score >= params.threshold)
            .collect();
        candidates.truncate(params.top_k);
        Ok(candidates)
    }
}
