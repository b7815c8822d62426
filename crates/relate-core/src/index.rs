//! In-process vector index grouped by corpus.
//!
//! Holds one embedding per passage and answers brute-force cosine
//! nearest-neighbor queries within a single corpus. The index also owns
//! the per-corpus IndexState flag ("every passage has been embedded"),
//! which is only ever set by a complete indexing pass.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`; the index is
//! shared between concurrent retrieval tasks through an `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::cosine_similarity;
use crate::error::{RelationError, Result};
use crate::models::{Passage, SimilarityCandidate};

struct StoredVector {
    passage_id: String,
    vector: Vec<f32>,
}

#[derive(Default)]
struct CorpusVectors {
    /// Insertion order; ties in a query resolve in this order.
    entries: Vec<StoredVector>,
    positions: HashMap<String, usize>,
}

impl CorpusVectors {
    fn upsert(&mut self, passage_id: &str, vector: Vec<f32>) {
        match self.positions.get(passage_id) {
            Some(&pos) => self.entries[pos].vector = vector,
            None => {
                self.positions
                    .insert(passage_id.to_string(), self.entries.len());
                self.entries.push(StoredVector {
                    passage_id: passage_id.to_string(),
                    vector,
                });
            }
        }
    }
}

#[derive(Default)]
struct IndexInner {
    corpora: HashMap<String, CorpusVectors>,
    indexed: HashSet<String>,
}

/// Per-passage embedding vectors grouped by corpus.
#[derive(Default)]
pub struct VectorIndex {
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the vector for a passage. Last write wins.
    ///
    /// Does not change the corpus IndexState.
    pub fn upsert(&self, passage: &Passage, vector: Vec<f32>) {
        self.write()
            .corpora
            .entry(passage.corpus_id.clone())
            .or_default()
            .upsert(&passage.id, vector);
    }

    /// Replace every vector of a corpus and mark it indexed.
    ///
    /// `vectors` must cover every passage of the corpus; the caller only
    /// invokes this after a fully successful embedding pass.
    pub fn replace_corpus(&self, corpus_id: &str, vectors: Vec<(String, Vec<f32>)>) {
        let mut inner = self.write();
        let mut fresh = CorpusVectors::default();
        for (passage_id, vector) in vectors {
            fresh.upsert(&passage_id, vector);
        }
        let has_entries = !fresh.entries.is_empty();
        inner.corpora.insert(corpus_id.to_string(), fresh);
        if has_entries {
            inner.indexed.insert(corpus_id.to_string());
        } else {
            inner.indexed.remove(corpus_id);
        }
    }

    /// Whether the corpus completed a full indexing pass.
    pub fn has_vectors(&self, corpus_id: &str) -> bool {
        self.read().indexed.contains(corpus_id)
    }

    /// Number of vectors stored for a corpus.
    pub fn vector_count(&self, corpus_id: &str) -> usize {
        self.read()
            .corpora
            .get(corpus_id)
            .map_or(0, |c| c.entries.len())
    }

    /// The stored vector of one passage, if any.
    pub fn vector(&self, corpus_id: &str, passage_id: &str) -> Option<Vec<f32>> {
        let inner = self.read();
        let corpus = inner.corpora.get(corpus_id)?;
        let pos = *corpus.positions.get(passage_id)?;
        Some(corpus.entries[pos].vector.clone())
    }

    /// Nearest neighbors of `vector` within one corpus.
    ///
    /// Results are sorted by descending cosine similarity; ties keep
    /// passage insertion order. Passages whose similarity is undefined
    /// (zero-norm or mismatched vectors) are excluded. At most `top_k`
    /// candidates are returned.
    ///
    /// # Errors
    ///
    /// [`RelationError::NotIndexed`] when the corpus has no vectors, so
    /// "not indexed yet" is never confused with "no matches".
    pub fn query(
        &self,
        corpus_id: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SimilarityCandidate>> {
        let inner = self.read();
        let corpus = match inner.corpora.get(corpus_id) {
            Some(c) if !c.entries.is_empty() => c,
            _ => {
                return Err(RelationError::NotIndexed {
                    corpus_id: corpus_id.to_string(),
                })
            }
        };

        let mut candidates: Vec<SimilarityCandidate> = corpus
            .entries
            .iter()
            .filter_map(|sv| {
                cosine_similarity(vector, &sv.vector).map(|score| SimilarityCandidate {
                    passage_id: sv.passage_id.clone(),
                    corpus_id: corpus_id.to_string(),
                    score,
                })
            })
            .collect();

        // Stable sort: equal scores stay in insertion order.
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(top_k);
        Ok(candidates)
    }

    /// Drop a corpus's vectors and IndexState.
    pub fn remove_corpus(&self, corpus_id: &str) {
        let mut inner = self.write();
        inner.corpora.remove(corpus_id);
        inner.indexed.remove(corpus_id);
    }

    /// Drop every vector and IndexState flag.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.corpora.clear();
        inner.indexed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(corpus: &str, id: &str) -> Passage {
        Passage {
            id: id.to_string(),
            corpus_id: corpus.to_string(),
            index: 0,
            text: String::new(),
            start_offset: 0,
            end_offset: 0,
            hash: String::new(),
        }
    }

    #[test]
    fn test_query_unindexed_corpus() {
        let index = VectorIndex::new();
        let err = index.query("missing", &[1.0, 0.0], 3).unwrap_err();
        assert!(matches!(err, RelationError::NotIndexed { .. }));
    }

    #[test]
    fn test_query_orders_by_similarity() {
        let index = VectorIndex::new();
        index.upsert(&passage("b", "far"), vec![0.0, 1.0]);
        index.upsert(&passage("b", "near"), vec![1.0, 0.1]);
        index.upsert(&passage("b", "mid"), vec![1.0, 1.0]);

        let results = index.query("b", &[1.0, 0.0], 10).unwrap();
        let ids: Vec<&str> = results.iter().map(|c| c.passage_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let index = VectorIndex::new();
        for id in ["p3", "p1", "p2"] {
            index.upsert(&passage("b", id), vec![2.0, 2.0]);
        }
        let results = index.query("b", &[1.0, 1.0], 10).unwrap();
        let ids: Vec<&str> = results.iter().map(|c| c.passage_id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p1", "p2"]);
    }

    #[test]
    fn test_zero_norm_vectors_excluded() {
        let index = VectorIndex::new();
        index.upsert(&passage("b", "zero"), vec![0.0, 0.0]);
        index.upsert(&passage("b", "real"), vec![0.5, 0.5]);
        let results = index.query("b", &[1.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].passage_id, "real");

        let none = index.query("b", &[0.0, 0.0], 10).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_query_top_k_cap() {
        let index = VectorIndex::new();
        for i in 0..10 {
            index.upsert(&passage("b", &format!("p{i}")), vec![1.0, i as f32]);
        }
        assert_eq!(index.query("b", &[1.0, 1.0], 4).unwrap().len(), 4);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let index = VectorIndex::new();
        index.upsert(&passage("b", "p1"), vec![1.0, 0.0]);
        index.upsert(&passage("b", "p2"), vec![0.0, 1.0]);
        index.upsert(&passage("b", "p1"), vec![0.0, 1.0]);
        assert_eq!(index.vector_count("b"), 2);
        assert_eq!(index.vector("b", "p1"), Some(vec![0.0, 1.0]));
    }

    #[test]
    fn test_upsert_never_marks_indexed() {
        let index = VectorIndex::new();
        assert!(!index.has_vectors("b"));

        index.upsert(&passage("b", "p1"), vec![1.0]);
        assert!(!index.has_vectors("b"));
        assert_eq!(index.vector_count("b"), 1);

        index.replace_corpus("b", Vec::new());
        assert!(!index.has_vectors("b"));
    }

    #[test]
    fn test_replace_corpus_drops_stale_vectors() {
        let index = VectorIndex::new();
        index.upsert(&passage("b", "old"), vec![1.0, 0.0]);
        index.replace_corpus(
            "b",
            vec![("new".to_string(), vec![0.0, 1.0])],
        );
        assert!(index.has_vectors("b"));
        assert_eq!(index.vector("b", "old"), None);
        assert_eq!(index.vector_count("b"), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let index = VectorIndex::new();
        index.replace_corpus("a", vec![("p".to_string(), vec![1.0])]);
        index.replace_corpus("b", vec![("q".to_string(), vec![1.0])]);
        index.remove_corpus("a");
        assert!(!index.has_vectors("a"));
        assert!(index.has_vectors("b"));
        index.clear();
        assert!(!index.has_vectors("b"));
        assert!(index.query("b", &[1.0], 1).is_err());
    }
}
