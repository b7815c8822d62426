//! Storage abstraction for relate.
//!
//! Three narrow traits cover what the comparison pipeline reads and
//! writes:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`CorpusStore`] | Read corpora and their ordered passages |
//! | [`RelationStore`] | Persist and look up computed relations |
//! | [`EmbeddingCache`] | Durable per-corpus embedding vectors |
//!
//! Implementations must be `Send + Sync` to work with async runtimes. The
//! app crate provides a SQLite backend; [`memory::InMemoryStore`]
//! implements all three for tests.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Corpus, CorpusSummary, Passage, PassageRelation};

/// Read-only access to corpora.
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// A corpus with its passages in order, or `None` if unknown.
    async fn get_corpus(&self, id: &str) -> Result<Option<Corpus>>;

    /// Every stored corpus, oldest first.
    async fn list_corpora(&self) -> Result<Vec<CorpusSummary>>;

    /// The passages of a corpus in order; empty when the corpus is unknown.
    async fn list_passages(&self, corpus_id: &str) -> Result<Vec<Passage>>;
}

/// Persistence for computed relations.
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Store the result of comparing `source_corpus_id` against
    /// `target_corpus_id`. Every previously stored relation of that corpus
    /// pair is replaced; other pairs are untouched. An empty slice clears
    /// the pair.
    async fn save_relations(
        &self,
        source_corpus_id: &str,
        target_corpus_id: &str,
        relations: &[PassageRelation],
    ) -> Result<usize>;

    /// Relations whose focus passage belongs to `corpus_id`, optionally
    /// narrowed to one focus passage.
    async fn relations_for(
        &self,
        corpus_id: &str,
        passage_id: Option<&str>,
    ) -> Result<Vec<PassageRelation>>;
}

/// Cached embedding vectors for one corpus and model.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedVectors {
    pub model: String,
    /// `(passage_id, vector)` pairs.
    pub vectors: Vec<(String, Vec<f32>)>,
}

/// Durable embedding cache.
///
/// A corpus is written only after every passage has been embedded, so a
/// cache hit always describes a complete index.
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    /// Cached vectors for `corpus_id` produced by `model`, if complete.
    async fn load_vectors(&self, corpus_id: &str, model: &str) -> Result<Option<CachedVectors>>;

    /// Replace the cached vectors of a corpus.
    async fn save_vectors(&self, corpus_id: &str, cached: &CachedVectors) -> Result<()>;

    /// Drop every cached vector of a corpus.
    async fn clear_vectors(&self, corpus_id: &str) -> Result<()>;
}
