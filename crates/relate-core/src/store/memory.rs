//! In-memory store implementing every storage trait.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Corpora keep
//! insertion order so [`CorpusStore::list_corpora`] is oldest first.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Corpus, CorpusSummary, Passage, PassageRelation};

use super::{CachedVectors, CorpusStore, EmbeddingCache, RelationStore};

/// In-memory store for tests and embedding.
pub struct InMemoryStore {
    corpora: RwLock<Vec<Corpus>>,
    relations: RwLock<Vec<PassageRelation>>,
    vectors: RwLock<HashMap<String, CachedVectors>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            corpora: RwLock::new(Vec::new()),
            relations: RwLock::new(Vec::new()),
            vectors: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a corpus.
    pub fn insert_corpus(&self, corpus: Corpus) {
        let mut corpora = self.corpora.write().unwrap_or_else(|e| e.into_inner());
        match corpora.iter_mut().find(|c| c.id == corpus.id) {
            Some(existing) => *existing = corpus,
            None => corpora.push(corpus),
        }
    }

    /// Remove a corpus along with its relations and cached vectors.
    pub fn remove_corpus(&self, corpus_id: &str) -> bool {
        let removed = {
            let mut corpora = self.corpora.write().unwrap_or_else(|e| e.into_inner());
            let before = corpora.len();
            corpora.retain(|c| c.id != corpus_id);
            corpora.len() != before
        };
        self.relations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| r.focus_corpus_id != corpus_id && r.related_corpus_id != corpus_id);
        self.vectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(corpus_id);
        removed
    }

    /// Total stored relations.
    pub fn relation_count(&self) -> usize {
        self.relations.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CorpusStore for InMemoryStore {
    async fn get_corpus(&self, id: &str) -> Result<Option<Corpus>> {
        let corpora = self.corpora.read().unwrap_or_else(|e| e.into_inner());
        Ok(corpora.iter().find(|c| c.id == id).cloned())
    }

    async fn list_corpora(&self) -> Result<Vec<CorpusSummary>> {
        let corpora = self.corpora.read().unwrap_or_else(|e| e.into_inner());
        Ok(corpora
            .iter()
            .map(|c| CorpusSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                passage_count: c.passages.len(),
                char_count: c.char_count(),
            })
            .collect())
    }

    async fn list_passages(&self, corpus_id: &str) -> Result<Vec<Passage>> {
        let corpora = self.corpora.read().unwrap_or_else(|e| e.into_inner());
        Ok(corpora
            .iter()
            .find(|c| c.id == corpus_id)
            .map(|c| c.passages.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RelationStore for InMemoryStore {
    async fn save_relations(
        &self,
        source_corpus_id: &str,
        target_corpus_id: &str,
        relations: &[PassageRelation],
    ) -> Result<usize> {
        let mut stored = self.relations.write().unwrap_or_else(|e| e.into_inner());
        stored.retain(|r| {
            !(r.focus_corpus_id == source_corpus_id && r.related_corpus_id == target_corpus_id)
        });
        for rel in relations {
            stored.retain(|r| {
                !(r.focus_passage_id == rel.focus_passage_id
                    && r.related_passage_id == rel.related_passage_id)
            });
            stored.push(rel.clone());
        }
        Ok(relations.len())
    }

    async fn relations_for(
        &self,
        corpus_id: &str,
        passage_id: Option<&str>,
    ) -> Result<Vec<PassageRelation>> {
        let stored = self.relations.read().unwrap_or_else(|e| e.into_inner());
        Ok(stored
            .iter()
            .filter(|r| r.focus_corpus_id == corpus_id)
            .filter(|r| passage_id.map_or(true, |p| r.focus_passage_id == p))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EmbeddingCache for InMemoryStore {
    async fn load_vectors(&self, corpus_id: &str, model: &str) -> Result<Option<CachedVectors>> {
        let vectors = self.vectors.read().unwrap_or_else(|e| e.into_inner());
        Ok(vectors
            .get(corpus_id)
            .filter(|cached| cached.model == model)
            .cloned())
    }

    async fn save_vectors(&self, corpus_id: &str, cached: &CachedVectors) -> Result<()> {
        self.vectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(corpus_id.to_string(), cached.clone());
        Ok(())
    }

    async fn clear_vectors(&self, corpus_id: &str) -> Result<()> {
        self.vectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(corpus_id);
        Ok(())
    }
}
