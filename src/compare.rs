//! Comparison orchestrator.
//!
//! [`Comparator`] is the entry point for relation discovery. It owns the
//! in-process [`VectorIndex`], indexes corpora on demand through the
//! embedding oracle (or the durable embedding cache), and drives candidate
//! selection and relation classification across corpus pairs.
//!
//! # Scheduling
//!
//! Embedding calls while indexing and candidate retrieval per source
//! passage fan out concurrently (`buffered` / `buffer_unordered`).
//! Classification calls are issued one at a time, one per focus passage
//! or chapter batch. Every oracle call is bounded by a deadline; a unit of
//! work that fails or times out contributes no relations and the job moves
//! on. Indexing is the exception: it must be complete to be correct, so
//! any embedding failure fails the whole `index_corpus` call and leaves the
//! corpus unindexed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{stream, StreamExt, TryStreamExt};
use relate_core::classify::{classify, ScoredPassage, TextGenerator};
use relate_core::decompose::{classify_full_context, BatchProgress, FullContextBudget};
use relate_core::embedding::EmbeddingOracle;
use relate_core::index::VectorIndex;
use relate_core::models::{
    relation_count, ComparisonJob, Corpus, Passage, PassageRelation, RelationMap,
    SimilarityCandidate,
};
use relate_core::select::{CandidateSelector, ComparisonParams};
use relate_core::store::{CachedVectors, CorpusStore, EmbeddingCache, RelationStore};
use relate_core::{RelationError, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::oracle::{TimeoutEmbedder, TimeoutGenerator};
use crate::progress::{classification_percent, emit, ProgressEvent, ProgressSink, Stage};

/// Tuning knobs for a [`Comparator`].
#[derive(Debug, Clone)]
pub struct ComparatorOptions {
    /// Concurrent embedding calls while indexing.
    pub embed_concurrency: usize,
    /// Concurrent candidate retrievals in `compare_all`.
    pub retrieval_concurrency: usize,
    pub embed_timeout: Duration,
    pub classify_timeout: Duration,
    pub budget: FullContextBudget,
}

impl Default for ComparatorOptions {
    fn default() -> Self {
        Self {
            embed_concurrency: 8,
            retrieval_concurrency: 8,
            embed_timeout: Duration::from_secs(30),
            classify_timeout: Duration::from_secs(180),
            budget: FullContextBudget::default(),
        }
    }
}

impl ComparatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            embed_concurrency: config.embedding.concurrency,
            retrieval_concurrency: config.comparison.retrieval_concurrency,
            embed_timeout: config.embedding.timeout(),
            classify_timeout: config.llm.timeout(),
            budget: config.comparison.budget(),
        }
    }
}

type StageCallback<'a> = &'a mut (dyn FnMut(Stage, u8, String) + Send);

pub struct Comparator {
    corpora: Arc<dyn CorpusStore>,
    relations: Option<Arc<dyn RelationStore>>,
    cache: Option<Arc<dyn EmbeddingCache>>,
    embedder: TimeoutEmbedder,
    generator: TimeoutGenerator,
    index: VectorIndex,
    index_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    options: ComparatorOptions,
}

impl Comparator {
    pub fn new(
        corpora: Arc<dyn CorpusStore>,
        embedder: Box<dyn EmbeddingOracle>,
        generator: Box<dyn TextGenerator>,
        options: ComparatorOptions,
    ) -> Self {
        Self {
            corpora,
            relations: None,
            cache: None,
            embedder: TimeoutEmbedder::new(embedder, options.embed_timeout),
            generator: TimeoutGenerator::new(generator, options.classify_timeout),
            index: VectorIndex::new(),
            index_locks: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Persist comparison results through `store`.
    pub fn with_relation_store(mut self, store: Arc<dyn RelationStore>) -> Self {
        self.relations = Some(store);
        self
    }

    /// Hydrate and persist indexes through `cache`.
    pub fn with_embedding_cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn has_vectors(&self, corpus_id: &str) -> bool {
        self.index.has_vectors(corpus_id)
    }

    async fn load_corpus(&self, corpus_id: &str) -> Result<Corpus> {
        self.corpora
            .get_corpus(corpus_id)
            .await?
            .ok_or_else(|| RelationError::CorpusNotFound {
                corpus_id: corpus_id.to_string(),
            })
    }

    fn corpus_lock(&self, corpus_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.index_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(corpus_id.to_string()).or_default())
    }

    /// Embed every passage of a corpus and replace its vectors.
    ///
    /// IndexState is set only when every passage produced an embedding.
    /// Returns the number of vectors stored.
    ///
    /// # Errors
    ///
    /// [`RelationError::EmptyCorpus`] for a corpus without passages,
    /// [`RelationError::CorpusNotFound`] for an unknown id, and the first
    /// oracle failure otherwise.
    pub async fn index_corpus(&self, corpus_id: &str) -> Result<usize> {
        let lock = self.corpus_lock(corpus_id);
        let _guard = lock.lock().await;
        let corpus = self.load_corpus(corpus_id).await?;
        self.embed_corpus(&corpus).await
    }

    /// Index a corpus unless it already is, preferring the embedding cache.
    pub async fn ensure_indexed(&self, corpus_id: &str) -> Result<()> {
        if self.index.has_vectors(corpus_id) {
            return Ok(());
        }
        let lock = self.corpus_lock(corpus_id);
        let _guard = lock.lock().await;
        if self.index.has_vectors(corpus_id) {
            return Ok(());
        }

        let corpus = self.load_corpus(corpus_id).await?;
        if corpus.is_empty() {
            return Err(RelationError::EmptyCorpus {
                corpus_id: corpus_id.to_string(),
            });
        }
        if self.hydrate_from_cache(&corpus).await {
            return Ok(());
        }
        self.embed_corpus(&corpus).await.map(|_| ())
    }

    async fn hydrate_from_cache(&self, corpus: &Corpus) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let cached = match cache
            .load_vectors(&corpus.id, self.embedder.model_name())
            .await
        {
            Ok(Some(cached)) => cached,
            Ok(None) => return false,
            Err(e) => {
                warn!(corpus = %corpus.id, error = %e, "embedding cache unreadable");
                return false;
            }
        };

        let mut by_id: HashMap<String, Vec<f32>> = cached.vectors.into_iter().collect();
        let ordered: Option<Vec<(String, Vec<f32>)>> = corpus
            .passages
            .iter()
            .map(|p| by_id.remove(&p.id).map(|v| (p.id.clone(), v)))
            .collect();
        match ordered {
            Some(vectors) => {
                debug!(corpus = %corpus.id, vectors = vectors.len(), "index hydrated from cache");
                self.index.replace_corpus(&corpus.id, vectors);
                true
            }
            None => {
                debug!(corpus = %corpus.id, "embedding cache incomplete, re-indexing");
                false
            }
        }
    }

    async fn embed_corpus(&self, corpus: &Corpus) -> Result<usize> {
        if corpus.is_empty() {
            return Err(RelationError::EmptyCorpus {
                corpus_id: corpus.id.clone(),
            });
        }
        info!(
            corpus = %corpus.id,
            passages = corpus.passages.len(),
            model = self.embedder.model_name(),
            "indexing corpus"
        );

        let vectors: Vec<(String, Vec<f32>)> = stream::iter(corpus.passages.iter())
            .map(|p| async move {
                self.embedder
                    .embed(&p.text)
                    .await
                    .map(|v| (p.id.clone(), v))
            })
            .buffered(self.options.embed_concurrency.max(1))
            .try_collect()
            .await
            .inspect_err(|e| warn!(corpus = %corpus.id, error = %e, "indexing failed"))?;

        let count = vectors.len();
        if let Some(cache) = &self.cache {
            let cached = CachedVectors {
                model: self.embedder.model_name().to_string(),
                vectors: vectors.clone(),
            };
            if let Err(e) = cache.save_vectors(&corpus.id, &cached).await {
                warn!(corpus = %corpus.id, error = %e, "failed to cache vectors");
            }
        }
        self.index.replace_corpus(&corpus.id, vectors);
        Ok(count)
    }

    /// Drop a corpus from the index, its IndexState, and the cache.
    pub async fn remove_corpus_vectors(&self, corpus_id: &str) -> Result<()> {
        let lock = self.corpus_lock(corpus_id);
        let _guard = lock.lock().await;
        self.index.remove_corpus(corpus_id);
        if let Some(cache) = &self.cache {
            cache.clear_vectors(corpus_id).await?;
        }
        Ok(())
    }

    async fn focus_vector(&self, focus: &Passage) -> Result<Vec<f32>> {
        match self.index.vector(&focus.corpus_id, &focus.id) {
            Some(v) => Ok(v),
            None => self.embedder.embed(&focus.text).await,
        }
    }

    async fn retrieve(
        &self,
        focus: &Passage,
        target_corpus_id: &str,
        params: ComparisonParams,
    ) -> Result<Vec<SimilarityCandidate>> {
        let vector = self.focus_vector(focus).await?;
        CandidateSelector::new(&self.index).select(focus, &vector, target_corpus_id, &params)
    }

    /// Classify one focus passage against its nearest neighbors in
    /// `target_corpus_id`.
    pub async fn compare_one(
        &self,
        focus: &Passage,
        target_corpus_id: &str,
        params: ComparisonParams,
    ) -> Result<Vec<PassageRelation>> {
        self.ensure_indexed(target_corpus_id).await?;
        let target = self.load_corpus(target_corpus_id).await?;
        let candidates = self.retrieve(focus, target_corpus_id, params).await?;
        let scored = scored_passages(&target, &candidates);
        classify(&self.generator, focus, &scored).await
    }

    /// Compare every passage of `source_corpus_id` against
    /// `target_corpus_id` and return relations keyed by source passage id.
    ///
    /// Focus passages with no qualifying candidates are absent from the
    /// map. Progress milestones are sent on `progress` when attached.
    pub async fn compare_all(
        &self,
        source_corpus_id: &str,
        target_corpus_id: &str,
        params: ComparisonParams,
        progress: Option<&ProgressSink>,
    ) -> Result<RelationMap> {
        let mut on_stage = |stage: Stage, percent: u8, message: String| {
            emit(
                progress,
                ProgressEvent::Stage {
                    source: source_corpus_id.to_string(),
                    target: target_corpus_id.to_string(),
                    stage,
                    percent,
                    message,
                },
            );
        };
        self.run_compare_all(source_corpus_id, target_corpus_id, params, &mut on_stage)
            .await
    }

    async fn run_compare_all(
        &self,
        source_corpus_id: &str,
        target_corpus_id: &str,
        params: ComparisonParams,
        on_stage: StageCallback<'_>,
    ) -> Result<RelationMap> {
        on_stage(
            Stage::IndexingSource,
            Stage::IndexingSource.percent(),
            format!("Indexing {source_corpus_id}"),
        );
        self.ensure_indexed(source_corpus_id).await?;
        on_stage(
            Stage::IndexingTarget,
            Stage::IndexingTarget.percent(),
            format!("Indexing {target_corpus_id}"),
        );
        self.ensure_indexed(target_corpus_id).await?;

        let source = self.load_corpus(source_corpus_id).await?;
        let target = self.load_corpus(target_corpus_id).await?;

        on_stage(
            Stage::Retrieval,
            Stage::Retrieval.percent(),
            format!("Retrieving candidates for {} passages", source.passages.len()),
        );
        let target_id = target.id.as_str();
        let retrieved: Vec<(String, Vec<SimilarityCandidate>)> = stream::iter(source.passages.iter())
            .map(|passage| async move {
                match self.retrieve(passage, target_id, params).await {
                    Ok(candidates) => (passage.id.clone(), candidates),
                    Err(e) => {
                        warn!(passage = %passage.id, error = %e, "candidate retrieval failed");
                        (passage.id.clone(), Vec::new())
                    }
                }
            })
            .buffer_unordered(self.options.retrieval_concurrency.max(1))
            .collect()
            .await;

        let mut by_id: HashMap<String, Vec<SimilarityCandidate>> = retrieved.into_iter().collect();
        let work: Vec<(&Passage, Vec<SimilarityCandidate>)> = source
            .passages
            .iter()
            .filter_map(|p| by_id.remove(&p.id).map(|c| (p, c)))
            .filter(|(_, c)| !c.is_empty())
            .collect();
        debug!(
            source = %source.id,
            target = %target.id,
            with_candidates = work.len(),
            "retrieval finished"
        );

        on_stage(
            Stage::Classification,
            Stage::Classification.percent(),
            format!("Classifying {} passages", work.len()),
        );
        let mut map = RelationMap::new();
        let total = work.len();
        for (done, (focus, candidates)) in work.iter().enumerate() {
            let scored = scored_passages(&target, candidates);
            match classify(&self.generator, focus, &scored).await {
                Ok(found) if !found.is_empty() => {
                    map.insert(focus.id.clone(), found);
                }
                Ok(_) => {}
                Err(e) if e.is_unit_failure() => {
                    warn!(passage = %focus.id, error = %e, "classification failed")
                }
                Err(e) => return Err(e),
            }
            on_stage(
                Stage::Classification,
                classification_percent(done + 1, total),
                format!("Classified {} of {} passages", done + 1, total),
            );
        }

        self.persist(&source.id, &target.id, &map).await?;
        let count = relation_count(&map);
        info!(source = %source.id, target = %target.id, relations = count, "comparison complete");
        on_stage(
            Stage::Complete,
            Stage::Complete.percent(),
            format!("Found {count} relations"),
        );
        Ok(map)
    }

    /// Classify a corpus pair without nearest-neighbor narrowing.
    ///
    /// Relations carry the no-embedding similarity sentinel.
    pub async fn compare_full_context(
        &self,
        source_corpus_id: &str,
        target_corpus_id: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<RelationMap> {
        let source = self.load_corpus(source_corpus_id).await?;
        let target = self.load_corpus(target_corpus_id).await?;
        let stage_event = |stage: Stage, percent: u8, message: String| ProgressEvent::Stage {
            source: source.id.clone(),
            target: target.id.clone(),
            stage,
            percent,
            message,
        };

        emit(
            progress,
            stage_event(
                Stage::Classification,
                Stage::Classification.percent(),
                "Classifying full context".to_string(),
            ),
        );
        let mut on_batch = |p: BatchProgress| {
            emit(
                progress,
                stage_event(
                    Stage::Classification,
                    classification_percent(p.completed, p.total),
                    format!("Classified batch {} of {} ({} failed)", p.completed, p.total, p.failed),
                ),
            );
        };
        let outcome = classify_full_context(
            &self.generator,
            &source,
            &target,
            &self.options.budget,
            &mut on_batch,
        )
        .await?;
        if outcome.failed_batches > 0 {
            warn!(
                source = %source.id,
                target = %target.id,
                failed = outcome.failed_batches,
                batches = outcome.batches,
                "some chapter batches failed"
            );
        }

        self.persist(&source.id, &target.id, &outcome.relations).await?;
        let count = relation_count(&outcome.relations);
        emit(
            progress,
            stage_event(
                Stage::Complete,
                Stage::Complete.percent(),
                format!("Found {count} relations"),
            ),
        );
        Ok(outcome.relations)
    }

    /// Compare a newly added corpus against every other corpus, in both
    /// directions, with the automatic-sweep parameters.
    ///
    /// Each direction is a [`ComparisonJob`]; its state changes are sent
    /// as [`ProgressEvent::Job`]. A failing job does not stop the sweep.
    /// Returns the jobs in their terminal states.
    pub async fn auto_compare_new_corpus(
        &self,
        new_corpus_id: &str,
        params: ComparisonParams,
        progress: Option<&ProgressSink>,
    ) -> Vec<ComparisonJob> {
        let existing = match self.corpora.list_corpora().await {
            Ok(list) => list,
            Err(e) => {
                let mut job = ComparisonJob::new(new_corpus_id, "*");
                job.fail(format!("failed to list corpora: {e}"));
                emit(progress, ProgressEvent::Job(job.clone()));
                return vec![job];
            }
        };

        let mut jobs = Vec::new();
        for other in existing.iter().filter(|c| c.id != new_corpus_id) {
            for (source, target) in [(new_corpus_id, other.id.as_str()), (other.id.as_str(), new_corpus_id)] {
                let mut job = ComparisonJob::new(source, target);
                job.start(format!("Comparing {source} with {target}"));
                emit(progress, ProgressEvent::Job(job.clone()));

                let result = {
                    let mut on_stage = |_stage: Stage, percent: u8, message: String| {
                        job.advance(percent, message);
                        emit(progress, ProgressEvent::Job(job.clone()));
                    };
                    self.run_compare_all(source, target, params, &mut on_stage)
                        .await
                };
                match result {
                    Ok(map) => job.complete(relation_count(&map)),
                    Err(e) => {
                        warn!(source, target, error = %e, "sweep comparison failed");
                        job.fail(&e);
                    }
                }
                emit(progress, ProgressEvent::Job(job.clone()));
                jobs.push(job);
            }
        }
        jobs
    }

    /// Replace the stored relations of a corpus pair with `map`.
    async fn persist(
        &self,
        source_corpus_id: &str,
        target_corpus_id: &str,
        map: &RelationMap,
    ) -> Result<()> {
        let Some(store) = &self.relations else {
            return Ok(());
        };
        let all: Vec<PassageRelation> = map.values().flatten().cloned().collect();
        store
            .save_relations(source_corpus_id, target_corpus_id, &all)
            .await?;
        Ok(())
    }
}

/// Pair each candidate with its passage in `target`, preserving rank.
fn scored_passages<'a>(
    target: &'a Corpus,
    candidates: &[SimilarityCandidate],
) -> Vec<ScoredPassage<'a>> {
    let by_id: HashMap<&str, &Passage> = target
        .passages
        .iter()
        .map(|p| (p.id.as_str(), p))
        .collect();
    candidates
        .iter()
        .filter_map(|c| {
            by_id.get(c.passage_id.as_str()).map(|p| ScoredPassage {
                passage: p,
                similarity: Some(c.score),
            })
        })
        .collect()
}
