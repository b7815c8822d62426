//! End-to-end orchestrator tests with in-process fake oracles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relate::compare::{Comparator, ComparatorOptions};
use relate::progress::{ProgressEvent, Stage};
use relate_core::classify::TextGenerator;
use relate_core::embedding::EmbeddingOracle;
use relate_core::models::{Corpus, JobStatus, Passage, RelationType, SimilarityBasis};
use relate_core::select::ComparisonParams;
use relate_core::store::memory::InMemoryStore;
use relate_core::store::{EmbeddingCache, RelationStore};
use relate_core::{RelationError, Result};
use serde_json::json;
use tokio::sync::mpsc;

const DIMS: usize = 64;

/// Bag-of-words embedder: each lowercase word hashes into one of `DIMS`
/// buckets. Texts containing `UNEMBEDDABLE` fail.
#[derive(Clone, Default)]
struct WordEmbedder {
    calls: Arc<AtomicUsize>,
}

fn bucket(word: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in word.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % DIMS as u64) as usize
}

#[async_trait]
impl EmbeddingOracle for WordEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("UNEMBEDDABLE") {
            return Err(RelationError::oracle("500 internal server error"));
        }
        let mut vector = vec![0.0f32; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            vector[bucket(&word.to_lowercase())] += 1.0;
        }
        Ok(vector)
    }
}

#[derive(Clone, Copy)]
enum Reply {
    /// Label every prompted candidate `supports`.
    Echo,
    NotJson,
    /// Never answers within any reasonable deadline.
    Hang,
}

/// Scripted text generator. Prompts mentioning `POISON` fail with an
/// oracle error; prompts mentioning `CORRUPT` fail with a store error.
#[derive(Clone)]
struct FakeGenerator {
    reply: Reply,
    calls: Arc<AtomicUsize>,
}

impl FakeGenerator {
    fn new(reply: Reply) -> Self {
        Self {
            reply,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn ids_in(section: &str) -> Vec<String> {
    section
        .split("[passage_id: ")
        .skip(1)
        .filter_map(|rest| rest.split(']').next())
        .map(str::to_string)
        .collect()
}

fn echo(user: &str) -> String {
    if let Some((_, candidates)) = user.split_once("CANDIDATE PASSAGES") {
        let items: Vec<_> = ids_in(candidates)
            .into_iter()
            .map(|id| json!({"passage_id": id, "relation": "supports", "evidence": "shared topic"}))
            .collect();
        return format!("```json\n{}\n```", serde_json::Value::Array(items));
    }
    let (sources, targets) = user.split_once("TARGET PASSAGES").unwrap_or((user, ""));
    let items: Vec<_> = ids_in(sources)
        .into_iter()
        .zip(ids_in(targets))
        .map(|(s, t)| json!({"source_id": s, "passage_id": t, "relation": "analogous", "evidence": "paired"}))
        .collect();
    serde_json::Value::Array(items).to_string()
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    fn model_name(&self) -> &str {
        "fake-llm"
    }

    async fn generate(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if user.contains("POISON") {
            return Err(RelationError::oracle("502 bad gateway"));
        }
        if user.contains("CORRUPT") {
            return Err(RelationError::Store(anyhow::anyhow!("database disk image is malformed")));
        }
        match self.reply {
            Reply::Echo => Ok(echo(user)),
            Reply::NotJson => Ok("not json at all".to_string()),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("[]".to_string())
            }
        }
    }
}

fn corpus(id: &str, texts: &[&str]) -> Corpus {
    let mut offset = 0;
    let passages = texts
        .iter()
        .enumerate()
        .map(|(index, text)| {
            let start = offset;
            offset += text.len() + 2;
            Passage {
                id: format!("{id}-{index}"),
                corpus_id: id.to_string(),
                index,
                text: text.to_string(),
                start_offset: start,
                end_offset: start + text.len(),
                hash: format!("h{index}"),
            }
        })
        .collect();
    Corpus {
        id: id.to_string(),
        title: id.to_uppercase(),
        passages,
    }
}

fn comparator(
    store: &Arc<InMemoryStore>,
    embedder: WordEmbedder,
    generator: FakeGenerator,
) -> Comparator {
    let options = ComparatorOptions {
        embed_timeout: Duration::from_secs(5),
        classify_timeout: Duration::from_secs(5),
        ..ComparatorOptions::default()
    };
    Comparator::new(store.clone(), Box::new(embedder), Box::new(generator), options)
        .with_relation_store(store.clone())
        .with_embedding_cache(store.clone())
}

fn sky_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.insert_corpus(corpus(
        "a",
        &["The sky is blue because of Rayleigh scattering."],
    ));
    store.insert_corpus(corpus("b", &["Rayleigh scattering explains the sky's color."]));
    store
}

#[tokio::test]
async fn test_compare_one_rayleigh_scenario() {
    let store = sky_store();
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));
    let focus = corpus("a", &["The sky is blue because of Rayleigh scattering."]).passages[0].clone();

    let relations = cmp
        .compare_one(&focus, "b", ComparisonParams::new(0.3, 1))
        .await
        .unwrap();

    assert_eq!(relations.len(), 1);
    let rel = &relations[0];
    assert_eq!(rel.related_passage_id, "b-0");
    assert_eq!(rel.related_corpus_id, "b");
    assert_eq!(rel.relation, RelationType::Supports);
    assert_eq!(rel.basis, SimilarityBasis::Embedding);
    assert!(rel.similarity > 0.3, "similarity {}", rel.similarity);
    assert!(cmp.has_vectors("b"));
}

#[tokio::test]
async fn test_compare_all_not_json_yields_no_relations() {
    let store = sky_store();
    let generator = FakeGenerator::new(Reply::NotJson);
    let cmp = comparator(&store, WordEmbedder::default(), generator.clone());

    let map = cmp
        .compare_all("a", "b", ComparisonParams::new(0.3, 1), None)
        .await
        .unwrap();

    assert!(map.is_empty());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.relation_count(), 0);
}

#[tokio::test]
async fn test_compare_all_persists_and_reports_milestones() {
    let store = sky_store();
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let map = cmp
        .compare_all("a", "b", ComparisonParams::new(0.3, 1), Some(&tx))
        .await
        .unwrap();

    assert_eq!(map.get("a-0").map(Vec::len), Some(1));
    assert_eq!(store.relations_for("a", None).await.unwrap().len(), 1);

    drop(tx);
    let mut stages = Vec::new();
    let mut percents = Vec::new();
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::Stage { stage, percent, .. } = event {
            if stages.last() != Some(&stage) {
                stages.push(stage);
            }
            percents.push(percent);
        }
    }
    assert_eq!(
        stages,
        vec![
            Stage::IndexingSource,
            Stage::IndexingTarget,
            Stage::Retrieval,
            Stage::Classification,
            Stage::Complete,
        ]
    );
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));
}

#[tokio::test]
async fn test_compare_all_empty_target() {
    let store = sky_store();
    store.insert_corpus(corpus("empty", &[]));
    let generator = FakeGenerator::new(Reply::Echo);
    let cmp = comparator(&store, WordEmbedder::default(), generator.clone());

    let err = cmp
        .compare_all("a", "empty", ComparisonParams::new(0.0, 5), None)
        .await
        .unwrap_err();

    assert!(matches!(err, RelationError::EmptyCorpus { ref corpus_id } if corpus_id == "empty"));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.relation_count(), 0);
    assert!(!cmp.has_vectors("empty"));
}

#[tokio::test]
async fn test_compare_all_unknown_corpus() {
    let store = sky_store();
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    let err = cmp
        .compare_all("a", "missing", ComparisonParams::new(0.3, 1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelationError::CorpusNotFound { .. }));
}

#[tokio::test]
async fn test_unreachable_threshold_yields_empty_map() {
    let store = Arc::new(InMemoryStore::new());
    let source: Vec<String> = (0..50).map(|i| format!("source passage {i} about tides")).collect();
    let target: Vec<String> = (0..50).map(|i| format!("target passage {i} about tides")).collect();
    store.insert_corpus(corpus("src", &source.iter().map(String::as_str).collect::<Vec<_>>()));
    store.insert_corpus(corpus("tgt", &target.iter().map(String::as_str).collect::<Vec<_>>()));
    let generator = FakeGenerator::new(Reply::Echo);
    let cmp = comparator(&store, WordEmbedder::default(), generator.clone());

    let map = cmp
        .compare_all("src", "tgt", ComparisonParams::new(1.1, 5), None)
        .await
        .unwrap();

    assert!(map.values().all(Vec::is_empty));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    assert!(cmp.has_vectors("src") && cmp.has_vectors("tgt"));
}

#[tokio::test]
async fn test_classification_failure_skips_one_passage() {
    let store = Arc::new(InMemoryStore::new());
    store.insert_corpus(corpus(
        "a",
        &["Glaciers carve valleys slowly.", "POISON glaciers carve valleys."],
    ));
    store.insert_corpus(corpus("b", &["Valleys carved by glaciers over ages."]));
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    let map = cmp
        .compare_all("a", "b", ComparisonParams::new(0.2, 3), None)
        .await
        .unwrap();

    assert!(map.contains_key("a-0"));
    assert!(!map.contains_key("a-1"));
}

#[tokio::test]
async fn test_non_unit_classification_failure_aborts_run() {
    let store = Arc::new(InMemoryStore::new());
    store.insert_corpus(corpus("a", &["CORRUPT glaciers carve valleys."]));
    store.insert_corpus(corpus("b", &["Valleys carved by glaciers over ages."]));
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    let err = cmp
        .compare_all("a", "b", ComparisonParams::new(0.2, 3), None)
        .await
        .unwrap_err();

    assert!(matches!(err, RelationError::Store(_)));
    assert_eq!(store.relation_count(), 0);
}

#[tokio::test]
async fn test_retrieval_failure_yields_zero_candidates_for_one_passage() {
    let store = Arc::new(InMemoryStore::new());
    let texts = [
        "Glaciers carve valleys slowly.",
        "UNEMBEDDABLE glaciers carve valleys.",
        "Valleys were carved by glaciers.",
    ];
    store.insert_corpus(corpus("a", &texts));
    store.insert_corpus(corpus("b", &["Valleys carved by glaciers over ages."]));
    let embedder = WordEmbedder::default();
    let generator = FakeGenerator::new(Reply::Echo);
    let cmp = comparator(&store, embedder.clone(), generator.clone());

    // The source counts as indexed but has no vector for a-1, so retrieval
    // for a-1 re-embeds its text and the oracle refuses.
    let mut seeded = Vec::new();
    for (index, text) in texts.iter().enumerate() {
        if index != 1 {
            seeded.push((format!("a-{index}"), embedder.embed(text).await.unwrap()));
        }
    }
    cmp.index().replace_corpus("a", seeded);
    assert!(cmp.has_vectors("a"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let map = cmp
        .compare_all("a", "b", ComparisonParams::new(0.2, 3), Some(&tx))
        .await
        .unwrap();

    assert!(map.contains_key("a-0"));
    assert!(map.contains_key("a-2"));
    assert!(!map.contains_key("a-1"));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.relations_for("a", None).await.unwrap().len(), 2);

    drop(tx);
    let mut last = None;
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::Stage { stage, percent, .. } = event {
            last = Some((stage, percent));
        }
    }
    assert_eq!(last, Some((Stage::Complete, 100)));
}

#[tokio::test]
async fn test_rerun_replaces_stored_relations() {
    let store = sky_store();
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    cmp.compare_all("a", "b", ComparisonParams::new(0.3, 1), None)
        .await
        .unwrap();
    assert_eq!(store.relations_for("a", None).await.unwrap().len(), 1);

    let map = cmp
        .compare_all("a", "b", ComparisonParams::new(1.1, 1), None)
        .await
        .unwrap();
    assert!(map.is_empty());
    assert!(store.relations_for("a", None).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_classification_timeout_is_unit_failure() {
    let store = sky_store();
    let options = ComparatorOptions {
        classify_timeout: Duration::from_secs(1),
        ..ComparatorOptions::default()
    };
    let cmp = Comparator::new(
        store.clone(),
        Box::new(WordEmbedder::default()),
        Box::new(FakeGenerator::new(Reply::Hang)),
        options,
    );

    let map = cmp
        .compare_all("a", "b", ComparisonParams::new(0.3, 1), None)
        .await
        .unwrap();
    assert!(map.is_empty());

    let focus = corpus("a", &["The sky is blue because of Rayleigh scattering."]).passages[0].clone();
    let err = cmp
        .compare_one(&focus, "b", ComparisonParams::new(0.3, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, RelationError::Timeout(_)));
}

#[tokio::test]
async fn test_single_embedding_failure_leaves_corpus_unindexed() {
    let store = Arc::new(InMemoryStore::new());
    store.insert_corpus(corpus(
        "a",
        &["First passage.", "UNEMBEDDABLE second passage.", "Third passage."],
    ));
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    let err = cmp.index_corpus("a").await.unwrap_err();
    assert!(matches!(err, RelationError::Oracle(_)));
    assert!(!cmp.has_vectors("a"));
    assert!(store.load_vectors("a", "bag-of-words").await.unwrap().is_none());
}

#[tokio::test]
async fn test_index_empty_corpus() {
    let store = Arc::new(InMemoryStore::new());
    store.insert_corpus(corpus("empty", &[]));
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    assert!(matches!(
        cmp.index_corpus("empty").await,
        Err(RelationError::EmptyCorpus { .. })
    ));
}

#[tokio::test]
async fn test_index_hydrates_from_cache() {
    let store = sky_store();
    let first = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));
    assert_eq!(first.index_corpus("b").await.unwrap(), 1);
    assert!(store.load_vectors("b", "bag-of-words").await.unwrap().is_some());

    let embedder = WordEmbedder::default();
    let second = comparator(&store, embedder.clone(), FakeGenerator::new(Reply::Echo));
    second.ensure_indexed("b").await.unwrap();

    assert!(second.has_vectors("b"));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_remove_corpus_vectors() {
    let store = sky_store();
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));
    cmp.index_corpus("a").await.unwrap();

    cmp.remove_corpus_vectors("a").await.unwrap();

    assert!(!cmp.has_vectors("a"));
    assert!(store.load_vectors("a", "bag-of-words").await.unwrap().is_none());
}

#[tokio::test]
async fn test_auto_sweep_continues_after_failed_pair() {
    let store = Arc::new(InMemoryStore::new());
    store.insert_corpus(corpus("broken", &["UNEMBEDDABLE tides and moons."]));
    store.insert_corpus(corpus("good", &["The moon pulls the tides."]));
    store.insert_corpus(corpus("new", &["Tides follow the moon."]));
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let jobs = cmp
        .auto_compare_new_corpus("new", ComparisonParams::new(0.2, 3), Some(&tx))
        .await;

    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|j| j.status.is_terminal()));
    let failed: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Error).collect();
    assert_eq!(failed.len(), 2);
    assert!(failed
        .iter()
        .all(|j| j.source_corpus_id == "broken" || j.target_corpus_id == "broken"));
    let good: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Complete).collect();
    assert_eq!(good.len(), 2);
    assert!(good.iter().all(|j| j.relation_count == 1));

    // Both directions against "good" were persisted.
    assert_eq!(store.relations_for("new", None).await.unwrap().len(), 1);
    assert_eq!(store.relations_for("good", None).await.unwrap().len(), 1);

    drop(tx);
    let mut job_events = 0;
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::Job(job) = event {
            assert!(jobs.iter().any(|j| j.id == job.id));
            job_events += 1;
        }
    }
    assert!(job_events >= 8, "expected start and end events for every job");
}

#[tokio::test]
async fn test_auto_sweep_with_no_other_corpora() {
    let store = sky_store();
    store.remove_corpus("b");
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    let jobs = cmp
        .auto_compare_new_corpus("a", ComparisonParams::new(0.5, 3), None)
        .await;
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn test_full_context_whole_mode() {
    let store = Arc::new(InMemoryStore::new());
    store.insert_corpus(corpus("a", &["Alpha one.", "Alpha two."]));
    store.insert_corpus(corpus("b", &["Beta one.", "Beta two."]));
    let embedder = WordEmbedder::default();
    let generator = FakeGenerator::new(Reply::Echo);
    let cmp = comparator(&store, embedder.clone(), generator.clone());

    let map = cmp.compare_full_context("a", "b", None).await.unwrap();

    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    let rels = map.get("a-0").unwrap();
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].related_passage_id, "b-0");
    assert_eq!(rels[0].relation, RelationType::Analogous);
    assert_eq!(rels[0].basis, SimilarityBasis::None);
    assert_eq!(rels[0].similarity, 1.0);
    assert_eq!(map.get("a-1").unwrap()[0].related_passage_id, "b-1");
    assert_eq!(store.relation_count(), 2);
}

#[tokio::test]
async fn test_full_context_empty_corpus() {
    let store = sky_store();
    store.insert_corpus(corpus("empty", &[]));
    let cmp = comparator(&store, WordEmbedder::default(), FakeGenerator::new(Reply::Echo));

    assert!(matches!(
        cmp.compare_full_context("a", "empty", None).await,
        Err(RelationError::EmptyCorpus { .. })
    ));
}
