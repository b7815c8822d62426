//! CLI command implementations.
//!
//! Each `run_*` function backs one `relate` subcommand. Results go to
//! stdout; progress and logs go to stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use relate_core::models::{relation_count, Corpus, JobStatus, RelationMap};
use relate_core::select::ComparisonParams;
use relate_core::split::split_passages;
use relate_core::store::{CorpusStore, RelationStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::compare::{Comparator, ComparatorOptions};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, DisabledEmbedder};
use crate::llm::{create_generator, DisabledGenerator};
use crate::progress::{spawn_reporter, ProgressMode, ProgressSink};
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(config).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn build_comparator(config: &Config, store: &Arc<SqliteStore>) -> Result<Comparator> {
    let embedder = create_embedder(&config.embedding).context("Failed to set up embedding oracle")?;
    let generator = create_generator(&config.llm).context("Failed to set up llm oracle")?;
    Ok(Comparator::new(
        store.clone(),
        embedder,
        generator,
        ComparatorOptions::from_config(config),
    )
    .with_relation_store(store.clone())
    .with_embedding_cache(store.clone()))
}

/// Comparator for commands that touch stored vectors but never call an
/// oracle, so they work without provider credentials.
fn offline_comparator(config: &Config, store: &Arc<SqliteStore>) -> Comparator {
    Comparator::new(
        store.clone(),
        Box::new(DisabledEmbedder),
        Box::new(DisabledGenerator),
        ComparatorOptions::from_config(config),
    )
    .with_relation_store(store.clone())
    .with_embedding_cache(store.clone())
}

struct Progress {
    sink: ProgressSink,
    reporter: JoinHandle<()>,
}

impl Progress {
    fn start(mode: ProgressMode) -> Self {
        let (sink, rx) = mpsc::unbounded_channel();
        Self {
            sink,
            reporter: spawn_reporter(mode.reporter(), rx),
        }
    }

    /// Close the channel and wait for queued events to be printed.
    async fn finish(self) {
        drop(self.sink);
        let _ = self.reporter.await;
    }
}

/// Corpus id derived from a title: lowercase ascii alphanumerics joined by `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// `relate add`: split a text file into passages and store it as a corpus.
pub async fn run_add(
    config: &Config,
    file: &Path,
    title: Option<String>,
    auto: bool,
    progress: ProgressMode,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let title = match title {
        Some(t) => t,
        None => file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".to_string()),
    };
    let id = slugify(&title);
    if id.is_empty() {
        bail!("Cannot derive a corpus id from title '{}'", title);
    }

    let store = open_store(config).await?;
    if store.get_corpus(&id).await?.is_some() {
        bail!("Corpus '{}' already exists; remove it first", id);
    }

    let passages = split_passages(&id, &text, config.segmentation.max_tokens);
    if passages.is_empty() {
        bail!("{} contains no text", file.display());
    }
    let corpus = Corpus {
        id: id.clone(),
        title,
        passages,
    };
    store
        .insert_corpus(&corpus)
        .await
        .with_context(|| format!("Failed to store corpus '{}'", id))?;
    println!(
        "Added {} \"{}\" ({} passages, {} chars)",
        corpus.id,
        corpus.title,
        corpus.passages.len(),
        corpus.char_count()
    );

    if auto {
        sweep(config, &store, &id, progress).await?;
    }
    store.pool().close().await;
    Ok(())
}

/// `relate books`: list corpora.
pub async fn run_books(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let corpora = store.list_corpora().await?;
    if corpora.is_empty() {
        println!("No books. Add one with `relate add <file>`.");
        return Ok(());
    }

    let indexed = store.indexed_corpora(config.embedding.model_name()).await?;

    println!(
        "{:<28} {:<32} {:>8} {:>10}  {:>9}  {}",
        "ID", "TITLE", "PASSAGES", "CHARS", "RELATIONS", "INDEXED"
    );
    println!("{}", "-".repeat(100));
    for c in &corpora {
        let relations = store.relation_count(&c.id).await?;
        println!(
            "{:<28} {:<32} {:>8} {:>10}  {:>9}  {}",
            c.id,
            truncate(&c.title, 32),
            c.passage_count,
            c.char_count,
            relations,
            if indexed.contains(&c.id) { "yes" } else { "no" }
        );
    }
    store.pool().close().await;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

/// `relate remove`: delete a corpus and everything that refers to it.
pub async fn run_remove(config: &Config, corpus_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    if store.get_corpus(corpus_id).await?.is_none() {
        bail!("Corpus not found: {}", corpus_id);
    }
    offline_comparator(config, &store)
        .remove_corpus_vectors(corpus_id)
        .await
        .with_context(|| format!("Failed to drop vectors of {}", corpus_id))?;
    if !store.delete_corpus(corpus_id).await? {
        bail!("Corpus not found: {}", corpus_id);
    }
    println!("Removed {}", corpus_id);
    store.pool().close().await;
    Ok(())
}

/// `relate index`: embed a corpus and cache its vectors.
pub async fn run_index(config: &Config, corpus_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let comparator = build_comparator(config, &store)?;
    let count = comparator
        .index_corpus(corpus_id)
        .await
        .with_context(|| format!("Failed to index {}", corpus_id))?;
    println!("Indexed {}: {} vectors", corpus_id, count);
    store.pool().close().await;
    Ok(())
}

pub struct CompareArgs<'a> {
    pub source: &'a str,
    pub target: &'a str,
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
    pub full_context: bool,
    pub json: bool,
}

/// `relate compare`: run one directional comparison and persist it.
pub async fn run_compare(config: &Config, args: CompareArgs<'_>, progress: ProgressMode) -> Result<()> {
    let defaults = config.comparison.interactive();
    let params = ComparisonParams::new(
        args.threshold.unwrap_or(defaults.threshold),
        args.top_k.unwrap_or(defaults.top_k),
    );
    if params.top_k == 0 {
        bail!("--top-k must be >= 1");
    }

    let store = open_store(config).await?;
    let comparator = build_comparator(config, &store)?;
    let reporter = Progress::start(progress);
    let result = if args.full_context {
        comparator
            .compare_full_context(args.source, args.target, Some(&reporter.sink))
            .await
    } else {
        comparator
            .compare_all(args.source, args.target, params, Some(&reporter.sink))
            .await
    };
    reporter.finish().await;
    let map = result.with_context(|| format!("Failed to compare {} with {}", args.source, args.target))?;

    let source = store
        .get_corpus(args.source)
        .await?
        .with_context(|| format!("Corpus not found: {}", args.source))?;
    if args.json {
        let ordered: Vec<_> = source
            .passages
            .iter()
            .filter_map(|p| map.get(&p.id))
            .flatten()
            .collect();
        println!("{}", serde_json::to_string_pretty(&ordered)?);
    } else {
        print_relations(&source, &map);
    }
    store.pool().close().await;
    Ok(())
}

fn print_relations(source: &Corpus, map: &RelationMap) {
    for passage in &source.passages {
        let Some(found) = map.get(&passage.id) else {
            continue;
        };
        println!("[{}] #{} {}", passage.id, passage.index, truncate(passage.text.trim(), 72));
        for rel in found {
            let score = if rel.has_embedding_basis() {
                format!("{:.3}", rel.similarity)
            } else {
                "-".to_string()
            };
            println!(
                "    {:<11} {:>5}  {}:{}",
                rel.relation.as_str(),
                score,
                rel.related_corpus_id,
                rel.related_passage_id
            );
            println!("    {:<11} {:>5}  {}", "", "", truncate(&rel.evidence, 90));
        }
        println!();
    }
    println!("{} relations", relation_count(map));
}

/// `relate auto`: sweep a corpus against every other corpus.
pub async fn run_auto(config: &Config, corpus_id: &str, progress: ProgressMode) -> Result<()> {
    let store = open_store(config).await?;
    if store.get_corpus(corpus_id).await?.is_none() {
        bail!("Corpus not found: {}", corpus_id);
    }
    sweep(config, &store, corpus_id, progress).await?;
    store.pool().close().await;
    Ok(())
}

async fn sweep(
    config: &Config,
    store: &Arc<SqliteStore>,
    corpus_id: &str,
    progress: ProgressMode,
) -> Result<()> {
    let comparator = build_comparator(config, store)?;
    let reporter = Progress::start(progress);
    let jobs = comparator
        .auto_compare_new_corpus(corpus_id, config.comparison.automatic(), Some(&reporter.sink))
        .await;
    reporter.finish().await;

    if jobs.is_empty() {
        println!("No other books to compare with.");
        return Ok(());
    }
    for job in &jobs {
        match job.status {
            JobStatus::Complete => {
                println!("{:<48} {} relations", job.direction(), job.relation_count)
            }
            _ => println!(
                "{:<48} failed: {}",
                job.direction(),
                job.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    Ok(())
}

/// `relate relations`: print stored relations as JSON.
pub async fn run_relations(config: &Config, corpus_id: &str, passage_id: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    if store.get_corpus(corpus_id).await?.is_none() {
        bail!("Corpus not found: {}", corpus_id);
    }
    let relations = store.relations_for(corpus_id, passage_id).await?;
    println!("{}", serde_json::to_string_pretty(&relations)?);
    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("The Origin of Species"), "the-origin-of-species");
        assert_eq!(slugify("  Walden; or, Life in the Woods!  "), "walden-or-life-in-the-woods");
        assert_eq!(slugify("¿¿??"), "");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
