//! Full-context corpus decomposition.
//!
//! Full-context mode classifies a pair of corpora without narrowing by
//! nearest-neighbor retrieval first. When the pair fits within the token
//! budget it is classified in a single oracle call; otherwise each corpus
//! is cut into chapter-like [`Segment`]s and every (source group, target
//! group) pair is classified as its own batch.
//!
//! # Chapter heuristic
//!
//! A passage starts a new segment when its first line looks like a
//! `Chapter N` / `Part N` heading, or when it is short (plausibly a
//! heading) and not the final passage. Consecutive headings stay in one
//! segment. When no passage qualifies anywhere, the corpus is cut into
//! roughly [`UNIFORM_SEGMENT_TARGET`] equal segments instead. The result
//! is best-effort: segments always cover every passage exactly once, but
//! need not match the book's real chapters.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::classify::{classify_batch, BatchScope, TextGenerator};
use crate::error::{RelationError, Result};
use crate::models::{Corpus, Passage, PassageRelation, RelationMap};
use crate::split::CHARS_PER_TOKEN;

/// Passages shorter than this (in chars) may be headings.
pub const SHORT_PASSAGE_CHARS: usize = 80;

/// Segment count used when a corpus has no recognizable headings.
pub const UNIFORM_SEGMENT_TARGET: usize = 10;

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(chapter|part)\s+(\d+\b|[ivxlcdm]+\s*([.:\-–—]|$))")
            .expect("heading pattern is valid")
    })
}

/// Whether the first line of `text` is a `Chapter N` / `Part N` heading.
pub fn is_chapter_heading(text: &str) -> bool {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .is_some_and(|line| heading_re().is_match(line.trim()))
}

/// Token budget for full-context classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullContextBudget {
    /// Total estimated tokens a single call may use.
    pub token_budget: usize,
    /// Headroom kept for prompt scaffolding and the response.
    pub reserved_tokens: usize,
    /// Segments per side grouped into one batch in chapter mode.
    pub segments_per_batch: usize,
}

impl Default for FullContextBudget {
    fn default() -> Self {
        Self {
            token_budget: 800_000,
            reserved_tokens: 50_000,
            segments_per_batch: 1,
        }
    }
}

impl FullContextBudget {
    /// Tokens available to passage text.
    pub fn available(&self) -> usize {
        self.token_budget.saturating_sub(self.reserved_tokens)
    }
}

/// Approximate tokens for a corpus pair: total characters / 4.
pub fn estimate_token_count(a: &Corpus, b: &Corpus) -> usize {
    (a.char_count() + b.char_count()) / CHARS_PER_TOKEN
}

/// A contiguous range of a corpus's passages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    /// Passage index range, end exclusive.
    pub range: Range<usize>,
    /// Text of the heading that opened the segment, if any.
    pub heading: Option<String>,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// How a corpus pair will be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecompositionPlan {
    /// One call over both corpora.
    Whole { estimated_tokens: usize },
    /// Pairwise batches of chapter segments.
    Chapters {
        estimated_tokens: usize,
        source: Vec<Segment>,
        target: Vec<Segment>,
    },
}

/// Decide between whole-corpus and chapter-batched classification.
pub fn plan(source: &Corpus, target: &Corpus, budget: &FullContextBudget) -> DecompositionPlan {
    let estimated_tokens = estimate_token_count(source, target);
    if estimated_tokens <= budget.available() {
        DecompositionPlan::Whole { estimated_tokens }
    } else {
        DecompositionPlan::Chapters {
            estimated_tokens,
            source: segment_corpus(&source.passages),
            target: segment_corpus(&target.passages),
        }
    }
}

fn is_boundary(passages: &[Passage], i: usize) -> bool {
    let p = &passages[i];
    is_chapter_heading(&p.text)
        || (p.char_count() < SHORT_PASSAGE_CHARS && i + 1 < passages.len())
}

fn heading_of(p: &Passage) -> String {
    p.text.lines().next().unwrap_or_default().trim().to_string()
}

/// Partition passages into chapter-like segments.
///
/// Non-empty input always yields at least one segment, and the segments
/// cover every passage index exactly once, in order.
pub fn segment_corpus(passages: &[Passage]) -> Vec<Segment> {
    let n = passages.len();
    if n == 0 {
        return Vec::new();
    }

    let boundaries: Vec<bool> = (0..n).map(|i| is_boundary(passages, i)).collect();
    if !boundaries.iter().any(|b| *b) {
        return uniform_segments(n, UNIFORM_SEGMENT_TARGET);
    }

    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut heading = boundaries[0].then(|| heading_of(&passages[0]));
    let mut has_body = !boundaries[0] || !is_chapter_heading(&passages[0].text);

    for i in 1..n {
        if boundaries[i] && has_body {
            segments.push(Segment {
                index: segments.len(),
                range: start..i,
                heading: heading.take(),
            });
            start = i;
            heading = Some(heading_of(&passages[i]));
            has_body = !is_chapter_heading(&passages[i].text);
        } else if !boundaries[i] || !is_chapter_heading(&passages[i].text) {
            has_body = true;
        }
    }
    segments.push(Segment {
        index: segments.len(),
        range: start..n,
        heading,
    });
    segments
}

/// Cut `n` passages into about `target` equal segments.
pub fn uniform_segments(n: usize, target: usize) -> Vec<Segment> {
    if n == 0 {
        return Vec::new();
    }
    let size = n.div_ceil(target.max(1)).max(1);
    (0..n)
        .step_by(size)
        .enumerate()
        .map(|(index, start)| Segment {
            index,
            range: start..(start + size).min(n),
            heading: None,
        })
        .collect()
}

/// Merge consecutive segments into groups of `per_batch`, returned as
/// passage ranges.
pub fn group_ranges(segments: &[Segment], per_batch: usize) -> Vec<Range<usize>> {
    segments
        .chunks(per_batch.max(1))
        .filter_map(|group| {
            let first = group.first()?;
            let last = group.last()?;
            Some(first.range.start..last.range.end)
        })
        .collect()
}

/// Progress of a chapter-batched run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Result of a full-context run.
#[derive(Debug, Default)]
pub struct FullContextOutcome {
    /// Relations keyed by source passage id.
    pub relations: RelationMap,
    pub batches: usize,
    pub failed_batches: usize,
    pub estimated_tokens: usize,
}

fn merge(
    map: &mut RelationMap,
    seen: &mut HashSet<(String, String)>,
    found: Vec<PassageRelation>,
) {
    for rel in found {
        if seen.insert((rel.focus_passage_id.clone(), rel.related_passage_id.clone())) {
            map.entry(rel.focus_passage_id.clone()).or_default().push(rel);
        }
    }
}

/// Classify every relationship between `source` and `target` in
/// full-context mode.
///
/// In whole-corpus mode an oracle failure is returned. In chapter mode a
/// batch that fails with a unit failure
/// ([`RelationError::is_unit_failure`]) is logged and skipped; the
/// remaining batches still run. Any other error ends the run.
/// Batches are issued sequentially. `on_batch` is called after each one.
///
/// # Errors
///
/// [`RelationError::EmptyCorpus`] when either corpus has no passages;
/// oracle errors in whole-corpus mode.
pub async fn classify_full_context(
    generator: &dyn TextGenerator,
    source: &Corpus,
    target: &Corpus,
    budget: &FullContextBudget,
    on_batch: &mut (dyn FnMut(BatchProgress) + Send),
) -> Result<FullContextOutcome> {
    for corpus in [source, target] {
        if corpus.is_empty() {
            return Err(RelationError::EmptyCorpus {
                corpus_id: corpus.id.clone(),
            });
        }
    }

    let source_ids: HashSet<String> = source.passages.iter().map(|p| p.id.clone()).collect();
    let target_ids: HashSet<String> = target.passages.iter().map(|p| p.id.clone()).collect();
    let scope = BatchScope {
        source_corpus_id: &source.id,
        target_corpus_id: &target.id,
        source_ids: &source_ids,
        target_ids: &target_ids,
    };

    let mut outcome = FullContextOutcome::default();
    let mut seen = HashSet::new();

    match plan(source, target, budget) {
        DecompositionPlan::Whole { estimated_tokens } => {
            info!(
                source = %source.id,
                target = %target.id,
                estimated_tokens,
                "classifying corpus pair in one call"
            );
            outcome.estimated_tokens = estimated_tokens;
            outcome.batches = 1;
            let found =
                classify_batch(generator, &source.passages, &target.passages, scope).await?;
            merge(&mut outcome.relations, &mut seen, found);
            on_batch(BatchProgress {
                completed: 1,
                failed: 0,
                total: 1,
            });
        }
        DecompositionPlan::Chapters {
            estimated_tokens,
            source: source_segments,
            target: target_segments,
        } => {
            let source_groups = group_ranges(&source_segments, budget.segments_per_batch);
            let target_groups = group_ranges(&target_segments, budget.segments_per_batch);
            let total = source_groups.len() * target_groups.len();
            info!(
                source = %source.id,
                target = %target.id,
                estimated_tokens,
                source_segments = source_segments.len(),
                target_segments = target_segments.len(),
                batches = total,
                "corpus pair exceeds budget, classifying chapter batches"
            );
            outcome.estimated_tokens = estimated_tokens;
            outcome.batches = total;

            let mut completed = 0;
            for sr in &source_groups {
                for tr in &target_groups {
                    let result = classify_batch(
                        generator,
                        &source.passages[sr.clone()],
                        &target.passages[tr.clone()],
                        scope,
                    )
                    .await;
                    completed += 1;
                    match result {
                        Ok(found) => {
                            debug!(source_range = ?sr, target_range = ?tr, relations = found.len(), "batch classified");
                            merge(&mut outcome.relations, &mut seen, found);
                        }
                        Err(e) if e.is_unit_failure() => {
                            outcome.failed_batches += 1;
                            warn!(source_range = ?sr, target_range = ?tr, error = %e, "skipping chapter batch");
                        }
                        Err(e) => return Err(e),
                    }
                    on_batch(BatchProgress {
                        completed,
                        failed: outcome.failed_batches,
                        total,
                    });
                }
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelationType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn passage(corpus: &str, index: usize, text: &str) -> Passage {
        Passage {
            id: format!("{corpus}-{index}"),
            corpus_id: corpus.to_string(),
            index,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.len(),
            hash: String::new(),
        }
    }

    fn body(i: usize) -> String {
        format!(
            "Paragraph {i} carries enough prose to never be mistaken for a heading by the \
             short-passage rule of the segmenter."
        )
    }

    fn corpus(id: &str, texts: &[String]) -> Corpus {
        Corpus {
            id: id.to_string(),
            title: id.to_string(),
            passages: texts
                .iter()
                .enumerate()
                .map(|(i, t)| passage(id, i, t))
                .collect(),
        }
    }

    fn assert_exact_cover(segments: &[Segment], n: usize) {
        let mut next = 0;
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.index, i);
            assert_eq!(s.range.start, next);
            assert!(!s.is_empty());
            next = s.range.end;
        }
        assert_eq!(next, n);
    }

    #[test]
    fn test_heading_pattern() {
        assert!(is_chapter_heading("Chapter 1"));
        assert!(is_chapter_heading("  CHAPTER 12 The Storm"));
        assert!(is_chapter_heading("Part II."));
        assert!(is_chapter_heading("part iv"));
        assert!(is_chapter_heading("Chapter 3\nThe body follows on the next line."));
        assert!(!is_chapter_heading("Part of the problem is scale."));
        assert!(!is_chapter_heading("Chapters are overrated."));
        assert!(!is_chapter_heading("In chapter 2 we saw"));
    }

    #[test]
    fn test_estimate_token_count() {
        let a = corpus("a", &["x".repeat(400)]);
        let b = corpus("b", &["y".repeat(400), "z".repeat(200)]);
        assert_eq!(estimate_token_count(&a, &b), 250);
    }

    #[test]
    fn test_segments_from_headings() {
        let texts = vec![
            "Chapter 1".to_string(),
            body(1),
            body(2),
            "Chapter 2".to_string(),
            "The Second Coming".to_string(),
            body(3),
            "Chapter 3".to_string(),
            body(4),
        ];
        let c = corpus("a", &texts);
        let segments = segment_corpus(&c.passages);
        let ranges: Vec<Range<usize>> = segments.iter().map(|s| s.range.clone()).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..8]);
        assert_eq!(segments[1].heading.as_deref(), Some("Chapter 2"));
        assert_exact_cover(&segments, texts.len());
    }

    #[test]
    fn test_front_matter_is_own_segment() {
        let texts = vec![body(0), body(1), "Part I".to_string(), body(2)];
        let segments = segment_corpus(&corpus("a", &texts).passages);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].heading, None);
        assert_exact_cover(&segments, texts.len());
    }

    #[test]
    fn test_short_final_passage_is_not_a_boundary() {
        let texts = vec![body(0), body(1), "The end.".to_string()];
        let segments = segment_corpus(&corpus("a", &texts).passages);
        // No boundaries at all -> uniform fallback, still an exact cover.
        assert_exact_cover(&segments, 3);
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn test_no_headings_uniform_segments() {
        let texts: Vec<String> = (0..95).map(body).collect();
        let segments = segment_corpus(&corpus("a", &texts).passages);
        assert_eq!(segments.len(), 10);
        assert_exact_cover(&segments, 95);
    }

    #[test]
    fn test_single_passage_single_segment() {
        let segments = segment_corpus(&corpus("a", &[body(0)]).passages);
        assert_eq!(segments.len(), 1);
        assert_exact_cover(&segments, 1);
        assert!(segment_corpus(&[]).is_empty());
    }

    #[test]
    fn test_uniform_segments_cover() {
        for n in 1..40 {
            let segments = uniform_segments(n, 10);
            assert!(!segments.is_empty());
            assert!(segments.len() <= 10);
            assert_exact_cover(&segments, n);
        }
    }

    #[test]
    fn test_group_ranges() {
        let segments = uniform_segments(10, 5);
        let groups = group_ranges(&segments, 2);
        assert_eq!(groups, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_plan_respects_budget() {
        let a = corpus("a", &[body(0), body(1)]);
        let b = corpus("b", &[body(2)]);
        let roomy = FullContextBudget::default();
        assert!(matches!(plan(&a, &b, &roomy), DecompositionPlan::Whole { .. }));

        let tight = FullContextBudget {
            token_budget: 60,
            reserved_tokens: 50,
            segments_per_batch: 1,
        };
        assert!(matches!(plan(&a, &b, &tight), DecompositionPlan::Chapters { .. }));
    }

    /// Answers every batch by relating each source passage to the first
    /// target passage shown; fails the configured call numbers.
    struct FirstTargetGenerator {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    #[async_trait]
    impl TextGenerator for FirstTargetGenerator {
        fn model_name(&self) -> &str {
            "first-target"
        }

        async fn generate(&self, _system: &str, user: &str) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&call) {
                return Err(RelationError::oracle("simulated outage"));
            }
            let (sources, targets) = user
                .split_once("TARGET PASSAGES")
                .ok_or_else(|| RelationError::oracle("bad prompt"))?;
            let ids = |s: &str| -> Vec<String> {
                s.lines()
                    .filter_map(|l| l.strip_prefix("[passage_id: "))
                    .map(|l| l.trim_end_matches(']').to_string())
                    .collect()
            };
            let first_target = ids(targets).into_iter().next().unwrap_or_default();
            let items: Vec<String> = ids(sources)
                .iter()
                .map(|s| {
                    format!(
                        r#"{{"source_id": "{s}", "passage_id": "{first_target}", "relation": "supports", "evidence": "batch"}}"#
                    )
                })
                .collect();
            Ok(format!("[{}]", items.join(",")))
        }
    }

    #[tokio::test]
    async fn test_whole_mode_single_call() {
        let a = corpus("a", &[body(0), body(1)]);
        let b = corpus("b", &[body(2), body(3)]);
        let generator = FirstTargetGenerator {
            calls: AtomicUsize::new(0),
            fail_on: vec![],
        };
        let mut events = Vec::new();
        let outcome = classify_full_context(
            &generator,
            &a,
            &b,
            &FullContextBudget::default(),
            &mut |p| events.push(p),
        )
        .await
        .unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.batches, 1);
        assert_eq!(outcome.relations.len(), 2);
        assert_eq!(outcome.relations["a-0"][0].related_passage_id, "b-0");
        assert_eq!(outcome.relations["a-0"][0].relation, RelationType::Supports);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_chapter_mode_skips_failed_batch() {
        let texts = |c: &str| -> Vec<String> {
            vec![
                "Chapter 1".to_string(),
                format!("{c} {}", body(1)),
                "Chapter 2".to_string(),
                format!("{c} {}", body(2)),
            ]
        };
        let a = corpus("a", &texts("alpha"));
        let b = corpus("b", &texts("beta"));
        let budget = FullContextBudget {
            token_budget: 10,
            reserved_tokens: 5,
            segments_per_batch: 1,
        };
        let generator = FirstTargetGenerator {
            calls: AtomicUsize::new(0),
            fail_on: vec![1],
        };
        let mut events = Vec::new();
        let outcome = classify_full_context(&generator, &a, &b, &budget, &mut |p| events.push(p))
            .await
            .unwrap();

        // 2 source segments x 2 target segments, call #1 fails.
        assert_eq!(outcome.batches, 4);
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 4);
        assert_eq!(events.last().unwrap().completed, 4);
        assert!(outcome
            .relations
            .values()
            .flatten()
            .all(|r| r.similarity == crate::models::NO_EMBEDDING_SIMILARITY));
        assert!(!outcome.relations.is_empty());
    }

    struct BrokenGenerator;

    #[async_trait]
    impl TextGenerator for BrokenGenerator {
        fn model_name(&self) -> &str {
            "broken"
        }

        async fn generate(&self, _system: &str, _user: &str) -> Result<String> {
            Err(RelationError::Store(anyhow::anyhow!("prompt log unwritable")))
        }
    }

    #[tokio::test]
    async fn test_chapter_mode_stops_on_non_unit_failure() {
        let texts = vec![
            "Chapter 1".to_string(),
            body(1),
            "Chapter 2".to_string(),
            body(2),
        ];
        let a = corpus("a", &texts);
        let b = corpus("b", &texts);
        let budget = FullContextBudget {
            token_budget: 10,
            reserved_tokens: 5,
            segments_per_batch: 1,
        };
        let mut events = Vec::new();
        let err = classify_full_context(&BrokenGenerator, &a, &b, &budget, &mut |p| events.push(p))
            .await
            .unwrap_err();
        assert!(matches!(err, RelationError::Store(_)));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_empty_corpus_rejected() {
        let a = corpus("a", &[body(0)]);
        let b = corpus("b", &[]);
        let generator = FirstTargetGenerator {
            calls: AtomicUsize::new(0),
            fail_on: vec![],
        };
        let err = classify_full_context(&generator, &a, &b, &FullContextBudget::default(), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RelationError::EmptyCorpus { ref corpus_id } if corpus_id == "b"));
    }
}
