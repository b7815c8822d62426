//! Core data models used throughout relate.
//!
//! These types represent the corpora, passages, similarity candidates,
//! relations, and comparison jobs that flow through the indexing,
//! retrieval, and classification pipeline.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Similarity recorded on relations that were not produced by
/// nearest-neighbor retrieval (full-context or chapter-batched mode).
pub const NO_EMBEDDING_SIMILARITY: f32 = 1.0;

/// A contiguous excerpt of a corpus. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Passage UUID, unique within its corpus.
    pub id: String,
    /// Owning corpus id.
    pub corpus_id: String,
    /// Position within the corpus, starting at 0.
    pub index: usize,
    pub text: String,
    /// Character offset of the first character in the source text.
    pub start_offset: usize,
    /// Character offset one past the last character in the source text.
    pub end_offset: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Passage {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// One complete text (a "book") and its ordered passages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub id: String,
    pub title: String,
    /// Passages in corpus order.
    pub passages: Vec<Passage>,
}

impl Corpus {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Total character count over all passages.
    pub fn char_count(&self) -> usize {
        self.passages.iter().map(Passage::char_count).sum()
    }

    pub fn passage(&self, id: &str) -> Option<&Passage> {
        self.passages.iter().find(|p| p.id == id)
    }
}

/// Lightweight corpus listing row.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusSummary {
    pub id: String,
    pub title: String,
    pub passage_count: usize,
    pub char_count: usize,
}

/// A passage retrieved by nearest-neighbor search. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityCandidate {
    pub passage_id: String,
    pub corpus_id: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// The closed set of rhetorical relations between two passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Supports,
    Contradicts,
    Extends,
    Analogous,
}

impl RelationType {
    pub const ALL: [RelationType; 4] = [
        RelationType::Supports,
        RelationType::Contradicts,
        RelationType::Extends,
        RelationType::Analogous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Supports => "supports",
            RelationType::Contradicts => "contradicts",
            RelationType::Extends => "extends",
            RelationType::Analogous => "analogous",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = String;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supports" => Ok(RelationType::Supports),
            "contradicts" => Ok(RelationType::Contradicts),
            "extends" => Ok(RelationType::Extends),
            "analogous" => Ok(RelationType::Analogous),
            other => Err(format!("unknown relation type: {other}")),
        }
    }
}

/// Where a relation's similarity score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityBasis {
    /// Cosine similarity of the two passage embeddings.
    Embedding,
    /// Whole or chapter-batched classification; the score is
    /// [`NO_EMBEDDING_SIMILARITY`] and is not a match score.
    None,
}

impl SimilarityBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityBasis::Embedding => "embedding",
            SimilarityBasis::None => "none",
        }
    }
}

/// A classified relationship from a focus passage to a related passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageRelation {
    pub focus_passage_id: String,
    pub focus_corpus_id: String,
    pub related_passage_id: String,
    pub related_corpus_id: String,
    pub relation: RelationType,
    /// Short justification produced by the classifier.
    pub evidence: String,
    pub similarity: f32,
    pub basis: SimilarityBasis,
}

impl PassageRelation {
    /// True when `similarity` is a real cosine score.
    pub fn has_embedding_basis(&self) -> bool {
        self.basis == SimilarityBasis::Embedding
    }
}

/// Relations keyed by focus passage id. Iteration order is unspecified.
pub type RelationMap = HashMap<String, Vec<PassageRelation>>;

/// Number of relations across every entry of a [`RelationMap`].
pub fn relation_count(map: &RelationMap) -> usize {
    map.values().map(Vec::len).sum()
}

/// Lifecycle state of a [`ComparisonJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }
}

/// One directional comparison between two corpora.
///
/// Once the job reaches `Complete` or `Error` further transitions are
/// ignored.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonJob {
    pub id: String,
    pub source_corpus_id: String,
    pub target_corpus_id: String,
    pub status: JobStatus,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    pub relation_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ComparisonJob {
    pub fn new(source_corpus_id: &str, target_corpus_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_corpus_id: source_corpus_id.to_string(),
            target_corpus_id: target_corpus_id.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            message: "Waiting".to_string(),
            error: None,
            relation_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// `"source → target"`.
    pub fn direction(&self) -> String {
        format!("{} → {}", self.source_corpus_id, self.target_corpus_id)
    }

    pub fn start(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.message = message.into();
    }

    pub fn advance(&mut self, progress: u8, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Running;
        self.progress = progress.min(100).max(self.progress);
        self.message = message.into();
    }

    pub fn complete(&mut self, relation_count: usize) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Complete;
        self.progress = 100;
        self.relation_count = relation_count;
        self.message = format!("Found {relation_count} relations");
        self.finished_at = Some(Utc::now());
    }

    /// Mark the job failed. Relations already found stay counted.
    pub fn fail(&mut self, error: impl fmt::Display) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Error;
        self.error = Some(error.to_string());
        self.message = format!("Comparison failed: {error}");
        self.finished_at = Some(Utc::now());
    }
}
