//! Relation classification through a text-generation oracle.
//!
//! Two entry points share one prompt style and one validation path:
//!
//! - [`classify`]: one focus passage against its retrieved candidates.
//!   Each relation carries the candidate's cosine similarity.
//! - [`classify_batch`]: every source passage of a batch against every
//!   target passage (full-context mode). Relations carry
//!   [`NO_EMBEDDING_SIMILARITY`] and [`SimilarityBasis::None`].
//!
//! Oracle failures (`Oracle`, `Timeout`) are returned to the caller, which
//! decides whether they are fatal. Unparseable responses and items naming
//! unknown passages never are: they degrade to fewer relations.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{RelationError, Result};
use crate::models::{
    Passage, PassageRelation, RelationType, SimilarityBasis, NO_EMBEDDING_SIMILARITY,
};
use crate::parse::{coerce_items, parse_response, RelationItem};

/// A text-generation oracle.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Generate a completion for a system and user prompt.
    ///
    /// # Errors
    ///
    /// [`RelationError::Oracle`] on a non-success status or a non-JSON
    /// payload, [`RelationError::Timeout`] when the deadline passes.
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// A candidate passage and the similarity that surfaced it.
#[derive(Debug, Clone, Copy)]
pub struct ScoredPassage<'a> {
    pub passage: &'a Passage,
    /// `None` when the candidate did not come from embedding retrieval.
    pub similarity: Option<f32>,
}

/// Corpus ids and the full passage id sets a batch is validated against.
#[derive(Debug, Clone, Copy)]
pub struct BatchScope<'a> {
    pub source_corpus_id: &'a str,
    pub target_corpus_id: &'a str,
    pub source_ids: &'a HashSet<String>,
    pub target_ids: &'a HashSet<String>,
}

fn relation_list() -> String {
    RelationType::ALL
        .iter()
        .map(RelationType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// System prompt for per-passage classification.
pub fn focus_system_prompt() -> String {
    format!(
        "You compare passages from different books and label how each candidate passage \
         relates to a focus passage.\n\
         Relation types: {relations}.\n\
         - supports: the candidate gives evidence or agreement for the focus passage.\n\
         - contradicts: the candidate disputes or conflicts with the focus passage.\n\
         - extends: the candidate develops the focus passage's idea further.\n\
         - analogous: the candidate makes a parallel point in a different setting.\n\
         Respond with a JSON array only. Do not wrap it in markdown code fences.\n\
         Return exactly one object per candidate, with the fields \
         \"passage_id\" (the candidate id, copied exactly), \
         \"relation\" (one of: {relations}) and \
         \"evidence\" (one or two sentences of justification).",
        relations = relation_list()
    )
}

/// System prompt for full-context (batch) classification.
pub fn batch_system_prompt() -> String {
    format!(
        "You compare two books and find meaningful relationships between passages of the \
         SOURCE book and passages of the TARGET book.\n\
         Relation types: {relations}.\n\
         Respond with a JSON array only. Do not wrap it in markdown code fences.\n\
         Each object has the fields \"source_id\" (a SOURCE passage id, copied exactly), \
         \"passage_id\" (a TARGET passage id, copied exactly), \
         \"relation\" (one of: {relations}) and \
         \"evidence\" (one or two sentences of justification).\n\
         Only include pairs with a clear relationship. Return [] if there are none.",
        relations = relation_list()
    )
}

fn push_passage(buf: &mut String, passage: &Passage) {
    buf.push_str(&format!("[passage_id: {}]\n", passage.id));
    buf.push_str(passage.text.trim());
    buf.push_str("\n\n");
}

/// User prompt for one focus passage and its candidates.
pub fn focus_user_prompt(focus: &Passage, candidates: &[ScoredPassage<'_>]) -> String {
    let mut buf = String::new();
    buf.push_str("FOCUS PASSAGE\n");
    push_passage(&mut buf, focus);
    buf.push_str(&format!("CANDIDATE PASSAGES ({})\n", candidates.len()));
    for c in candidates {
        push_passage(&mut buf, c.passage);
    }
    buf.push_str(&format!(
        "Return a JSON array with exactly {} objects, one per candidate.",
        candidates.len()
    ));
    buf
}

/// User prompt for a source/target batch.
pub fn batch_user_prompt(sources: &[Passage], targets: &[Passage]) -> String {
    let mut buf = String::new();
    buf.push_str(&format!("SOURCE PASSAGES ({})\n", sources.len()));
    for p in sources {
        push_passage(&mut buf, p);
    }
    buf.push_str(&format!("TARGET PASSAGES ({})\n", targets.len()));
    for p in targets {
        push_passage(&mut buf, p);
    }
    buf.push_str("Return the JSON array of relationships.");
    buf
}

/// Parse a response into items; an exhausted strategy chain yields none.
fn parse_or_empty(response: &str, context: &str) -> Vec<RelationItem> {
    match parse_response(response) {
        Ok((values, strategy)) => {
            debug!(%context, strategy, items = values.len(), "parsed classifier response");
            coerce_items(&values)
        }
        Err(e) => {
            let preview: String = response.chars().take(120).collect();
            warn!(%context, error = %e, %preview, "classifier response unusable");
            Vec::new()
        }
    }
}

fn unknown(passage_id: &str) -> RelationError {
    RelationError::UnknownPassageReference {
        passage_id: passage_id.to_string(),
    }
}

/// Classify how each candidate relates to `focus`.
///
/// Every returned relation names a passage from `candidates`; items naming
/// anything else, duplicates, and malformed items are dropped. An
/// unparseable response yields an empty list.
///
/// # Errors
///
/// Only oracle failures ([`RelationError::Oracle`],
/// [`RelationError::Timeout`]) are returned.
pub async fn classify(
    generator: &dyn TextGenerator,
    focus: &Passage,
    candidates: &[ScoredPassage<'_>],
) -> Result<Vec<PassageRelation>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let response = generator
        .generate(&focus_system_prompt(), &focus_user_prompt(focus, candidates))
        .await?;

    let by_id: HashMap<&str, &ScoredPassage<'_>> = candidates
        .iter()
        .map(|c| (c.passage.id.as_str(), c))
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut relations = Vec::new();
    for item in parse_or_empty(&response, &focus.id) {
        let Some(candidate) = by_id.get(item.passage_id.as_str()) else {
            debug!(focus = %focus.id, error = %unknown(&item.passage_id), "dropping item");
            continue;
        };
        if !seen.insert(item.passage_id.clone()) {
            continue;
        }
        let (similarity, basis) = match candidate.similarity {
            Some(score) => (score, SimilarityBasis::Embedding),
            None => (NO_EMBEDDING_SIMILARITY, SimilarityBasis::None),
        };
        relations.push(PassageRelation {
            focus_passage_id: focus.id.clone(),
            focus_corpus_id: focus.corpus_id.clone(),
            related_passage_id: candidate.passage.id.clone(),
            related_corpus_id: candidate.passage.corpus_id.clone(),
            relation: item.relation,
            evidence: item.evidence,
            similarity,
            basis,
        });
    }
    Ok(relations)
}

/// Classify relationships between a batch of source passages and a batch
/// of target passages in one oracle call.
///
/// Items are validated against the full id sets in `scope`, not only the
/// passages shown in this batch.
///
/// # Errors
///
/// Only oracle failures are returned.
pub async fn classify_batch(
    generator: &dyn TextGenerator,
    sources: &[Passage],
    targets: &[Passage],
    scope: BatchScope<'_>,
) -> Result<Vec<PassageRelation>> {
    if sources.is_empty() || targets.is_empty() {
        return Ok(Vec::new());
    }

    let response = generator
        .generate(&batch_system_prompt(), &batch_user_prompt(sources, targets))
        .await?;

    let context = format!("{}->{}", scope.source_corpus_id, scope.target_corpus_id);
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut relations = Vec::new();
    for item in parse_or_empty(&response, &context) {
        let Some(source_id) = item.source_id.clone() else {
            debug!(%context, passage_id = %item.passage_id, "dropping item without source_id");
            continue;
        };
        if !scope.source_ids.contains(&source_id) {
            debug!(%context, error = %unknown(&source_id), "dropping item");
            continue;
        }
        if !scope.target_ids.contains(&item.passage_id) {
            debug!(%context, error = %unknown(&item.passage_id), "dropping item");
            continue;
        }
        if !seen.insert((source_id.clone(), item.passage_id.clone())) {
            continue;
        }
        relations.push(PassageRelation {
            focus_passage_id: source_id,
            focus_corpus_id: scope.source_corpus_id.to_string(),
            related_passage_id: item.passage_id,
            related_corpus_id: scope.target_corpus_id.to_string(),
            relation: item.relation,
            evidence: item.evidence,
            similarity: NO_EMBEDDING_SIMILARITY,
            basis: SimilarityBasis::None,
        });
    }
    Ok(relations)
}
