//! Error taxonomy shared by every stage of the relation pipeline.
//!
//! Not every variant is fatal. [`RelationError::ParseFailure`] and
//! [`RelationError::UnknownPassageReference`] are produced and consumed
//! inside the classifier and always degrade to "fewer relations";
//! [`RelationError::Oracle`] and [`RelationError::Timeout`] are caught at
//! the smallest unit of work by the orchestrator, except while indexing.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by indexing, retrieval, classification, and storage.
#[derive(Debug, Error)]
pub enum RelationError {
    /// A query was made against a corpus with no stored vectors.
    #[error("corpus {corpus_id} has not been indexed")]
    NotIndexed { corpus_id: String },

    /// The corpus exists but has zero passages.
    #[error("corpus {corpus_id} has no passages")]
    EmptyCorpus { corpus_id: String },

    /// The corpus id does not exist in the store.
    #[error("corpus {corpus_id} not found")]
    CorpusNotFound { corpus_id: String },

    /// An oracle returned a non-success status or an unusable payload.
    #[error("oracle error: {0}")]
    Oracle(String),

    /// An oracle call exceeded its deadline and was abandoned.
    #[error("oracle call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Every response parsing strategy was exhausted.
    #[error("classifier response could not be parsed")]
    ParseFailure,

    /// A classifier item named a passage outside the expected id set.
    #[error("classifier referenced unknown passage {passage_id}")]
    UnknownPassageReference { passage_id: String },

    /// A storage backend failed.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl RelationError {
    /// Shorthand for [`RelationError::Oracle`].
    pub fn oracle(msg: impl Into<String>) -> Self {
        RelationError::Oracle(msg.into())
    }

    /// Whether the error is confined to one unit of work (one passage or
    /// one chapter batch) and the surrounding job may continue.
    pub fn is_unit_failure(&self) -> bool {
        matches!(
            self,
            RelationError::Oracle(_)
                | RelationError::Timeout(_)
                | RelationError::ParseFailure
                | RelationError::UnknownPassageReference { .. }
        )
    }
}

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, RelationError>;
