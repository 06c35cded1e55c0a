//! Error taxonomy for the RAG core.
//!
//! Every failure class the pipeline can surface is a named variant, so
//! callers can distinguish transient (retry-safe) conditions from terminal
//! ones without string matching. Ingestion-stage errors are recorded on the
//! [`ProcessingJob`](crate::models::ProcessingJob) and move the document to
//! `Failed`; query-path errors are returned synchronously.

use thiserror::Error;
use uuid::Uuid;

/// Why text extraction failed. Terminal for the attempt: the input is
/// deterministic, so an automatic retry would reproduce the same failure.
/// Operators may retry after changing the file type hint.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("document appears corrupt: {0}")]
    Corrupt(String),

    #[error("no strategy produced extractable text")]
    EmptyOutput,
}

/// Top-level pipeline error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("document contains no chunkable text")]
    EmptyDocument,

    #[error("embedding provider failed: {0}")]
    EmbeddingProvider(String),

    #[error("generation provider failed: {0}")]
    GenerationProvider(String),

    #[error("quota exceeded for org {org_id} on {resource}")]
    QuotaExceeded { org_id: String, resource: String },

    #[error("tenant isolation violated: chunk {chunk_id} is owned by org {actual}, search was scoped to {requested}")]
    TenantIsolationViolation {
        chunk_id: Uuid,
        actual: String,
        requested: String,
    },

    #[error("document {0} not found")]
    DocumentNotFound(Uuid),

    #[error("storage error: {0}")]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether a caller may safely retry the same request.
    ///
    /// Provider failures are typically transient (rate limits, timeouts);
    /// extraction, empty-document, and quota errors are not — retrying
    /// reproduces the outcome or makes the quota situation worse.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::EmbeddingProvider(_) | PipelineError::GenerationProvider(_)
        )
    }
}
