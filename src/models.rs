//! Core data models used throughout the RAG pipeline.
//!
//! These types represent the documents, chunks, processing jobs, and
//! retrieval results that flow through the ingestion and query paths.

use serde::Serialize;
use uuid::Uuid;

/// Lifecycle status of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(DocumentStatus::Uploaded),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// One uploaded file, owned by exactly one tenant.
///
/// `(org_id, content_hash)` is unique: re-uploading identical bytes within
/// a tenant resolves to the existing record instead of starting a second
/// processing pipeline.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub org_id: String,
    pub title: String,
    /// SHA-256 hex digest of the raw bytes, used for deduplication.
    pub content_hash: String,
    pub status: DocumentStatus,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

/// A contiguous span of extracted text, the atomic unit of embedding and
/// retrieval. Immutable once stored, except for deletion cascading from the
/// owning [`Document`].
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Dense 0-based index; ordering by `chunk_no` reconstructs the
    /// document's reading order.
    pub chunk_no: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    /// Source page number (1-based) the majority of this chunk was drawn
    /// from, when known.
    pub page: Option<i64>,
    pub metadata: serde_json::Value,
}

/// State of one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Extracting,
    Chunking,
    Embedding,
    Storing,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Extracting => "extracting",
            JobState::Chunking => "chunking",
            JobState::Embedding => "embedding",
            JobState::Storing => "storing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "extracting" => Some(JobState::Extracting),
            "chunking" => Some(JobState::Chunking),
            "embedding" => Some(JobState::Embedding),
            "storing" => Some(JobState::Storing),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Terminal states release the document lease and accept no further
    /// automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Closed transition table for the ingestion state machine.
    ///
    /// Any non-terminal state may move to `Failed`; `Failed -> Queued` is
    /// permitted only via an explicit operator-triggered retry.
    pub fn can_transition(&self, next: JobState) -> bool {
        use JobState::*;
        match (*self, next) {
            (Queued, Extracting)
            | (Extracting, Chunking)
            | (Chunking, Embedding)
            | (Embedding, Storing)
            | (Storing, Succeeded) => true,
            (from, Failed) if !from.is_terminal() => true,
            (Failed, Queued) => true,
            _ => false,
        }
    }
}

/// Tracks one attempt to ingest a document. At most one non-terminal job
/// exists per document at any time, enforced by the per-document lease.
#[derive(Debug, Clone)]
pub struct ProcessingJob {
    pub document_id: Uuid,
    pub state: JobState,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

/// Handle returned from `ingest()`, for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub document_id: Uuid,
    pub state: JobState,
    /// True when the upload deduplicated against an existing document.
    pub deduplicated: bool,
}

/// Subscription tier requested for answer generation; maps to a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Free,
    Pro,
    Enterprise,
}

impl ModelTier {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Some(ModelTier::Free),
            "pro" => Some(ModelTier::Pro),
            "enterprise" => Some(ModelTier::Enterprise),
            _ => None,
        }
    }
}

/// A primary retrieval hit with its similarity score and surrounding
/// context chunks (in document order, primary included).
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
    pub context: Vec<DocumentChunk>,
}

/// Transient result of one retrieval call, scoped to a single tenant.
/// Primaries are ordered by descending post-rerank score.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievedChunk>,
    /// Highest raw similarity among retrieved chunks; feeds confidence.
    pub top_similarity: f32,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// A grounding reference from the generated answer back to a source chunk.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub document_id: Uuid,
    pub page: Option<i64>,
    pub chunk_id: Uuid,
    pub quoted_text: String,
    pub relevance_score: f32,
}

/// Final response of the query path.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub answer_text: String,
    pub citations: Vec<Citation>,
    /// Blend of citation coverage and top retrieval similarity, in [0, 1].
    pub confidence: f32,
    /// The model that actually produced the answer (after any fallback).
    pub model_used: String,
    pub latency_ms: u64,
}
