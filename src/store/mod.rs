//! Persistence seam for documents, chunks, and processing jobs.
//!
//! [`ChunkStore`] is the single trait the pipeline talks to. The
//! production implementation is [`SqliteStore`]; [`InMemoryStore`] backs
//! tests and exploratory runs without a database file.
//!
//! All read paths that can cross tenants take an `org_id` and scope their
//! queries to it. Chunk ordering guarantees are part of the contract:
//! `chunks_for_document` and `neighbors` return rows ordered by ascending
//! `chunk_no`, and `search` breaks similarity ties by ascending
//! `chunk_no`, then chunk id.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Document, DocumentChunk, DocumentStatus, ProcessingJob};

/// One raw vector-search candidate.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: DocumentChunk,
    /// Owning tenant, carried so callers can assert scoping held.
    pub org_id: String,
    pub similarity: f32,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    /// Look up a document by content hash within one tenant.
    async fn find_by_hash(&self, org_id: &str, content_hash: &str) -> Result<Option<Document>>;

    async fn get_document(&self, org_id: &str, id: Uuid) -> Result<Option<Document>>;

    async fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        processed_at: Option<i64>,
    ) -> Result<()>;

    /// Atomically replace a document's chunk set. `chunks` must carry
    /// dense `chunk_no` values starting at 0; anything else is rejected.
    async fn replace_chunks(&self, document_id: Uuid, chunks: &[DocumentChunk]) -> Result<()>;

    /// All chunks of a document, ordered by ascending `chunk_no`.
    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>>;

    /// Chunks with `chunk_no` in `[center - window, center + window]`,
    /// ordered by ascending `chunk_no`. Clamped at document edges.
    async fn neighbors(
        &self,
        document_id: Uuid,
        center: i64,
        window: usize,
    ) -> Result<Vec<DocumentChunk>>;

    /// Top-`limit` chunks of one tenant by cosine similarity to `query`,
    /// optionally restricted to a set of documents (an empty set means no
    /// restriction). Ordered by descending similarity, ties by ascending
    /// `chunk_no`, then chunk id.
    async fn search(
        &self,
        org_id: &str,
        query: &[f32],
        limit: usize,
        document_filter: Option<&[Uuid]>,
    ) -> Result<Vec<SearchHit>>;

    /// Delete a document and everything hanging off it (chunks, job).
    async fn delete_document(&self, org_id: &str, id: Uuid) -> Result<()>;

    async fn upsert_job(&self, job: &ProcessingJob) -> Result<()>;

    async fn get_job(&self, document_id: Uuid) -> Result<Option<ProcessingJob>>;
}

/// Shared validation for [`ChunkStore::replace_chunks`] implementations.
pub(crate) fn validate_dense(document_id: Uuid, chunks: &[DocumentChunk]) -> Result<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.document_id != document_id {
            anyhow::bail!(
                "Chunk {} belongs to document {}, expected {}",
                chunk.id,
                chunk.document_id,
                document_id
            );
        }
        if chunk.chunk_no != i as i64 {
            anyhow::bail!(
                "Chunk numbering must be dense from 0: found {} at position {}",
                chunk.chunk_no,
                i
            );
        }
    }
    Ok(())
}
