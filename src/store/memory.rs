//! In-memory [`ChunkStore`] for tests and exploratory runs.
//!
//! Mirrors the SQLite implementation's semantics, including the unique
//! `(org_id, content_hash)` constraint and the deterministic search
//! ordering, but always scans exactly.

use anyhow::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{validate_dense, ChunkStore, SearchHit};
use crate::embedding::cosine_similarity;
use crate::models::{Document, DocumentChunk, DocumentStatus, ProcessingJob};

#[derive(Default)]
pub struct InMemoryStore {
    documents: RwLock<HashMap<Uuid, Document>>,
    chunks: RwLock<HashMap<Uuid, Vec<DocumentChunk>>>,
    jobs: RwLock<HashMap<Uuid, ProcessingJob>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut documents = write(&self.documents);
        // First writer wins for a given (org, hash), like the SQL store
        let exists = documents
            .values()
            .any(|d| d.org_id == doc.org_id && d.content_hash == doc.content_hash);
        if !exists {
            documents.insert(doc.id, doc.clone());
        }
        Ok(())
    }

    async fn find_by_hash(&self, org_id: &str, content_hash: &str) -> Result<Option<Document>> {
        Ok(read(&self.documents)
            .values()
            .find(|d| d.org_id == org_id && d.content_hash == content_hash)
            .cloned())
    }

    async fn get_document(&self, org_id: &str, id: Uuid) -> Result<Option<Document>> {
        Ok(read(&self.documents)
            .get(&id)
            .filter(|d| d.org_id == org_id)
            .cloned())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        processed_at: Option<i64>,
    ) -> Result<()> {
        if let Some(doc) = write(&self.documents).get_mut(&id) {
            doc.status = status;
            doc.processed_at = processed_at;
        }
        Ok(())
    }

    async fn replace_chunks(&self, document_id: Uuid, chunks: &[DocumentChunk]) -> Result<()> {
        validate_dense(document_id, chunks)?;
        write(&self.chunks).insert(document_id, chunks.to_vec());
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>> {
        let mut chunks = read(&self.chunks)
            .get(&document_id)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_no);
        Ok(chunks)
    }

    async fn neighbors(
        &self,
        document_id: Uuid,
        center: i64,
        window: usize,
    ) -> Result<Vec<DocumentChunk>> {
        let lo = center - window as i64;
        let hi = center + window as i64;
        let mut chunks: Vec<DocumentChunk> = read(&self.chunks)
            .get(&document_id)
            .map(|cs| {
                cs.iter()
                    .filter(|c| c.chunk_no >= lo && c.chunk_no <= hi)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_no);
        Ok(chunks)
    }

    async fn search(
        &self,
        org_id: &str,
        query: &[f32],
        limit: usize,
        document_filter: Option<&[Uuid]>,
    ) -> Result<Vec<SearchHit>> {
        let documents = read(&self.documents);
        let chunks = read(&self.chunks);

        let mut hits: Vec<SearchHit> = Vec::new();
        for (doc_id, doc_chunks) in chunks.iter() {
            let Some(doc) = documents.get(doc_id) else {
                continue;
            };
            if doc.org_id != org_id {
                continue;
            }
            if let Some(filter) = document_filter {
                if !filter.is_empty() && !filter.contains(doc_id) {
                    continue;
                }
            }
            for chunk in doc_chunks {
                let Some(embedding) = &chunk.embedding else {
                    continue;
                };
                hits.push(SearchHit {
                    chunk: chunk.clone(),
                    org_id: doc.org_id.clone(),
                    similarity: cosine_similarity(query, embedding),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk.chunk_no.cmp(&b.chunk.chunk_no))
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_document(&self, org_id: &str, id: Uuid) -> Result<()> {
        let mut documents = write(&self.documents);
        let owned = documents.get(&id).is_some_and(|d| d.org_id == org_id);
        if owned {
            documents.remove(&id);
            write(&self.chunks).remove(&id);
            write(&self.jobs).remove(&id);
        }
        Ok(())
    }

    async fn upsert_job(&self, job: &ProcessingJob) -> Result<()> {
        write(&self.jobs).insert(job.document_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, document_id: Uuid) -> Result<Option<ProcessingJob>> {
        Ok(read(&self.jobs).get(&document_id).cloned())
    }
}
