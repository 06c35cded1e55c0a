//! Ingestion orchestrator: upload, dedup, and the processing pipeline.
//!
//! `ingest` is the synchronous front door: it hashes the upload, stores
//! the raw bytes, and enqueues a processing job, deduplicating identical
//! content per tenant. `process` runs the pipeline for one document
//! (extract, chunk, embed, store) under a per-document lease, driving the
//! job state machine forward and recording failures on the job row.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunk::chunk_pages;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::extract::{extract_document, OcrProvider};
use crate::lease::LeaseArena;
use crate::models::{
    Document, DocumentChunk, DocumentStatus, JobHandle, JobState, ProcessingJob,
};
use crate::objstore::ObjectStore;
use crate::ratelimit::{Resource, UsageLimiter};
use crate::store::ChunkStore;

/// Work item handed to the ingestion workers.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub org_id: String,
    pub document_id: Uuid,
    pub type_hint: String,
}

/// What `process` did with a request.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Another worker holds the document's lease; the request was a no-op.
    LeaseHeld,
}

pub struct Orchestrator {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    ocr: Arc<dyn OcrProvider>,
    limiter: Arc<dyn UsageLimiter>,
    objects: Arc<dyn ObjectStore>,
    leases: LeaseArena,
    config: Config,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        ocr: Arc<dyn OcrProvider>,
        limiter: Arc<dyn UsageLimiter>,
        objects: Arc<dyn ObjectStore>,
        leases: LeaseArena,
        config: Config,
    ) -> Self {
        Self {
            store,
            embedder,
            ocr,
            limiter,
            objects,
            leases,
            config,
        }
    }

    /// Accept an upload. Identical bytes within a tenant resolve to the
    /// existing document; no second pipeline run is started.
    pub async fn ingest(
        &self,
        org_id: &str,
        title: &str,
        bytes: &[u8],
    ) -> Result<JobHandle, PipelineError> {
        let content_hash = hex::encode(Sha256::digest(bytes));

        if let Some(existing) = self.store.find_by_hash(org_id, &content_hash).await? {
            let state = match self.store.get_job(existing.id).await? {
                Some(job) => job.state,
                None => JobState::Queued,
            };
            info!(org_id, document_id = %existing.id, "duplicate upload deduplicated");
            return Ok(JobHandle {
                document_id: existing.id,
                state,
                deduplicated: true,
            });
        }

        self.objects.put_bytes(&content_hash, bytes).await?;

        let now = Utc::now().timestamp();
        let doc = Document {
            id: Uuid::new_v4(),
            org_id: org_id.to_string(),
            title: title.to_string(),
            content_hash: content_hash.clone(),
            status: DocumentStatus::Uploaded,
            created_at: now,
            processed_at: None,
        };
        self.store.insert_document(&doc).await?;

        // Re-read by hash: if two identical uploads raced past the dedup
        // check, the first insert won and this returns the canonical row
        let canonical = self
            .store
            .find_by_hash(org_id, &content_hash)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(doc.id))?;

        if canonical.id != doc.id {
            // Lost the insert race; the winner owns the job row, which may
            // already have advanced past Queued
            let state = match self.store.get_job(canonical.id).await? {
                Some(job) => job.state,
                None => JobState::Queued,
            };
            info!(org_id, document_id = %canonical.id, "duplicate upload deduplicated");
            return Ok(JobHandle {
                document_id: canonical.id,
                state,
                deduplicated: true,
            });
        }

        self.store
            .upsert_job(&ProcessingJob {
                document_id: doc.id,
                state: JobState::Queued,
                attempt_count: 0,
                last_error: None,
                updated_at: now,
            })
            .await?;

        info!(org_id, document_id = %doc.id, title, "document accepted");
        Ok(JobHandle {
            document_id: doc.id,
            state: JobState::Queued,
            deduplicated: false,
        })
    }

    /// Run the processing pipeline for one document.
    ///
    /// Holding the lease for the whole run guarantees at most one
    /// pipeline per document. A denied quota leaves the job `Queued` so a
    /// later attempt can pick it up; any other failure moves it to
    /// `Failed` with the error recorded.
    pub async fn process(&self, request: &IngestRequest) -> Result<ProcessOutcome, PipelineError> {
        let Some(_lease) = self.leases.acquire(request.document_id) else {
            info!(document_id = %request.document_id, "lease held, skipping");
            return Ok(ProcessOutcome::LeaseHeld);
        };

        let doc = self
            .store
            .get_document(&request.org_id, request.document_id)
            .await?
            .ok_or(PipelineError::DocumentNotFound(request.document_id))?;

        let job = self
            .store
            .get_job(doc.id)
            .await?
            .ok_or(PipelineError::DocumentNotFound(doc.id))?;

        if job.state == JobState::Succeeded {
            info!(document_id = %doc.id, "already processed, skipping");
            return Ok(ProcessOutcome::Completed);
        }

        if !self
            .limiter
            .check_and_reserve(&doc.org_id, Resource::Embedding, 1.0)
        {
            warn!(org_id = %doc.org_id, document_id = %doc.id, "embedding quota denied, job stays queued");
            return Err(PipelineError::QuotaExceeded {
                org_id: doc.org_id.clone(),
                resource: Resource::Embedding.as_str().to_string(),
            });
        }

        let attempt = job.attempt_count + 1;
        match self.run_pipeline(&doc, &request.type_hint, attempt).await {
            Ok(()) => Ok(ProcessOutcome::Completed),
            Err(e) => {
                self.fail_job(doc.id, attempt, &e).await?;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        doc: &Document,
        type_hint: &str,
        attempt: i64,
    ) -> Result<(), PipelineError> {
        self.advance(doc.id, JobState::Extracting, attempt).await?;
        self.store
            .set_status(doc.id, DocumentStatus::Processing, None)
            .await?;

        let bytes = self.objects.get_bytes(&doc.content_hash).await?;
        let extracted =
            extract_document(&bytes, type_hint, self.ocr.as_ref(), &self.config.extraction)
                .await?;

        self.advance(doc.id, JobState::Chunking, attempt).await?;
        let pieces = chunk_pages(
            &extracted.pages,
            self.config.chunking.max_chars,
            self.config.chunking.overlap_chars,
        );
        if pieces.is_empty() {
            return Err(PipelineError::EmptyDocument);
        }

        self.advance(doc.id, JobState::Embedding, attempt).await?;
        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embedding.batch_size) {
            let mut batch_vecs = self
                .embedder
                .embed(batch)
                .await
                .map_err(|e| PipelineError::EmbeddingProvider(e.to_string()))?;
            if batch_vecs.len() != batch.len() {
                return Err(PipelineError::EmbeddingProvider(format!(
                    "provider returned {} vectors for {} texts",
                    batch_vecs.len(),
                    batch.len()
                )));
            }
            embeddings.append(&mut batch_vecs);
        }

        self.advance(doc.id, JobState::Storing, attempt).await?;
        let chunks: Vec<DocumentChunk> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (piece, embedding))| DocumentChunk {
                id: Uuid::new_v4(),
                document_id: doc.id,
                chunk_no: i as i64,
                text: piece.text,
                embedding: Some(embedding),
                page: piece.page,
                metadata: serde_json::json!({ "extraction_method": extracted.method }),
            })
            .collect();
        let n_chunks = chunks.len();
        self.store.replace_chunks(doc.id, &chunks).await?;

        self.advance(doc.id, JobState::Succeeded, attempt).await?;
        self.store
            .set_status(doc.id, DocumentStatus::Completed, Some(Utc::now().timestamp()))
            .await?;

        info!(
            document_id = %doc.id,
            chunks = n_chunks,
            method = %extracted.method,
            "document processed"
        );
        Ok(())
    }

    /// Move the job to `next`, enforcing the transition table.
    async fn advance(&self, document_id: Uuid, next: JobState, attempt: i64) -> Result<(), PipelineError> {
        let job = self
            .store
            .get_job(document_id)
            .await?
            .ok_or(PipelineError::DocumentNotFound(document_id))?;

        if !job.state.can_transition(next) {
            return Err(PipelineError::Store(anyhow::anyhow!(
                "Invalid job transition {} -> {} for document {}",
                job.state.as_str(),
                next.as_str(),
                document_id
            )));
        }

        self.store
            .upsert_job(&ProcessingJob {
                document_id,
                state: next,
                attempt_count: attempt,
                last_error: None,
                updated_at: Utc::now().timestamp(),
            })
            .await?;
        Ok(())
    }

    async fn fail_job(
        &self,
        document_id: Uuid,
        attempt: i64,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        error!(document_id = %document_id, error = %err, "ingestion failed");
        self.store
            .upsert_job(&ProcessingJob {
                document_id,
                state: JobState::Failed,
                attempt_count: attempt,
                last_error: Some(err.to_string()),
                updated_at: Utc::now().timestamp(),
            })
            .await?;
        self.store
            .set_status(document_id, DocumentStatus::Failed, None)
            .await?;
        Ok(())
    }

    /// Operator-triggered retry of a failed job. Returns the request to
    /// enqueue; the type hint may differ from the original attempt.
    pub async fn retry_job(
        &self,
        org_id: &str,
        document_id: Uuid,
        type_hint: &str,
    ) -> Result<IngestRequest, PipelineError> {
        let doc = self
            .store
            .get_document(org_id, document_id)
            .await?
            .ok_or(PipelineError::DocumentNotFound(document_id))?;

        let job = self
            .store
            .get_job(doc.id)
            .await?
            .ok_or(PipelineError::DocumentNotFound(doc.id))?;

        if !job.state.can_transition(JobState::Queued) {
            return Err(PipelineError::Store(anyhow::anyhow!(
                "Job for document {} is {}, only failed jobs can be retried",
                document_id,
                job.state.as_str()
            )));
        }

        self.store
            .upsert_job(&ProcessingJob {
                document_id: doc.id,
                state: JobState::Queued,
                attempt_count: job.attempt_count,
                last_error: job.last_error,
                updated_at: Utc::now().timestamp(),
            })
            .await?;

        Ok(IngestRequest {
            org_id: org_id.to_string(),
            document_id: doc.id,
            type_hint: type_hint.to_string(),
        })
    }

    /// Current document and job state, for status polling.
    pub async fn job_status(
        &self,
        org_id: &str,
        document_id: Uuid,
    ) -> Result<(Document, Option<ProcessingJob>), PipelineError> {
        let doc = self
            .store
            .get_document(org_id, document_id)
            .await?
            .ok_or(PipelineError::DocumentNotFound(document_id))?;
        let job = self.store.get_job(document_id).await?;
        Ok((doc, job))
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }
}

/// Spawn the worker pool: `workers` tasks draining one shared queue.
///
/// Each worker pulls an [`IngestRequest`], runs the pipeline, and logs
/// failures; the join handles finish once the sender side is dropped.
pub fn spawn_workers(
    orchestrator: Arc<Orchestrator>,
    workers: usize,
    receiver: mpsc::Receiver<IngestRequest>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..workers)
        .map(|worker_id| {
            let orchestrator = orchestrator.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(request) = request else {
                        break;
                    };
                    if let Err(e) = orchestrator.process(&request).await {
                        warn!(
                            worker_id,
                            document_id = %request.document_id,
                            error = %e,
                            "processing failed"
                        );
                    }
                }
            })
        })
        .collect()
}
