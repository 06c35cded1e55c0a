//! End-to-end pipeline tests over the in-memory store.
//!
//! Providers are deterministic and in-process: embeddings are normalized
//! bag-of-words vectors, generation is scripted, OCR is mocked. Every run
//! of a test sees identical retrieval behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crag::answer::{answer_query, AnswerGenerator, GenerationProvider};
use crag::config::Config;
use crag::embedding::EmbeddingProvider;
use crag::error::PipelineError;
use crag::extract::OcrProvider;
use crag::ingest::{IngestRequest, Orchestrator, ProcessOutcome};
use crag::lease::LeaseArena;
use crag::models::{
    Document, DocumentChunk, DocumentStatus, JobState, ModelTier, ProcessingJob,
};
use crag::objstore::MemoryObjectStore;
use crag::ratelimit::{AllowAll, Resource, UsageLimiter};
use crag::retrieve::RetrievalEngine;
use crag::store::{ChunkStore, InMemoryStore, SearchHit};

const DIMS: usize = 32;

/// Normalized bag-of-words embedding; identical text always embeds
/// identically, and shared vocabulary yields positive cosine similarity.
struct HashEmbedder;

impl HashEmbedder {
    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '$')
        {
            if word.is_empty() {
                continue;
            }
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % DIMS as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Generation provider returning a fixed script regardless of input.
struct ScriptedGen(String);

#[async_trait]
impl GenerationProvider for ScriptedGen {
    async fn generate(&self, _: &str, _: &str, _: &str, _: u32) -> Result<String> {
        Ok(self.0.clone())
    }
}

struct MockOcr(Vec<String>);

#[async_trait]
impl OcrProvider for MockOcr {
    async fn recognize(&self, _bytes: &[u8]) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Store whose first dedup lookup misses, emulating a second upload of
/// identical bytes racing past the hash check before the first one's
/// insert lands. Everything else delegates.
struct FirstLookupMisses {
    inner: Arc<InMemoryStore>,
    missed: AtomicBool,
}

#[async_trait]
impl ChunkStore for FirstLookupMisses {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        self.inner.insert_document(doc).await
    }

    async fn find_by_hash(&self, org_id: &str, content_hash: &str) -> Result<Option<Document>> {
        if !self.missed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_hash(org_id, content_hash).await
    }

    async fn get_document(&self, org_id: &str, id: Uuid) -> Result<Option<Document>> {
        self.inner.get_document(org_id, id).await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        processed_at: Option<i64>,
    ) -> Result<()> {
        self.inner.set_status(id, status, processed_at).await
    }

    async fn replace_chunks(&self, document_id: Uuid, chunks: &[DocumentChunk]) -> Result<()> {
        self.inner.replace_chunks(document_id, chunks).await
    }

    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>> {
        self.inner.chunks_for_document(document_id).await
    }

    async fn neighbors(
        &self,
        document_id: Uuid,
        center: i64,
        window: usize,
    ) -> Result<Vec<DocumentChunk>> {
        self.inner.neighbors(document_id, center, window).await
    }

    async fn search(
        &self,
        org_id: &str,
        query: &[f32],
        limit: usize,
        document_filter: Option<&[Uuid]>,
    ) -> Result<Vec<SearchHit>> {
        self.inner.search(org_id, query, limit, document_filter).await
    }

    async fn delete_document(&self, org_id: &str, id: Uuid) -> Result<()> {
        self.inner.delete_document(org_id, id).await
    }

    async fn upsert_job(&self, job: &ProcessingJob) -> Result<()> {
        self.inner.upsert_job(job).await
    }

    async fn get_job(&self, document_id: Uuid) -> Result<Option<ProcessingJob>> {
        self.inner.get_job(document_id).await
    }
}

struct DenyLimiter;

impl UsageLimiter for DenyLimiter {
    fn check_and_reserve(&self, _: &str, _: Resource, _: f64) -> bool {
        false
    }
}

fn test_config(max_chars: usize, overlap_chars: usize) -> Config {
    let mut cfg: Config = toml::from_str("[db]\npath = \"unused.db\"\n").unwrap();
    cfg.chunking.max_chars = max_chars;
    cfg.chunking.overlap_chars = overlap_chars;
    cfg
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<InMemoryStore>,
    objects: Arc<MemoryObjectStore>,
    leases: LeaseArena,
    config: Config,
}

fn harness_with(
    config: Config,
    ocr: Arc<dyn OcrProvider>,
    limiter: Arc<dyn UsageLimiter>,
) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let leases = LeaseArena::new(Duration::from_secs(60));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(HashEmbedder),
        ocr,
        limiter,
        objects.clone(),
        leases.clone(),
        config.clone(),
    ));
    Harness {
        orchestrator,
        store,
        objects,
        leases,
        config,
    }
}

fn harness(config: Config) -> Harness {
    harness_with(config, Arc::new(MockOcr(vec![])), Arc::new(AllowAll))
}

fn engine(h: &Harness) -> RetrievalEngine {
    RetrievalEngine::new(
        h.store.clone(),
        Arc::new(HashEmbedder),
        Arc::new(AllowAll),
        h.config.retrieval.clone(),
    )
}

fn generator(script: &str, config: &Config) -> AnswerGenerator {
    AnswerGenerator::new(
        Arc::new(ScriptedGen(script.to_string())),
        Arc::new(AllowAll),
        config.generation.clone(),
    )
}

async fn ingest_and_process(h: &Harness, org: &str, title: &str, bytes: &[u8], hint: &str) {
    let handle = h.orchestrator.ingest(org, title, bytes).await.unwrap();
    assert!(!handle.deduplicated);
    let request = IngestRequest {
        org_id: org.to_string(),
        document_id: handle.document_id,
        type_hint: hint.to_string(),
    };
    h.orchestrator.process(&request).await.unwrap();
}

const CONTRACT: &str = "Section 1. Definitions. The Supplier and the Customer agree on the \
terms defined below for the duration of the engagement.\n\nSection 2. Termination. Either \
party may terminate with ninety days written notice. The early termination fee is $50,000, \
payable within thirty days.\n\nSection 3. Liability. Aggregate liability is capped at the \
fees paid in the preceding twelve months.";

#[tokio::test]
async fn happy_path_ingest_then_answer() {
    let h = harness(test_config(140, 20));
    ingest_and_process(&h, "org-a", "MSA", CONTRACT.as_bytes(), "txt").await;

    let handle = h.orchestrator.ingest("org-a", "MSA", CONTRACT.as_bytes()).await.unwrap();
    let (doc, job) = h
        .orchestrator
        .job_status("org-a", handle.document_id)
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert!(doc.processed_at.is_some());
    assert_eq!(job.unwrap().state, JobState::Succeeded);

    let gen = generator("The early termination fee is $50,000 [S1].", &h.config);
    let response = answer_query(
        &engine(&h),
        &gen,
        "org-a",
        ModelTier::Free,
        "What is the termination fee?",
        None,
        None,
    )
    .await
    .unwrap();

    assert!(response.answer_text.contains("$50,000"));
    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].document_id, handle.document_id);
    assert!(response.citations[0].quoted_text.contains("termination"));
    assert!(response.confidence > 0.0);
}

#[tokio::test]
async fn ocr_fallback_attributes_pages() {
    // Invalid UTF-8 defeats the structured extractor; the mock OCR
    // returns two pages with the fee on page 2
    let ocr = MockOcr(vec![
        "Page one covers definitions and the general scope of work.".to_string(),
        "Page two: the early termination fee is $50,000 for exits before year one.".to_string(),
    ]);
    let h = harness_with(test_config(80, 10), Arc::new(ocr), Arc::new(AllowAll));
    ingest_and_process(&h, "org-a", "scan", &[0xff, 0xfe, 0x00, 0x01], "txt").await;

    let gen = generator("The fee is $50,000 [S1].", &h.config);
    let response = answer_query(
        &engine(&h),
        &gen,
        "org-a",
        ModelTier::Free,
        "What is the early termination fee?",
        None,
        None,
    )
    .await
    .unwrap();

    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].page, Some(2));
}

#[tokio::test]
async fn quota_denial_leaves_job_queued() {
    let h = harness_with(
        test_config(1000, 200),
        Arc::new(MockOcr(vec![])),
        Arc::new(DenyLimiter),
    );
    let handle = h
        .orchestrator
        .ingest("org-a", "doc", CONTRACT.as_bytes())
        .await
        .unwrap();
    let request = IngestRequest {
        org_id: "org-a".to_string(),
        document_id: handle.document_id,
        type_hint: "txt".to_string(),
    };

    let err = h.orchestrator.process(&request).await.unwrap_err();
    assert!(matches!(err, PipelineError::QuotaExceeded { .. }));

    let (doc, job) = h
        .orchestrator
        .job_status("org-a", handle.document_id)
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Uploaded);
    assert_eq!(job.unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn duplicate_upload_deduplicates() {
    let h = harness(test_config(1000, 200));
    let first = h
        .orchestrator
        .ingest("org-a", "doc", CONTRACT.as_bytes())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .ingest("org-a", "doc again", CONTRACT.as_bytes())
        .await
        .unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.document_id, second.document_id);

    // Same bytes from a different tenant are a separate document
    let other = h
        .orchestrator
        .ingest("org-b", "doc", CONTRACT.as_bytes())
        .await
        .unwrap();
    assert!(!other.deduplicated);
    assert_ne!(other.document_id, first.document_id);
}

#[tokio::test]
async fn racing_duplicate_upload_does_not_reset_the_job() {
    let h = harness(test_config(1000, 200));
    let winner = h
        .orchestrator
        .ingest("org-a", "doc", CONTRACT.as_bytes())
        .await
        .unwrap();
    // The winner's worker is mid-pipeline
    h.store
        .upsert_job(&ProcessingJob {
            document_id: winner.document_id,
            state: JobState::Extracting,
            attempt_count: 1,
            last_error: None,
            updated_at: 0,
        })
        .await
        .unwrap();

    // The loser's dedup lookup ran before the winner's insert landed
    let racy = Orchestrator::new(
        Arc::new(FirstLookupMisses {
            inner: h.store.clone(),
            missed: AtomicBool::new(false),
        }),
        Arc::new(HashEmbedder),
        Arc::new(MockOcr(vec![])),
        Arc::new(AllowAll),
        h.objects.clone(),
        h.leases.clone(),
        h.config.clone(),
    );
    let loser = racy
        .ingest("org-a", "doc again", CONTRACT.as_bytes())
        .await
        .unwrap();

    assert!(loser.deduplicated);
    assert_eq!(loser.document_id, winner.document_id);
    assert_eq!(loser.state, JobState::Extracting);

    let job = h.store.get_job(winner.document_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Extracting);
    assert_eq!(job.attempt_count, 1);
}

#[tokio::test]
async fn tenant_isolation_in_retrieval() {
    let h = harness(test_config(140, 20));
    ingest_and_process(&h, "org-a", "a", CONTRACT.as_bytes(), "txt").await;
    ingest_and_process(
        &h,
        "org-b",
        "b",
        b"The early termination fee for this other tenant is $99,000.",
        "txt",
    )
    .await;

    let result = engine(&h)
        .retrieve("org-a", "early termination fee", None, None)
        .await
        .unwrap();
    assert!(!result.is_empty());

    let org_a_doc = h
        .orchestrator
        .ingest("org-a", "a", CONTRACT.as_bytes())
        .await
        .unwrap()
        .document_id;
    for hit in &result.hits {
        assert_eq!(hit.chunk.document_id, org_a_doc);
        assert!(!hit.chunk.text.contains("$99,000"));
    }
}

#[tokio::test]
async fn retrieval_is_deterministic() {
    let h = harness(test_config(100, 15));
    ingest_and_process(&h, "org-a", "a", CONTRACT.as_bytes(), "txt").await;

    let e = engine(&h);
    let first = e
        .retrieve("org-a", "termination notice", None, None)
        .await
        .unwrap();
    let second = e
        .retrieve("org-a", "termination notice", None, None)
        .await
        .unwrap();

    let ids_a: Vec<_> = first.hits.iter().map(|hit| hit.chunk.id).collect();
    let ids_b: Vec<_> = second.hits.iter().map(|hit| hit.chunk.id).collect();
    assert_eq!(ids_a, ids_b);
    for (a, b) in first.hits.iter().zip(second.hits.iter()) {
        assert_eq!(a.score, b.score);
    }
}

#[tokio::test]
async fn document_filter_and_k_restrict_retrieval() {
    let h = harness(test_config(140, 20));
    let nda_text = b"The non-disclosure term survives termination for five years.";
    ingest_and_process(&h, "org-a", "msa", CONTRACT.as_bytes(), "txt").await;
    ingest_and_process(&h, "org-a", "nda", nda_text, "txt").await;

    let nda_id = h
        .orchestrator
        .ingest("org-a", "nda", nda_text)
        .await
        .unwrap()
        .document_id;

    let filter = [nda_id];
    let result = engine(&h)
        .retrieve("org-a", "termination", None, Some(&filter))
        .await
        .unwrap();
    assert!(!result.is_empty());
    for hit in &result.hits {
        assert_eq!(hit.chunk.document_id, nda_id);
    }

    let result = engine(&h)
        .retrieve("org-a", "termination", Some(1), None)
        .await
        .unwrap();
    assert_eq!(result.hits.len(), 1);
}

#[tokio::test]
async fn chunk_numbering_is_dense_and_ordered() {
    let h = harness(test_config(100, 15));
    ingest_and_process(&h, "org-a", "a", CONTRACT.as_bytes(), "txt").await;

    let doc_id = h
        .orchestrator
        .ingest("org-a", "a", CONTRACT.as_bytes())
        .await
        .unwrap()
        .document_id;
    let chunks = h.store.chunks_for_document(doc_id).await.unwrap();
    assert!(chunks.len() > 1);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_no, i as i64);
        assert!(chunk.embedding.is_some());
    }
}

#[tokio::test]
async fn citations_only_reference_real_sources() {
    let h = harness(test_config(140, 20));
    ingest_and_process(&h, "org-a", "a", CONTRACT.as_bytes(), "txt").await;

    // The script cites one real source and one that does not exist
    let gen = generator("Fee is $50,000 [S1]. Bogus claim [S9].", &h.config);
    let response = answer_query(
        &engine(&h),
        &gen,
        "org-a",
        ModelTier::Pro,
        "What is the termination fee?",
        None,
        None,
    )
    .await
    .unwrap();

    assert_eq!(response.citations.len(), 1);
    assert!(response.confidence > 0.0 && response.confidence < 1.0);
}

#[tokio::test]
async fn empty_corpus_yields_no_information_answer() {
    let h = harness(test_config(1000, 200));
    let gen = generator("should never be called", &h.config);
    let response = answer_query(
        &engine(&h),
        &gen,
        "org-a",
        ModelTier::Free,
        "anything at all?",
        None,
        None,
    )
    .await
    .unwrap();
    assert!(response.citations.is_empty());
    assert_eq!(response.confidence, 0.0);
    assert_eq!(response.model_used, "none");
}

#[tokio::test]
async fn failed_extraction_records_error_and_retry_succeeds() {
    let h = harness(test_config(80, 10));
    let handle = h
        .orchestrator
        .ingest("org-a", "scan", &[0xff, 0xfe, 0x00])
        .await
        .unwrap();
    let request = IngestRequest {
        org_id: "org-a".to_string(),
        document_id: handle.document_id,
        type_hint: "txt".to_string(),
    };

    // No OCR configured: the corrupt upload fails terminally
    let err = h.orchestrator.process(&request).await.unwrap_err();
    assert!(matches!(err, PipelineError::Extraction(_)));
    let (doc, job) = h
        .orchestrator
        .job_status("org-a", handle.document_id)
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    let job = job.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.is_some());
    assert_eq!(job.attempt_count, 1);

    // Same store and blobs, now with a working OCR backend
    let retry_side = Orchestrator::new(
        h.store.clone(),
        Arc::new(HashEmbedder),
        Arc::new(MockOcr(vec!["Recovered text from the scanner.".to_string()])),
        Arc::new(AllowAll),
        h.objects.clone(),
        h.leases.clone(),
        h.config.clone(),
    );
    let request = retry_side
        .retry_job("org-a", handle.document_id, "txt")
        .await
        .unwrap();
    retry_side.process(&request).await.unwrap();

    let (doc, job) = retry_side
        .job_status("org-a", handle.document_id)
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    let job = job.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt_count, 2);
}

#[tokio::test]
async fn held_lease_makes_processing_a_noop() {
    let h = harness(test_config(1000, 200));
    let handle = h
        .orchestrator
        .ingest("org-a", "doc", CONTRACT.as_bytes())
        .await
        .unwrap();

    let _guard = h.leases.acquire(handle.document_id).unwrap();
    let request = IngestRequest {
        org_id: "org-a".to_string(),
        document_id: handle.document_id,
        type_hint: "txt".to_string(),
    };
    let outcome = h.orchestrator.process(&request).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::LeaseHeld);

    let (_, job) = h
        .orchestrator
        .job_status("org-a", handle.document_id)
        .await
        .unwrap();
    assert_eq!(job.unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn reprocessing_a_succeeded_document_is_a_noop() {
    let h = harness(test_config(1000, 200));
    ingest_and_process(&h, "org-a", "doc", CONTRACT.as_bytes(), "txt").await;

    let doc_id = h
        .orchestrator
        .ingest("org-a", "doc", CONTRACT.as_bytes())
        .await
        .unwrap()
        .document_id;
    let chunks_before = h.store.chunks_for_document(doc_id).await.unwrap();

    let request = IngestRequest {
        org_id: "org-a".to_string(),
        document_id: doc_id,
        type_hint: "txt".to_string(),
    };
    let outcome = h.orchestrator.process(&request).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Completed);

    let chunks_after = h.store.chunks_for_document(doc_id).await.unwrap();
    let ids_before: Vec<_> = chunks_before.iter().map(|c| c.id).collect();
    let ids_after: Vec<_> = chunks_after.iter().map(|c| c.id).collect();
    assert_eq!(ids_before, ids_after);
}
