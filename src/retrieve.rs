//! Tenant-scoped retrieval: vector search, MMR reranking, and context
//! expansion.
//!
//! The engine overfetches candidates, drops those below the similarity
//! threshold, reranks with maximal marginal relevance to avoid returning
//! near-duplicate chunks, and finally widens each surviving hit with its
//! neighboring chunks so the generator sees whole clauses instead of
//! fragments. Results are deterministic for a fixed corpus and query:
//! every tie in the pipeline breaks on ascending chunk number, then
//! chunk id.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::PipelineError;
use crate::models::{RetrievalResult, RetrievedChunk};
use crate::ratelimit::{Resource, UsageLimiter};
use crate::store::{ChunkStore, SearchHit};

pub struct RetrievalEngine {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    limiter: Arc<dyn UsageLimiter>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        limiter: Arc<dyn UsageLimiter>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            limiter,
            config,
        }
    }

    /// Retrieve the chunks most relevant to `query` within one tenant,
    /// optionally restricted to a set of documents. `k` overrides the
    /// configured `final_limit` when given.
    pub async fn retrieve(
        &self,
        org_id: &str,
        query: &str,
        k: Option<usize>,
        document_filter: Option<&[Uuid]>,
    ) -> Result<RetrievalResult, PipelineError> {
        if !self
            .limiter
            .check_and_reserve(org_id, Resource::Embedding, 1.0)
        {
            return Err(PipelineError::QuotaExceeded {
                org_id: org_id.to_string(),
                resource: Resource::Embedding.as_str().to_string(),
            });
        }

        let query_vec = self
            .embedder
            .embed_query(query)
            .await
            .map_err(|e| PipelineError::EmbeddingProvider(e.to_string()))?;

        let k = k.unwrap_or(self.config.final_limit).max(1);
        let overfetch = k * self.config.overfetch_factor;
        let candidates = self
            .store
            .search(org_id, &query_vec, overfetch, document_filter)
            .await?;

        // The store scopes by org in SQL; this catches a store bug before
        // a foreign chunk can leak into an answer
        for hit in &candidates {
            if hit.org_id != org_id {
                return Err(PipelineError::TenantIsolationViolation {
                    chunk_id: hit.chunk.id,
                    actual: hit.org_id.clone(),
                    requested: org_id.to_string(),
                });
            }
        }

        let candidates: Vec<SearchHit> = candidates
            .into_iter()
            .filter(|h| h.similarity >= self.config.similarity_threshold)
            .collect();

        let top_similarity = candidates
            .iter()
            .map(|h| h.similarity)
            .fold(0.0f32, f32::max);

        let selected = mmr_select(candidates, self.config.mmr_lambda, k);

        debug!(
            org_id,
            selected = selected.len(),
            top_similarity,
            "retrieval complete"
        );

        // Context expansion, deduplicated across hits: a neighbor already
        // shown (as a primary or in an earlier window) is not repeated
        let mut seen: HashSet<Uuid> = selected.iter().map(|h| h.chunk.id).collect();
        let mut hits = Vec::with_capacity(selected.len());
        for hit in selected {
            let neighbors = self
                .store
                .neighbors(
                    hit.chunk.document_id,
                    hit.chunk.chunk_no,
                    self.config.context_window,
                )
                .await?;
            let context = neighbors
                .into_iter()
                .filter(|c| c.id == hit.chunk.id || seen.insert(c.id))
                .collect();
            hits.push(RetrievedChunk {
                chunk: hit.chunk,
                score: hit.similarity,
                context,
            });
        }

        Ok(RetrievalResult {
            hits,
            top_similarity,
        })
    }
}

/// Maximal marginal relevance selection.
///
/// `candidates` must be pre-sorted by descending similarity with
/// deterministic tie-breaks; the strictly-greater comparison below then
/// keeps the earliest candidate on equal scores, which keeps the whole
/// selection deterministic.
fn mmr_select(candidates: Vec<SearchHit>, lambda: f32, k: usize) -> Vec<SearchHit> {
    if candidates.len() <= 1 || k == 0 {
        return candidates.into_iter().take(k).collect();
    }

    let mut remaining: Vec<SearchHit> = candidates;
    let mut selected: Vec<SearchHit> = Vec::with_capacity(k.min(remaining.len()));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, hit) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|s| match (&hit.chunk.embedding, &s.chunk.embedding) {
                    (Some(a), Some(b)) => cosine_similarity(a, b),
                    _ => 0.0,
                })
                .fold(0.0f32, f32::max);
            let score = lambda * hit.similarity - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        selected.push(remaining.remove(best_pos));
    }

    selected
}
