//! Grounded answer generation with citations.
//!
//! Retrieved chunks are laid out as numbered source blocks (`[S1]`,
//! `[S2]`, ...) and the model is instructed to mark every claim with the
//! marker of the source backing it. Markers in the response are parsed
//! back into [`Citation`]s pointing at concrete chunks, and the response
//! confidence blends how many sources were actually cited with the best
//! raw retrieval similarity.
//!
//! Model choice follows the caller's subscription tier, with a single
//! fallback attempt on a cheaper model when the tier's primary fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::error::PipelineError;
use crate::models::{AnswerResponse, Citation, ModelTier, RetrievalResult};
use crate::ratelimit::{Resource, UsageLimiter};
use crate::retrieve::RetrievalEngine;

const ANSWER_SYSTEM_PROMPT: &str = "You are a contract analysis assistant. Answer the user's \
question using ONLY the numbered source excerpts provided. After every claim, add the marker of \
the source that supports it, e.g. [S1]. If the sources do not contain the answer, say so plainly \
instead of guessing.";

const NO_INFORMATION_ANSWER: &str =
    "I could not find anything in your documents that answers this question.";

/// Weight of citation coverage vs. retrieval similarity in confidence.
const COVERAGE_WEIGHT: f32 = 0.6;
const SIMILARITY_WEIGHT: f32 = 0.4;

/// Maximum characters of chunk text quoted into a citation.
const QUOTE_MAX_CHARS: usize = 200;

/// Text-completion backend for answer generation.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String>;
}

pub fn create_generation_provider(
    config: &GenerationConfig,
) -> Result<Box<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGeneration)),
        "anthropic" => Ok(Box::new(AnthropicGeneration::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Generation provider that always errors; used when unconfigured.
pub struct DisabledGeneration;

#[async_trait]
impl GenerationProvider for DisabledGeneration {
    async fn generate(&self, _: &str, _: &str, _: &str, _: u32) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

/// Anthropic Messages API provider. Requires `ANTHROPIC_API_KEY`.
///
/// Retries follow the same shape as the embedding providers: 429 and 5xx
/// back off exponentially, other 4xx fail fast.
pub struct AnthropicGeneration {
    timeout_secs: u64,
    max_retries: u32,
}

impl AnthropicGeneration {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        if std::env::var("ANTHROPIC_API_KEY").is_err() {
            bail!("ANTHROPIC_API_KEY environment variable not set");
        }
        Ok(Self {
            timeout_secs: config.timeout_secs,
            max_retries: 3,
        })
    }
}

#[async_trait]
impl GenerationProvider for AnthropicGeneration {
    async fn generate(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.anthropic.com/v1/messages")
                .header("x-api-key", &api_key)
                .header("anthropic-version", "2023-06-01")
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_messages_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Anthropic API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Anthropic API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Generation failed after retries")))
    }
}

fn parse_messages_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid response: missing content array"))?;

    let mut out = String::new();
    for block in content {
        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
            out.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or(""));
        }
    }
    if out.is_empty() {
        bail!("Invalid response: no text content");
    }
    Ok(out)
}

pub struct AnswerGenerator {
    provider: Arc<dyn GenerationProvider>,
    limiter: Arc<dyn UsageLimiter>,
    config: GenerationConfig,
}

impl AnswerGenerator {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        limiter: Arc<dyn UsageLimiter>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            config,
        }
    }

    fn model_for_tier(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Free => &self.config.free_model,
            ModelTier::Pro => &self.config.pro_model,
            ModelTier::Enterprise => &self.config.enterprise_model,
        }
    }

    /// Generate a grounded answer from already-retrieved context.
    ///
    /// Empty retrieval short-circuits to a fixed no-information answer
    /// without touching quota or the model.
    pub async fn answer(
        &self,
        org_id: &str,
        tier: ModelTier,
        query: &str,
        retrieval: &RetrievalResult,
    ) -> Result<AnswerResponse, PipelineError> {
        let started = Instant::now();

        if retrieval.is_empty() {
            return Ok(AnswerResponse {
                answer_text: NO_INFORMATION_ANSWER.to_string(),
                citations: Vec::new(),
                confidence: 0.0,
                model_used: "none".to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        if !self
            .limiter
            .check_and_reserve(org_id, Resource::Generation, 1.0)
        {
            return Err(PipelineError::QuotaExceeded {
                org_id: org_id.to_string(),
                resource: Resource::Generation.as_str().to_string(),
            });
        }

        let prompt = build_prompt(query, retrieval);
        let primary = self.model_for_tier(tier).to_string();

        let (answer_text, model_used) = match self
            .provider
            .generate(&primary, ANSWER_SYSTEM_PROMPT, &prompt, self.config.max_tokens)
            .await
        {
            Ok(text) => (text, primary),
            Err(primary_err) => {
                let fallback = &self.config.fallback_model;
                if fallback == &primary {
                    return Err(PipelineError::GenerationProvider(primary_err.to_string()));
                }
                warn!(
                    model = %primary,
                    fallback = %fallback,
                    error = %primary_err,
                    "primary model failed, trying fallback"
                );
                let text = self
                    .provider
                    .generate(fallback, ANSWER_SYSTEM_PROMPT, &prompt, self.config.max_tokens)
                    .await
                    .map_err(|e| PipelineError::GenerationProvider(e.to_string()))?;
                (text, fallback.clone())
            }
        };

        let cited = parse_citation_markers(&answer_text, retrieval.hits.len());
        let mut citations: Vec<Citation> = cited
            .iter()
            .map(|&idx| {
                let hit = &retrieval.hits[idx - 1];
                Citation {
                    document_id: hit.chunk.document_id,
                    page: hit.chunk.page,
                    chunk_id: hit.chunk.id,
                    quoted_text: truncate_chars(&hit.chunk.text, QUOTE_MAX_CHARS),
                    relevance_score: hit.score,
                }
            })
            .collect();
        // Most relevant citation first, regardless of marker numbering
        citations.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let coverage = cited.len() as f32 / retrieval.hits.len() as f32;
        let confidence = (COVERAGE_WEIGHT * coverage
            + SIMILARITY_WEIGHT * retrieval.top_similarity.clamp(0.0, 1.0))
        .clamp(0.0, 1.0);

        info!(
            org_id,
            model = %model_used,
            citations = citations.len(),
            confidence,
            "answer generated"
        );

        Ok(AnswerResponse {
            answer_text,
            citations,
            confidence,
            model_used,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Retrieve then generate; the returned latency covers both stages.
///
/// `k` caps the number of primary sources (defaults to the configured
/// retrieval limit); `document_filter` restricts retrieval to the given
/// documents.
pub async fn answer_query(
    engine: &RetrievalEngine,
    generator: &AnswerGenerator,
    org_id: &str,
    tier: ModelTier,
    query: &str,
    k: Option<usize>,
    document_filter: Option<&[Uuid]>,
) -> Result<AnswerResponse, PipelineError> {
    let started = Instant::now();
    let retrieval = engine.retrieve(org_id, query, k, document_filter).await?;
    let mut response = generator.answer(org_id, tier, query, &retrieval).await?;
    response.latency_ms = started.elapsed().as_millis() as u64;
    Ok(response)
}

/// Lay the hits out as numbered source blocks followed by the question.
fn build_prompt(query: &str, retrieval: &RetrievalResult) -> String {
    let mut prompt = String::from("Sources:\n\n");
    for (i, hit) in retrieval.hits.iter().enumerate() {
        let page = hit
            .chunk
            .page
            .map(|p| format!(", page {}", p))
            .unwrap_or_default();
        prompt.push_str(&format!(
            "[S{}] (document {}{})\n",
            i + 1,
            hit.chunk.document_id,
            page
        ));
        for chunk in &hit.context {
            prompt.push_str(&chunk.text);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str("Question: ");
    prompt.push_str(query);
    prompt
}

/// Extract `[S<n>]` markers from the answer, keeping only indices that
/// refer to a real source. Returns sorted, deduplicated 1-based indices.
fn parse_citation_markers(text: &str, n_sources: usize) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i + 3 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'S' {
            let mut j = i + 2;
            let mut value: usize = 0;
            let mut digits = 0;
            while j < bytes.len() && bytes[j].is_ascii_digit() && digits < 4 {
                value = value * 10 + (bytes[j] - b'0') as usize;
                j += 1;
                digits += 1;
            }
            if digits > 0 && j < bytes.len() && bytes[j] == b']' {
                if value >= 1 && value <= n_sources {
                    found.push(value);
                }
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    found.sort_unstable();
    found.dedup();
    found
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentChunk, RetrievedChunk};
    use crate::ratelimit::AllowAll;
    use std::sync::Mutex;

    fn retrieval(n: usize, top_similarity: f32) -> RetrievalResult {
        let hits = (0..n)
            .map(|i| {
                let chunk = DocumentChunk {
                    id: Uuid::new_v4(),
                    document_id: Uuid::nil(),
                    chunk_no: i as i64,
                    text: format!("Source text number {}.", i),
                    embedding: None,
                    page: Some(i as i64 + 1),
                    metadata: serde_json::Value::Null,
                };
                RetrievedChunk {
                    context: vec![chunk.clone()],
                    chunk,
                    score: 0.8,
                }
            })
            .collect();
        RetrievalResult {
            hits,
            top_similarity,
        }
    }

    struct ScriptedProvider {
        /// Error text per model name; missing means success.
        failing: Vec<String>,
        response: String,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        async fn generate(&self, model: &str, _: &str, _: &str, _: u32) -> Result<String> {
            self.calls.lock().unwrap().push(model.to_string());
            if self.failing.iter().any(|m| m == model) {
                bail!("model {} is down", model)
            }
            Ok(self.response.clone())
        }
    }

    fn generator(provider: ScriptedProvider) -> AnswerGenerator {
        AnswerGenerator::new(
            Arc::new(provider),
            Arc::new(AllowAll),
            GenerationConfig {
                provider: "scripted".to_string(),
                free_model: "small".to_string(),
                pro_model: "medium".to_string(),
                enterprise_model: "large".to_string(),
                fallback_model: "small".to_string(),
                max_tokens: 256,
                timeout_secs: 5,
            },
        )
    }

    #[test]
    fn markers_are_parsed_and_bounded() {
        assert_eq!(parse_citation_markers("Fee is $50,000 [S1]. See [S2].", 3), vec![1, 2]);
        assert_eq!(parse_citation_markers("[S1] and [S1] again", 2), vec![1]);
        // Out-of-range and malformed markers are ignored
        assert_eq!(parse_citation_markers("[S9] [S] [Sx] [S1", 2), Vec::<usize>::new());
        assert_eq!(parse_citation_markers("no markers here", 2), Vec::<usize>::new());
    }

    #[tokio::test]
    async fn empty_retrieval_short_circuits() {
        let provider = ScriptedProvider {
            failing: vec![],
            response: "should not be called".to_string(),
            calls: Mutex::new(Vec::new()),
        };
        let gen = generator(provider);
        let result = RetrievalResult {
            hits: vec![],
            top_similarity: 0.0,
        };
        let resp = gen
            .answer("org-a", ModelTier::Free, "anything?", &result)
            .await
            .unwrap();
        assert_eq!(resp.answer_text, NO_INFORMATION_ANSWER);
        assert_eq!(resp.confidence, 0.0);
        assert_eq!(resp.model_used, "none");
        assert!(resp.citations.is_empty());
    }

    #[tokio::test]
    async fn tier_routes_to_its_model() {
        let provider = ScriptedProvider {
            failing: vec![],
            response: "Answer [S1]".to_string(),
            calls: Mutex::new(Vec::new()),
        };
        let gen = generator(provider);
        let result = retrieval(2, 0.9);
        let resp = gen
            .answer("org-a", ModelTier::Enterprise, "q", &result)
            .await
            .unwrap();
        assert_eq!(resp.model_used, "large");
        assert_eq!(resp.citations.len(), 1);
        assert_eq!(resp.citations[0].page, Some(1));
    }

    #[tokio::test]
    async fn citations_are_ordered_by_relevance() {
        let provider = ScriptedProvider {
            failing: vec![],
            response: "First [S1], second [S2], third [S3].".to_string(),
            calls: Mutex::new(Vec::new()),
        };
        let gen = generator(provider);
        let mut result = retrieval(3, 0.9);
        result.hits[0].score = 0.5;
        result.hits[1].score = 0.9;
        result.hits[2].score = 0.7;
        let resp = gen
            .answer("org-a", ModelTier::Free, "q", &result)
            .await
            .unwrap();
        let scores: Vec<f32> = resp.citations.iter().map(|c| c.relevance_score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.5]);
        assert_eq!(resp.citations[0].page, Some(2));
    }

    #[tokio::test]
    async fn primary_failure_falls_back_once() {
        let provider = ScriptedProvider {
            failing: vec!["medium".to_string()],
            response: "Fallback answer [S1] [S2]".to_string(),
            calls: Mutex::new(Vec::new()),
        };
        let gen = generator(provider);
        let result = retrieval(2, 0.5);
        let resp = gen
            .answer("org-a", ModelTier::Pro, "q", &result)
            .await
            .unwrap();
        assert_eq!(resp.model_used, "small");
        // Full coverage: 0.6 * 1.0 + 0.4 * 0.5
        assert!((resp.confidence - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn fallback_failure_is_an_error() {
        let provider = ScriptedProvider {
            failing: vec!["medium".to_string(), "small".to_string()],
            response: String::new(),
            calls: Mutex::new(Vec::new()),
        };
        let gen = generator(provider);
        let result = retrieval(1, 0.5);
        let err = gen
            .answer("org-a", ModelTier::Pro, "q", &result)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GenerationProvider(_)));
    }

    #[tokio::test]
    async fn quota_denial_is_surfaced() {
        struct Deny;
        impl crate::ratelimit::UsageLimiter for Deny {
            fn check_and_reserve(&self, _: &str, _: Resource, _: f64) -> bool {
                false
            }
        }
        let provider = ScriptedProvider {
            failing: vec![],
            response: "x".to_string(),
            calls: Mutex::new(Vec::new()),
        };
        let gen = AnswerGenerator::new(
            Arc::new(provider),
            Arc::new(Deny),
            GenerationConfig::default(),
        );
        let result = retrieval(1, 0.5);
        let err = gen
            .answer("org-a", ModelTier::Free, "q", &result)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QuotaExceeded { .. }));
    }
}
