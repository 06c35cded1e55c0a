use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Directory where raw uploaded bytes are kept.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("data/blobs")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_chars: 200,
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// A structured extraction yielding fewer characters per page than this
    /// is considered near-empty and falls through to OCR.
    #[serde(default = "default_min_chars_per_page")]
    pub min_chars_per_page: usize,
    /// Endpoint of the OCR sidecar; empty disables the OCR fallback.
    #[serde(default)]
    pub ocr_url: String,
    /// Ask the OCR sidecar to run image cleanup (deskew, denoise)
    /// before recognition.
    #[serde(default = "default_true")]
    pub ocr_cleanup: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_chars_per_page: 25,
            ocr_url: String::new(),
            ocr_cleanup: true,
            timeout_secs: 30,
        }
    }
}

fn default_min_chars_per_page() -> usize {
    25
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    /// Candidate pool is `final_limit * overfetch_factor` before reranking.
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    /// MMR trade-off: 1.0 is pure relevance, 0.0 pure diversity.
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    /// Neighbor chunks fetched on each side of a primary hit.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Candidates below this cosine similarity are dropped.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: 5,
            overfetch_factor: 2,
            mmr_lambda: 0.7,
            context_window: 2,
            similarity_threshold: 0.25,
        }
    }
}

fn default_final_limit() -> usize {
    5
}
fn default_overfetch_factor() -> usize {
    2
}
fn default_mmr_lambda() -> f32 {
    0.7
}
fn default_context_window() -> usize {
    2
}
fn default_similarity_threshold() -> f32 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for self-hosted providers (ollama).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embed_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_gen_provider")]
    pub provider: String,
    #[serde(default = "default_free_model")]
    pub free_model: String,
    #[serde(default = "default_pro_model")]
    pub pro_model: String,
    #[serde(default = "default_enterprise_model")]
    pub enterprise_model: String,
    /// Tried once when the tier's primary model fails.
    #[serde(default = "default_free_model")]
    pub fallback_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            free_model: default_free_model(),
            pro_model: default_pro_model(),
            enterprise_model: default_enterprise_model(),
            fallback_model: default_free_model(),
            max_tokens: 1024,
            timeout_secs: 60,
        }
    }
}

fn default_gen_provider() -> String {
    "disabled".to_string()
}
fn default_free_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}
fn default_pro_model() -> String {
    "claude-sonnet-4-0".to_string()
}
fn default_enterprise_model() -> String {
    "claude-opus-4-0".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_capacity")]
    pub embedding_capacity: f64,
    #[serde(default = "default_refill")]
    pub embedding_refill_per_sec: f64,
    #[serde(default = "default_capacity")]
    pub generation_capacity: f64,
    #[serde(default = "default_refill")]
    pub generation_refill_per_sec: f64,
    /// Shared ceiling across all tenants; 0 disables the global bucket.
    #[serde(default = "default_global_capacity")]
    pub global_capacity: f64,
    #[serde(default = "default_global_refill")]
    pub global_refill_per_sec: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            embedding_capacity: 120.0,
            embedding_refill_per_sec: 2.0,
            generation_capacity: 120.0,
            generation_refill_per_sec: 2.0,
            global_capacity: 600.0,
            global_refill_per_sec: 10.0,
        }
    }
}

fn default_capacity() -> f64 {
    120.0
}
fn default_refill() -> f64 {
    2.0
}
fn default_global_capacity() -> f64 {
    600.0
}
fn default_global_refill() -> f64 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Number of random hyperplanes; bucket space is 2^planes.
    #[serde(default = "default_planes")]
    pub planes: u32,
    /// Hamming radius explored at query time.
    #[serde(default = "default_probes")]
    pub probes: u32,
    /// Corpora smaller than this are scanned exactly.
    #[serde(default = "default_exact_below")]
    pub exact_below: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            planes: 8,
            probes: 1,
            exact_below: 10_000,
        }
    }
}

fn default_planes() -> u32 {
    8
}
fn default_probes() -> u32 {
    1
}
fn default_exact_below() -> i64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

fn default_workers() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.overfetch_factor < 1 {
        anyhow::bail!("retrieval.overfetch_factor must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.mmr_lambda) {
        anyhow::bail!("retrieval.mmr_lambda must be in [0.0, 1.0]");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" | "anthropic" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or anthropic.",
            other
        ),
    }

    if config.index.planes == 0 || config.index.planes > 24 {
        anyhow::bail!("index.planes must be in [1, 24]");
    }
    if config.ingestion.workers == 0 {
        anyhow::bail!("ingestion.workers must be >= 1");
    }

    Ok(())
}
