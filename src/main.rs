//! # crag CLI
//!
//! Command-line front end for the contract RAG core.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crag init` | Create the SQLite database and run schema migrations |
//! | `crag ingest <file>` | Upload a document and run the processing pipeline |
//! | `crag status <id>` | Show a document's status and job state |
//! | `crag retry <id>` | Re-queue a failed document, optionally with a new type hint |
//! | `crag ask "<question>"` | Answer a question from the tenant's documents |
//! | `crag delete <id>` | Delete a document and its chunks |
//!
//! ## Examples
//!
//! ```bash
//! crag init --config ./config/crag.toml
//! crag ingest msa.pdf --org acme --title "Master Services Agreement"
//! crag ask "What is the termination fee?" --org acme --tier pro
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crag::answer::{create_generation_provider, answer_query, AnswerGenerator};
use crag::config::{self, Config};
use crag::db;
use crag::embedding::create_provider;
use crag::extract::{DisabledOcr, HttpOcrProvider, OcrProvider};
use crag::index::SignIndex;
use crag::ingest::{spawn_workers, IngestRequest, Orchestrator};
use crag::lease::LeaseArena;
use crag::migrate;
use crag::models::ModelTier;
use crag::objstore::FsObjectStore;
use crag::ratelimit::TokenBucketLimiter;
use crag::retrieve::RetrievalEngine;
use crag::store::{ChunkStore, SqliteStore};

/// How long a crashed worker's lease blocks reprocessing.
const LEASE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser)]
#[command(
    name = "crag",
    about = "Contract-document RAG: ingest, retrieve, and answer with citations",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/crag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, jobs). Idempotent.
    Init,

    /// Upload a document and run the processing pipeline to completion.
    Ingest {
        /// Path to the document file.
        file: PathBuf,

        /// Tenant identifier.
        #[arg(long)]
        org: String,

        /// Document title; defaults to the file name.
        #[arg(long)]
        title: Option<String>,

        /// File type hint: `pdf`, `docx`, `txt`, or `md`. Defaults to the
        /// file extension.
        #[arg(long = "type")]
        type_hint: Option<String>,
    },

    /// Show a document's status and processing job state.
    Status {
        /// Document UUID.
        id: String,

        /// Tenant identifier.
        #[arg(long)]
        org: String,
    },

    /// Re-queue a failed document and process it again.
    Retry {
        /// Document UUID.
        id: String,

        /// Tenant identifier.
        #[arg(long)]
        org: String,

        /// File type hint for the new attempt; defaults to `pdf`.
        #[arg(long = "type", default_value = "pdf")]
        type_hint: String,
    },

    /// Answer a question from the tenant's processed documents.
    Ask {
        /// The question.
        query: String,

        /// Tenant identifier.
        #[arg(long)]
        org: String,

        /// Subscription tier: `free`, `pro`, or `enterprise`.
        #[arg(long, default_value = "free")]
        tier: String,

        /// Number of source chunks to answer from; defaults to the
        /// configured retrieval limit.
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict retrieval to these document UUIDs (repeatable).
        #[arg(long)]
        document: Vec<String>,
    },

    /// Delete a document and everything derived from it.
    Delete {
        /// Document UUID.
        id: String,

        /// Tenant identifier.
        #[arg(long)]
        org: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            org,
            title,
            type_hint,
        } => {
            let bytes = std::fs::read(&file)?;
            let title = title.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "untitled".to_string())
            });
            let type_hint = type_hint.unwrap_or_else(|| {
                file.extension()
                    .map(|e| e.to_string_lossy().to_lowercase())
                    .unwrap_or_else(|| "txt".to_string())
            });

            let orchestrator = build_orchestrator(&cfg).await?;
            let handle = orchestrator.ingest(&org, &title, &bytes).await?;

            if handle.deduplicated {
                println!(
                    "Already ingested as document {} (state: {})",
                    handle.document_id,
                    handle.state.as_str()
                );
                return Ok(());
            }

            let (tx, rx) = mpsc::channel::<IngestRequest>(16);
            let workers = spawn_workers(orchestrator.clone(), cfg.ingestion.workers, rx);
            tx.send(IngestRequest {
                org_id: org.clone(),
                document_id: handle.document_id,
                type_hint,
            })
            .await?;
            drop(tx);
            for worker in workers {
                let _ = worker.await;
            }

            let (doc, job) = orchestrator.job_status(&org, handle.document_id).await?;
            println!("Document {}: {}", doc.id, doc.status.as_str());
            if let Some(job) = job {
                if let Some(err) = job.last_error {
                    println!("Last error: {}", err);
                }
            }
        }
        Commands::Status { id, org } => {
            let document_id = Uuid::parse_str(&id)?;
            let orchestrator = build_orchestrator(&cfg).await?;
            let (doc, job) = orchestrator.job_status(&org, document_id).await?;
            println!("Document:  {}", doc.id);
            println!("Title:     {}", doc.title);
            println!("Status:    {}", doc.status.as_str());
            match job {
                Some(job) => {
                    println!("Job state: {} (attempt {})", job.state.as_str(), job.attempt_count);
                    if let Some(err) = job.last_error {
                        println!("Last error: {}", err);
                    }
                }
                None => println!("Job state: none"),
            }
        }
        Commands::Retry { id, org, type_hint } => {
            let document_id = Uuid::parse_str(&id)?;
            let orchestrator = build_orchestrator(&cfg).await?;
            let request = orchestrator.retry_job(&org, document_id, &type_hint).await?;
            orchestrator.process(&request).await?;
            let (doc, _) = orchestrator.job_status(&org, document_id).await?;
            println!("Document {}: {}", doc.id, doc.status.as_str());
        }
        Commands::Ask {
            query,
            org,
            tier,
            limit,
            document,
        } => {
            let tier = ModelTier::parse(&tier)
                .ok_or_else(|| anyhow::anyhow!("Unknown tier: {}", tier))?;
            let document_filter: Vec<Uuid> = document
                .iter()
                .map(|d| Uuid::parse_str(d))
                .collect::<Result<_, _>>()?;

            let pool = db::connect(&cfg).await?;
            let embedder = create_provider(&cfg.embedding)?;
            let index = SignIndex::new(&cfg.index, embedder.dims());
            let store: Arc<dyn ChunkStore> = Arc::new(SqliteStore::new(pool, index));
            let limiter = Arc::new(TokenBucketLimiter::new(cfg.limits.clone()));

            let engine = RetrievalEngine::new(
                store,
                embedder.into(),
                limiter.clone(),
                cfg.retrieval.clone(),
            );
            let generator = AnswerGenerator::new(
                create_generation_provider(&cfg.generation)?.into(),
                limiter,
                cfg.generation.clone(),
            );

            let filter = (!document_filter.is_empty()).then_some(document_filter.as_slice());
            let response =
                answer_query(&engine, &generator, &org, tier, &query, limit, filter).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Delete { id, org } => {
            let document_id = Uuid::parse_str(&id)?;
            let orchestrator = build_orchestrator(&cfg).await?;
            orchestrator.store().delete_document(&org, document_id).await?;
            println!("Deleted document {}", document_id);
        }
    }

    Ok(())
}

async fn build_orchestrator(cfg: &Config) -> anyhow::Result<Arc<Orchestrator>> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;

    let embedder = create_provider(&cfg.embedding)?;
    let index = SignIndex::new(&cfg.index, embedder.dims());
    let store = Arc::new(SqliteStore::new(pool, index));

    let ocr: Arc<dyn OcrProvider> = if cfg.extraction.ocr_url.is_empty() {
        Arc::new(DisabledOcr)
    } else {
        Arc::new(HttpOcrProvider::new(&cfg.extraction))
    };

    Ok(Arc::new(Orchestrator::new(
        store,
        embedder.into(),
        ocr,
        Arc::new(TokenBucketLimiter::new(cfg.limits.clone())),
        Arc::new(FsObjectStore::new(cfg.db.blob_dir.clone())?),
        LeaseArena::new(LEASE_TTL),
        cfg.clone(),
    )))
}
