//! # crag
//!
//! A contract-document RAG core: ingestion pipeline, tenant-scoped vector
//! retrieval, and grounded answer generation with citations.
//!
//! Documents are uploaded per tenant, extracted (PDF, DOCX, plain text,
//! with OCR fallback for scans), chunked with overlap, embedded, and
//! stored in SQLite. Questions are answered by retrieving the most
//! relevant chunks for one tenant, reranking them for diversity, and
//! asking a tier-selected model to answer strictly from those excerpts,
//! with every claim traced back to a source chunk.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌──────────────────────────┐   ┌──────────┐
//! │ Upload │──▶│ Extract → Chunk → Embed  │──▶│  SQLite  │
//! │ (dedup)│   │  (job state machine)     │   │ + blobs  │
//! └────────┘   └──────────────────────────┘   └────┬─────┘
//!                                                  │
//!              ┌───────────────────────────────────┤
//!              ▼                                   ▼
//!        ┌───────────┐                      ┌────────────┐
//!        │ Retrieval │─── top chunks ──────▶│  Answer    │
//!        │ (MMR+ctx) │                      │ [S#] cites │
//!        └───────────┘                      └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! crag init                                  # create database
//! crag ingest contract.pdf --org acme        # upload and process
//! crag status <document-id> --org acme       # poll the job
//! crag ask "termination fee?" --org acme     # grounded answer
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`extract`] | Text extraction with OCR fallback |
//! | [`chunk`] | Recursive-separator chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Sign-bit ANN bucketing |
//! | [`store`] | Document/chunk/job persistence |
//! | [`ingest`] | Ingestion orchestrator and worker pool |
//! | [`retrieve`] | Tenant-scoped retrieval with MMR |
//! | [`answer`] | Grounded answer generation |
//! | [`ratelimit`] | Per-tenant usage limiting |
//! | [`lease`] | Per-document processing leases |
//! | [`objstore`] | Raw upload byte storage |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod lease;
pub mod migrate;
pub mod models;
pub mod objstore;
pub mod ratelimit;
pub mod retrieve;
pub mod store;
