//! SQLite-backed [`ChunkStore`].
//!
//! Embeddings are stored as little-endian f32 BLOBs next to the chunk
//! text. Vector search fetches candidates (bucket-filtered for large
//! corpora, full tenant scan for small ones) and ranks them by cosine
//! similarity in process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use uuid::Uuid;

use super::{validate_dense, ChunkStore, SearchHit};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::index::SignIndex;
use crate::models::{Document, DocumentChunk, DocumentStatus, JobState, ProcessingJob};

pub struct SqliteStore {
    pool: SqlitePool,
    index: SignIndex,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, index: SignIndex) -> Self {
        Self { pool, index }
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    Ok(Document {
        id: Uuid::parse_str(&id).with_context(|| format!("Bad document id: {}", id))?,
        org_id: row.get("org_id"),
        title: row.get("title"),
        content_hash: row.get("content_hash"),
        status: DocumentStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown document status: {}", status))?,
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
    })
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentChunk> {
    let id: String = row.get("id");
    let document_id: String = row.get("document_id");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let metadata_json: String = row.get("metadata_json");
    Ok(DocumentChunk {
        id: Uuid::parse_str(&id).with_context(|| format!("Bad chunk id: {}", id))?,
        document_id: Uuid::parse_str(&document_id)
            .with_context(|| format!("Bad document id: {}", document_id))?,
        chunk_no: row.get("chunk_no"),
        text: row.get("text"),
        embedding: embedding.map(|b| blob_to_vec(&b)),
        page: row.get("page"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        // ON CONFLICT keeps the first row when two uploads of the same
        // bytes race; callers re-read by hash to get the canonical row
        sqlx::query(
            r#"
            INSERT INTO documents (id, org_id, title, content_hash, status, created_at, processed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(org_id, content_hash) DO NOTHING
            "#,
        )
        .bind(doc.id.to_string())
        .bind(&doc.org_id)
        .bind(&doc.title)
        .bind(&doc.content_hash)
        .bind(doc.status.as_str())
        .bind(doc.created_at)
        .bind(doc.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_hash(&self, org_id: &str, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE org_id = ? AND content_hash = ?",
        )
        .bind(org_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn get_document(&self, org_id: &str, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ? AND org_id = ?")
            .bind(id.to_string())
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        processed_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?, processed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(processed_at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_chunks(&self, document_id: Uuid, chunks: &[DocumentChunk]) -> Result<()> {
        validate_dense(document_id, chunks)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id.to_string())
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = chunk.embedding.as_ref().map(|e| vec_to_blob(e));
            let bucket = chunk.embedding.as_ref().map(|e| self.index.bucket(e));
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_no, text, embedding, bucket, page, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(chunk.id.to_string())
            .bind(chunk.document_id.to_string())
            .bind(chunk.chunk_no)
            .bind(&chunk.text)
            .bind(blob)
            .bind(bucket)
            .bind(chunk.page)
            .bind(chunk.metadata.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_no ASC")
            .bind(document_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn neighbors(
        &self,
        document_id: Uuid,
        center: i64,
        window: usize,
    ) -> Result<Vec<DocumentChunk>> {
        let lo = center - window as i64;
        let hi = center + window as i64;
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ? AND chunk_no BETWEEN ? AND ? ORDER BY chunk_no ASC",
        )
        .bind(document_id.to_string())
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn search(
        &self,
        org_id: &str,
        query: &[f32],
        limit: usize,
        document_filter: Option<&[Uuid]>,
    ) -> Result<Vec<SearchHit>> {
        let corpus: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.org_id = ? AND c.embedding IS NOT NULL
            "#,
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        let mut sql = String::from(
            r#"
            SELECT c.id, c.document_id, c.chunk_no, c.text, c.embedding, c.page,
                   c.metadata_json, d.org_id AS org_id
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.org_id = ? AND c.embedding IS NOT NULL
            "#,
        );
        let doc_ids: &[Uuid] = document_filter.unwrap_or(&[]);
        if !doc_ids.is_empty() {
            let placeholders = vec!["?"; doc_ids.len()].join(", ");
            sql.push_str(&format!(" AND c.document_id IN ({})", placeholders));
        }

        // Small corpora are scanned exactly; larger ones only look at
        // buckets near the query's own
        let buckets = if corpus >= self.index.exact_below {
            let probe = self.index.probe_buckets(query);
            let placeholders = vec!["?"; probe.len()].join(", ");
            sql.push_str(&format!(" AND c.bucket IN ({})", placeholders));
            probe
        } else {
            Vec::new()
        };

        let mut q = sqlx::query(&sql).bind(org_id);
        for doc_id in doc_ids {
            q = q.bind(doc_id.to_string());
        }
        for bucket in &buckets {
            q = q.bind(bucket);
        }

        let rows = q.fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            let similarity = match &chunk.embedding {
                Some(e) => cosine_similarity(query, e),
                None => continue,
            };
            let hit_org: String = row.get("org_id");
            hits.push(SearchHit {
                chunk,
                org_id: hit_org,
                similarity,
            });
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
        // Chunks and jobs go with it via ON DELETE CASCADE
        sqlx::query("DELETE FROM documents WHERE id = ? AND org_id = ?")
            .bind(id.to_string())
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_job(&self, job: &ProcessingJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (document_id, state, attempt_count, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                state = excluded.state,
                attempt_count = excluded.attempt_count,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job.document_id.to_string())
        .bind(job.state.as_str())
        .bind(job.attempt_count)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, document_id: Uuid) -> Result<Option<ProcessingJob>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE document_id = ?")
            .bind(document_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let doc_id: String = row.get("document_id");
            let state: String = row.get("state");
            Ok(ProcessingJob {
                document_id: Uuid::parse_str(&doc_id)
                    .with_context(|| format!("Bad document id: {}", doc_id))?,
                state: JobState::parse(&state)
                    .ok_or_else(|| anyhow::anyhow!("Unknown job state: {}", state))?,
                attempt_count: row.get("attempt_count"),
                last_error: row.get("last_error"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }
}
