//! PostgreSQL + pgvector chunk store with an HNSW cosine index.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::Row;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;

use super::{ChunkStore, StoreStats, sort_results, validate_chunk, validate_dimension};
use crate::error::StoreError;
use crate::models::{Chunk, ChunkMetadata, MetadataFilter, PostgresConfig, RetrievalResult};

/// Upper bound for `hnsw.ef_search` when widening for filtered queries.
const MAX_EF_SEARCH: usize = 1000;

/// Columns with their own SQL column; everything else lives in `extra`.
const COLUMN_FILTERS: &[&str] = &["document_id", "document_title", "language", "section_title"];

const SELECT_COLUMNS: &str = "id::text AS id, document_id, ordinal, content, embedding, \
     document_title, page_number, section_title, language, extra, needs_embedding";

pub struct PgVectorStore {
    pool: PgPool,
    schema: String,
    table: String,
    table_name: String,
    dimension: usize,
    ef_search: usize,
}

impl std::fmt::Debug for PgVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgVectorStore")
            .field("table", &self.table_name)
            .field("dimension", &self.dimension)
            .finish()
    }
}

fn pg_err(e: sqlx::Error) -> StoreError {
    StoreError::PostgresError(e.to_string())
}

impl PgVectorStore {
    pub async fn connect(config: &PostgresConfig, dimension: usize) -> Result<Self, StoreError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StoreError::ConnectionError("no database url configured".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .acquire_timeout(Duration::from_secs(config.pool_acquire_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        Ok(Self {
            pool,
            schema: config.schema.clone(),
            table: config.table.clone(),
            table_name: config.qualified_table_name(),
            dimension,
            ef_search: config.ef_search as usize,
        })
    }

    async fn check_pgvector_extension(&self) -> Result<(), StoreError> {
        let result: Option<(String,)> =
            sqlx::query_as("SELECT extname FROM pg_extension WHERE extname = 'vector'")
                .fetch_optional(&self.pool)
                .await
                .map_err(pg_err)?;

        if result.is_none() {
            return Err(StoreError::PgVectorExtensionError(
                "pgvector extension is not installed. Run: CREATE EXTENSION vector;".to_string(),
            ));
        }

        Ok(())
    }

    /// Width of the existing `embedding` column, if the table exists.
    async fn existing_dimension(&self) -> Result<Option<usize>, StoreError> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT a.atttypmod
            FROM pg_attribute a
            JOIN pg_class c ON a.attrelid = c.oid
            JOIN pg_namespace n ON c.relnamespace = n.oid
            WHERE n.nspname = $1 AND c.relname = $2 AND a.attname = 'embedding'
            "#,
        )
        .bind(&self.schema)
        .bind(&self.table)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(|(typmod,)| typmod as usize))
    }

    fn ef_search_for(&self, top_k: usize, filtered: bool) -> usize {
        // Post-filtering discards candidates, so look further when filters apply
        let wanted = if filtered { top_k * 10 } else { top_k };
        wanted.max(self.ef_search).min(MAX_EF_SEARCH)
    }
}

async fn fetch_rows(
    conn: &mut PgConnection,
    sql: &str,
    embedding: &Vector,
    binds: &[String],
) -> Result<Vec<PgRow>, sqlx::Error> {
    let mut query = sqlx::query(sql).bind(embedding);
    for value in binds {
        query = query.bind(value);
    }
    query.fetch_all(conn).await
}

/// A filtered approximate search that returned fewer than `top_k` rows may
/// have lost matches to post-filtering.
fn needs_exact_scan(filtered: bool, returned: usize, top_k: usize) -> bool {
    filtered && returned < top_k
}

/// Build the `AND ...` clause for metadata filters. Bind values follow `$1`.
fn filter_clause(filters: &MetadataFilter) -> (String, Vec<String>) {
    let mut parts = Vec::new();
    let mut binds = Vec::new();

    for (key, value) in filters.iter() {
        let n = binds.len() + 2;
        if COLUMN_FILTERS.contains(&key.as_str()) {
            parts.push(format!("{} = ${}", key, n));
            binds.push(value.clone());
        } else if key == "page_number" {
            parts.push(format!("page_number::text = ${}", n));
            binds.push(value.clone());
        } else {
            parts.push(format!("extra ->> ${} = ${}", n, n + 1));
            binds.push(key.clone());
            binds.push(value.clone());
        }
    }

    let clause = parts
        .iter()
        .map(|p| format!(" AND {}", p))
        .collect::<String>();
    (clause, binds)
}

fn row_to_chunk(row: &PgRow) -> Result<Chunk, sqlx::Error> {
    let embedding: Option<Vector> = row.try_get("embedding")?;
    let extra: Option<Json<BTreeMap<String, String>>> = row.try_get("extra")?;
    let ordinal: i32 = row.try_get("ordinal")?;
    let page_number: Option<i32> = row.try_get("page_number")?;

    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        ordinal: ordinal as u32,
        text: row.try_get("content")?,
        embedding: embedding.map(|v| v.to_vec()),
        metadata: ChunkMetadata {
            document_title: row.try_get("document_title")?,
            page_number: page_number.map(|p| p as u32),
            section_title: row.try_get("section_title")?,
            language: row.try_get("language")?,
            extra: extra.map(|j| j.0).unwrap_or_default(),
        },
        needs_embedding: row.try_get("needs_embedding")?,
    })
}

#[async_trait]
impl ChunkStore for PgVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend_name(&self) -> &'static str {
        "pgvector"
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| true)
            .map_err(|e| StoreError::ConnectionError(e.to_string()))
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.check_pgvector_extension().await?;

        if let Some(existing) = self.existing_dimension().await? {
            validate_dimension(self.dimension, existing)?;
            return Ok(());
        }

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    document_id TEXT NOT NULL,
                    ordinal INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    embedding vector({}),
                    document_title TEXT NOT NULL,
                    page_number INTEGER,
                    section_title TEXT,
                    language TEXT NOT NULL,
                    extra JSONB NOT NULL DEFAULT '{{}}',
                    needs_embedding BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#,
                self.table_name, self.dimension
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_embedding_idx ON {} USING hnsw (embedding vector_cosine_ops)",
                self.table, self.table_name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_document_id_idx ON {} (document_id, ordinal)",
                self.table, self.table_name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_pending_idx ON {} (needs_embedding) WHERE needs_embedding",
                self.table, self.table_name
            ),
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::CollectionError(e.to_string()))?;
        }

        tracing::info!(table = %self.table_name, dimension = self.dimension, "created chunk table");
        Ok(())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(), StoreError> {
        for chunk in &chunks {
            validate_chunk(chunk, document_id, self.dimension)?;
        }

        let insert = format!(
            r#"
            INSERT INTO {} (id, document_id, ordinal, content, embedding, document_title,
                            page_number, section_title, language, extra, needs_embedding)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            self.table_name
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::UpsertError(e.to_string()))?;

        sqlx::query(&format!("DELETE FROM {} WHERE document_id = $1", self.table_name))
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::DeleteError(e.to_string()))?;

        for chunk in chunks {
            let id = uuid::Uuid::parse_str(&chunk.id)
                .map_err(|e| StoreError::InvalidChunk(format!("invalid UUID: {}", e)))?;
            let embedding = chunk.embedding.map(Vector::from);

            sqlx::query(&insert)
                .bind(id)
                .bind(&chunk.document_id)
                .bind(chunk.ordinal as i32)
                .bind(&chunk.text)
                .bind(embedding)
                .bind(&chunk.metadata.document_title)
                .bind(chunk.metadata.page_number.map(|p| p as i32))
                .bind(&chunk.metadata.section_title)
                .bind(&chunk.metadata.language)
                .bind(Json(&chunk.metadata.extra))
                .bind(chunk.needs_embedding)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::UpsertError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::UpsertError(e.to_string()))?;

        Ok(())
    }

    async fn update_embedding(
        &self,
        chunk_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), StoreError> {
        validate_dimension(self.dimension, embedding.len())?;
        let id = uuid::Uuid::parse_str(chunk_id)
            .map_err(|_| StoreError::NotFound(chunk_id.to_string()))?;

        let query = format!(
            "UPDATE {} SET embedding = $2, needs_embedding = FALSE WHERE id = $1",
            self.table_name
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(Vector::from(embedding))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::UpsertError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(chunk_id.to_string()));
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        validate_dimension(self.dimension, query.len())?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let (where_filters, binds) = filter_clause(filters);
        let sql = format!(
            r#"
            SELECT {}, 1 - (embedding <=> $1) AS score
            FROM {}
            WHERE embedding IS NOT NULL AND NOT needs_embedding{}
            ORDER BY embedding <=> $1
            LIMIT {}
            "#,
            SELECT_COLUMNS, self.table_name, where_filters, top_k
        );

        let search_err = |e: sqlx::Error| StoreError::SearchError(e.to_string());
        let mut tx = self.pool.begin().await.map_err(search_err)?;

        // SET LOCAL does not take bind parameters; the value is an integer we computed
        let ef = self.ef_search_for(top_k, !filters.is_empty());
        sqlx::query(&format!("SET LOCAL hnsw.ef_search = {}", ef))
            .execute(&mut *tx)
            .await
            .map_err(search_err)?;

        let embedding = Vector::from(query.to_vec());
        let mut rows = fetch_rows(&mut tx, &sql, &embedding, &binds)
            .await
            .map_err(search_err)?;
        if needs_exact_scan(!filters.is_empty(), rows.len(), top_k) {
            // HNSW filters after the candidate list, so a selective filter can
            // starve the result; an exact scan sees every matching row
            tracing::debug!(
                returned = rows.len(),
                top_k,
                "filtered index scan came up short, rescanning exactly"
            );
            sqlx::query("SET LOCAL enable_indexscan = off")
                .execute(&mut *tx)
                .await
                .map_err(search_err)?;
            rows = fetch_rows(&mut tx, &sql, &embedding, &binds)
                .await
                .map_err(search_err)?;
        }
        tx.commit().await.map_err(search_err)?;

        let mut results = rows
            .iter()
            .map(|row| -> Result<RetrievalResult, sqlx::Error> {
                let score: f64 = row.try_get("score")?;
                let chunk = row_to_chunk(row)?;
                Ok(RetrievalResult::new(std::sync::Arc::new(chunk), score as f32))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(search_err)?;

        sort_results(&mut results);
        Ok(results)
    }

    async fn chunks_for_reprocessing(
        &self,
        document_id: Option<&str>,
        missing_only: bool,
    ) -> Result<Vec<Chunk>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM {}
            WHERE ($1::text IS NULL OR document_id = $1)
              AND ($2 = FALSE OR needs_embedding)
            ORDER BY document_id, ordinal
            "#,
            SELECT_COLUMNS, self.table_name
        );

        let rows = sqlx::query(&sql)
            .bind(document_id)
            .bind(missing_only)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;

        rows.iter()
            .map(row_to_chunk)
            .collect::<Result<Vec<_>, _>>()
            .map_err(pg_err)
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        self.chunks_for_reprocessing(Some(document_id), false).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<u64, StoreError> {
        let query = format!("DELETE FROM {} WHERE document_id = $1", self.table_name);
        let result = sqlx::query(&query)
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DeleteError(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let query = format!(
            r#"
            SELECT COUNT(*),
                   COUNT(DISTINCT document_id),
                   COUNT(*) FILTER (WHERE needs_embedding)
            FROM {}
            "#,
            self.table_name
        );
        let (chunks, documents, pending): (i64, i64, i64) = sqlx::query_as(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err)?;

        Ok(StoreStats {
            chunks: chunks as u64,
            documents: documents as u64,
            pending_embeddings: pending as u64,
        })
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let query = format!("TRUNCATE TABLE {}", self.table_name);
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DeleteError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_clause_uses_columns_and_extra() {
        let filters = MetadataFilter::new()
            .with("document_id", "manual-1")
            .with("page_number", "3")
            .with("product", "router-x");
        let (clause, binds) = filter_clause(&filters);

        // BTreeMap order: document_id, page_number, product
        assert_eq!(
            clause,
            " AND document_id = $2 AND page_number::text = $3 AND extra ->> $4 = $5"
        );
        assert_eq!(binds, vec!["manual-1", "3", "product", "router-x"]);
    }

    #[test]
    fn test_short_filtered_result_triggers_exact_scan() {
        assert!(needs_exact_scan(true, 0, 5));
        assert!(needs_exact_scan(true, 4, 5));
        assert!(!needs_exact_scan(true, 5, 5));
        // Unfiltered searches only come up short when the table is small
        assert!(!needs_exact_scan(false, 0, 5));
    }

    #[test]
    fn test_empty_filter_clause() {
        let (clause, binds) = filter_clause(&MetadataFilter::new());
        assert!(clause.is_empty());
        assert!(binds.is_empty());
    }
}
