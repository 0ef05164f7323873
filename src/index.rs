//! Vector index over SQLite.
//!
//! Chunks are stored per collection in `index_chunks` with their embedding as
//! a little-endian f32 BLOB. Retrieval is a brute-force cosine scan over the
//! collection, which is adequate for the corpus sizes a single chat backend
//! serves.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, vec_to_blob, EmbedderRegistry};
use crate::models::Chunk;

/// Semantic index consumed by ingestion and the conversation chain.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embed `chunks` with the embedder named `embeddings_name` and store them
    /// in `collection`. Returns the number of chunks written.
    async fn index(&self, chunks: &[Chunk], collection: &str, embeddings_name: &str)
        -> Result<usize>;

    /// The `k` chunks of `collection` most similar to `query`, best first.
    async fn retrieve(&self, query: &str, collection: &str, k: usize) -> Result<Vec<Chunk>>;
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    embedders: Arc<EmbedderRegistry>,
    batch_size: usize,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, embedders: Arc<EmbedderRegistry>, batch_size: usize) -> Self {
        Self {
            pool,
            embedders,
            batch_size: batch_size.max(1),
        }
    }

    /// Number of chunks stored in `collection`.
    pub async fn count(&self, collection: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_chunks WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// A collection holds vectors from exactly one embedder; adding chunks with
/// another one is rejected.
#[derive(Debug, thiserror::Error)]
#[error("collection '{collection}' is indexed with '{existing}' embeddings, not '{requested}'")]
pub struct EmbeddingsMismatch {
    pub collection: String,
    pub existing: String,
    pub requested: String,
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    /// Every source in `chunks` is replaced as a whole: rows left over from a
    /// longer earlier version of the same source are removed.
    async fn index(
        &self,
        chunks: &[Chunk],
        collection: &str,
        embeddings_name: &str,
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT embeddings_name FROM index_chunks \
             WHERE collection = ? AND embeddings_name != ? LIMIT 1",
        )
        .bind(collection)
        .bind(embeddings_name)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(existing) = existing {
            return Err(EmbeddingsMismatch {
                collection: collection.to_string(),
                existing,
                requested: embeddings_name.to_string(),
            }
            .into());
        }

        let embedder = self.embedders.get(embeddings_name)?;
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let batch_vectors = embedder
                .embed(&texts)
                .await
                .with_context(|| format!("Embedding failed for collection '{}'", collection))?;
            if batch_vectors.len() != batch.len() {
                anyhow::bail!(
                    "Embedder returned {} vectors for {} chunks",
                    batch_vectors.len(),
                    batch.len()
                );
            }
            if let Some(v) = batch_vectors.iter().find(|v| v.len() != embedder.dims()) {
                anyhow::bail!(
                    "Embedder '{}' ({}) returned {}-dimensional vectors, expected {}; \
                     set [embedding].dims to match the model",
                    embedder.name(),
                    embedder.model_name(),
                    v.len(),
                    embedder.dims()
                );
            }
            vectors.extend(batch_vectors);
        }

        let now = chrono::Utc::now().timestamp();
        let sources: BTreeSet<&str> = chunks.iter().map(|c| c.source.as_str()).collect();

        let mut tx = self.pool.begin().await?;
        for source in &sources {
            sqlx::query("DELETE FROM index_chunks WHERE collection = ? AND source = ?")
                .bind(collection)
                .bind(*source)
                .execute(&mut *tx)
                .await?;
        }
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO index_chunks
                    (collection, source, chunk_index, text, hash, embeddings_name, model, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(collection)
            .bind(&chunk.source)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(embedder.name())
            .bind(embedder.model_name())
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let written = chunks.len();
        debug!(collection, embeddings_name, sources = sources.len(), written, "indexed chunks");
        Ok(written)
    }

    async fn retrieve(&self, query: &str, collection: &str, k: usize) -> Result<Vec<Chunk>> {
        let embeddings_name: Option<String> = sqlx::query_scalar(
            "SELECT embeddings_name FROM index_chunks WHERE collection = ? LIMIT 1",
        )
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;

        let Some(embeddings_name) = embeddings_name else {
            debug!(collection, "retrieve on empty collection");
            return Ok(Vec::new());
        };

        let embedder = self.embedders.get(&embeddings_name)?;
        let query_vec = embed_query(embedder.as_ref(), query).await?;

        let rows = sqlx::query(
            "SELECT source, chunk_index, text, hash, dims, embedding FROM index_chunks \
             WHERE collection = ? AND embeddings_name = ?",
        )
        .bind(collection)
        .bind(&embeddings_name)
        .fetch_all(&self.pool)
        .await?;

        let mismatched = rows
            .iter()
            .filter(|row| row.get::<i64, _>("dims") != query_vec.len() as i64)
            .count();
        if mismatched > 0 {
            warn!(
                collection,
                mismatched,
                query_dims = query_vec.len(),
                "stored vectors differ in dimension from the query and score 0; re-index the collection"
            );
        }

        let mut scored: Vec<(f32, Chunk)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(&query_vec, &blob_to_vec(&blob));
                let chunk = Chunk {
                    source: row.get("source"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    hash: row.get("hash"),
                };
                (similarity, chunk)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored.into_iter().map(|(_, chunk)| chunk).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::testing::{test_pool, BagOfWordsEmbedder};

    fn registry() -> Arc<EmbedderRegistry> {
        Arc::new(EmbedderRegistry::fixed(vec![Arc::new(BagOfWordsEmbedder::new("openai"))]))
    }

    fn docs() -> Vec<Chunk> {
        let mut chunks = chunk_text("files/ships.txt", "Ships sail across the harbour.", 250, 0);
        chunks.extend(chunk_text("files/bread.txt", "Bread rises in a warm oven.", 250, 0));
        chunks.extend(chunk_text("files/cats.txt", "Cats sleep most of the day.", 250, 0));
        chunks
    }

    #[tokio::test]
    async fn test_retrieve_ranks_by_similarity() {
        let (_tmp, pool) = test_pool().await;
        let index = SqliteVectorIndex::new(pool, registry(), 2);

        let written = index.index(&docs(), "betaCollection", "openai").await.unwrap();
        assert_eq!(written, 3);

        let hits = index.retrieve("warm bread oven", "betaCollection", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source, "files/bread.txt");
    }

    #[tokio::test]
    async fn test_reindex_replaces_rows() {
        let (_tmp, pool) = test_pool().await;
        let index = SqliteVectorIndex::new(pool, registry(), 64);

        index.index(&docs(), "c", "openai").await.unwrap();
        index.index(&docs(), "c", "openai").await.unwrap();
        assert_eq!(index.count("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let (_tmp, pool) = test_pool().await;
        let index = SqliteVectorIndex::new(pool, registry(), 64);

        index.index(&docs(), "first", "openai").await.unwrap();
        assert!(index.retrieve("cats", "second", 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_embedder_is_error() {
        let (_tmp, pool) = test_pool().await;
        let index = SqliteVectorIndex::new(pool, registry(), 64);
        assert!(index.index(&docs(), "c", "ollama").await.is_err());
    }

    #[tokio::test]
    async fn test_reindex_with_fewer_chunks_drops_stale_rows() {
        let (_tmp, pool) = test_pool().await;
        let index = SqliteVectorIndex::new(pool, registry(), 64);

        let long = chunk_text(
            "files/notes.txt",
            "alpha beta gamma one\n\ndelta epsilon zeta two\n\neta theta iota three",
            5,
            0,
        );
        assert!(long.len() > 1);
        index.index(&long, "c", "openai").await.unwrap();
        index.index(&docs(), "c", "openai").await.unwrap();

        let short = chunk_text("files/notes.txt", "short", 5, 0);
        index.index(&short, "c", "openai").await.unwrap();

        assert_eq!(index.count("c").await.unwrap(), 1 + docs().len() as i64);
        let texts: Vec<String> = index
            .retrieve("alpha delta eta short", "c", 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.source == "files/notes.txt")
            .map(|c| c.text)
            .collect();
        assert_eq!(texts, vec!["short"]);
    }

    #[tokio::test]
    async fn test_mixing_embedders_in_one_collection_is_rejected() {
        let (_tmp, pool) = test_pool().await;
        let embedders = Arc::new(EmbedderRegistry::fixed(vec![
            Arc::new(BagOfWordsEmbedder::new("openai")),
            Arc::new(BagOfWordsEmbedder::new("ollama")),
        ]));
        let index = SqliteVectorIndex::new(pool, embedders, 64);

        index.index(&docs(), "betaCollection", "openai").await.unwrap();
        let err = index
            .index(&docs(), "betaCollection", "ollama")
            .await
            .unwrap_err();
        let mismatch = err.downcast_ref::<EmbeddingsMismatch>().unwrap();
        assert_eq!(mismatch.existing, "openai");
        assert_eq!(index.count("betaCollection").await.unwrap(), 3);

        // other collections are free to use another embedder
        index.index(&docs(), "research", "ollama").await.unwrap();
    }

    struct ShortEmbedder;

    #[async_trait]
    impl crate::embedding::Embedder for ShortEmbedder {
        fn name(&self) -> &str {
            "openai"
        }
        fn model_name(&self) -> &str {
            "short"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0; 4]).collect())
        }
    }

    #[tokio::test]
    async fn test_vectors_of_wrong_dimension_are_rejected() {
        let (_tmp, pool) = test_pool().await;
        let embedders = Arc::new(EmbedderRegistry::fixed(vec![Arc::new(ShortEmbedder)]));
        let index = SqliteVectorIndex::new(pool, embedders, 64);

        let err = index.index(&docs(), "c", "openai").await.unwrap_err();
        assert!(err.to_string().contains("[embedding].dims"), "{}", err);
        assert_eq!(index.count("c").await.unwrap(), 0);
    }
}
