//! Ingestion orchestration.
//!
//! Uploads go through [`ingest_document`], which records every file it sees
//! and moves the record through `pending_index → indexed | failed`. Bulk
//! loads of a directory go through [`add_documents`] and write only to the
//! vector index.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{info, warn};

use crate::config::Config;
use crate::convert::{self, Format};
use crate::files;
use crate::index::VectorIndex;
use crate::loader::load_n_split;
use crate::models::FileState;

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub record_id: i64,
    pub chunks: usize,
    pub state: FileState,
}

/// Load, record, and index one uploaded file. Conversion and extraction run
/// on the blocking pool.
///
/// Loading and indexing failures end up on the record as `failed` with the
/// error message; only database errors are returned.
pub async fn ingest_document(
    pool: &SqlitePool,
    index: &dyn VectorIndex,
    config: &Config,
    path: &Path,
    file_name: &str,
    static_url: &str,
) -> Result<IngestOutcome> {
    let owned_path = path.to_path_buf();
    let converted_dir = config.storage.converted_dir.clone();
    let chunking = config.chunking.clone();
    let loaded = tokio::task::spawn_blocking(move || {
        if let Ok(format) = Format::from_path(&owned_path) {
            if let Err(e) = convert::convert_file(&owned_path, format, &converted_dir) {
                warn!(path = %owned_path.display(), error = %e, "conversion failed");
            }
        }
        load_n_split(&owned_path, &chunking)
    })
    .await?;

    let chunks = match loaded {
        Ok(chunks) => chunks,
        Err(e) => {
            let record_id = files::insert_record(pool, file_name, static_url, &[]).await?;
            files::mark_failed(pool, record_id, &format!("{:#}", e)).await?;
            warn!(file_name, error = %e, "ingestion failed while loading");
            return Ok(IngestOutcome {
                record_id,
                chunks: 0,
                state: FileState::Failed,
            });
        }
    };

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let record_id = files::insert_record(pool, file_name, static_url, &texts).await?;

    let collection = &config.retrieval.default_collection;
    let embeddings_name = &config.retrieval.default_embeddings;
    match index.index(&chunks, collection, embeddings_name).await {
        Ok(written) => {
            files::mark_indexed(pool, record_id).await?;
            info!(file_name, record_id, chunks = written, "file ingested");
            Ok(IngestOutcome {
                record_id,
                chunks: written,
                state: FileState::Indexed,
            })
        }
        Err(e) => {
            files::mark_failed(pool, record_id, &format!("{:#}", e)).await?;
            warn!(file_name, record_id, error = %e, "ingestion failed while indexing");
            Ok(IngestOutcome {
                record_id,
                chunks: texts.len(),
                state: FileState::Failed,
            })
        }
    }
}

/// Load every document under `dir_path` and index it into `collection`.
/// Returns the number of chunks indexed.
pub async fn add_documents(
    index: &dyn VectorIndex,
    config: &Config,
    dir_path: &Path,
    collection: &str,
    embeddings_name: &str,
) -> Result<usize> {
    let owned_dir = dir_path.to_path_buf();
    let chunking = config.chunking.clone();
    let chunks = tokio::task::spawn_blocking(move || load_n_split(&owned_dir, &chunking)).await??;
    let written = index.index(&chunks, collection, embeddings_name).await?;
    info!(dir = %dir_path.display(), collection, embeddings_name, chunks = written, "documents added");
    Ok(written)
}
