//! Core data models.
//!
//! These types represent the chunks, file records, chat turns, and ranked
//! results that flow through ingestion and query answering.

use serde::{Deserialize, Serialize};

/// A contiguous span of source-document text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Originating file path, as given to the loader.
    pub source: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A chunk paired with its BM25 score for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedChunk {
    pub text: String,
    pub bm25_score: f64,
}

/// Lifecycle of an ingested file.
///
/// A record is written `PendingIndex` before its chunks go to the vector
/// index and only moves to `Indexed` once that write succeeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    PendingIndex,
    Indexed,
    Failed,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::PendingIndex => "pending_index",
            FileState::Indexed => "indexed",
            FileState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_index" => Some(FileState::PendingIndex),
            "indexed" => Some(FileState::Indexed),
            "failed" => Some(FileState::Failed),
            _ => None,
        }
    }
}

/// Stored record of an ingested file.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub file_name: String,
    pub static_url: String,
    pub chunks: Vec<String>,
    pub state: FileState,
    pub error: Option<String>,
    pub created_at: i64,
}

/// One (query, response) exchange in a chat session.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatTurn {
    pub query: String,
    pub response: String,
}
