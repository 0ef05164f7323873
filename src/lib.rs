//! # docchat
//!
//! A retrieval-augmented chat backend over a folder of documents.
//!
//! Uploaded files are converted to text, chunked, embedded, and stored in a
//! SQLite-backed vector index. Questions are condensed against the chat
//! session's history, answered from the retrieved chunks, reranked with
//! BM25, and returned with source links and suggested follow-ups.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │   Upload    │──▶│ Convert +   │──▶│    SQLite    │
//! │ /doc_ingest │   │ Chunk+Embed │   │ files, index │
//! └─────────────┘   └─────────────┘   │   sessions   │
//!                                     └──────┬───────┘
//!                                            │
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐         ┌──────────┐
//!                 │  Query   │────────▶│   Chat   │
//!                 │ pipeline │         │  model   │
//!                 └──────────┘         └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`convert`] | DOCX, XLSX, CSV, and EPUB to plain text |
//! | [`loader`] | Document loading and splitting |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index over named collections |
//! | [`files`] | File records and the data directory |
//! | [`ingest`] | Upload and bulk ingestion |
//! | [`session`] | Chat history persistence |
//! | [`llm`] | Chat completion client |
//! | [`chain`] | Condense-retrieve-answer chain |
//! | [`rerank`] | BM25 reranking |
//! | [`pipeline`] | End-to-end query answering |
//! | [`logging`] | Tracing and the query log |
//! | [`server`] | HTTP API |

pub mod chain;
pub mod chunk;
pub mod config;
pub mod convert;
pub mod db;
pub mod embedding;
pub mod files;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod rerank;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;
