//! Read documents from disk and split them into chunks.
//!
//! Plain text and markdown are read as-is, PDFs go through `pdf-extract`, and
//! the office/e-book formats go through [`crate::convert`]. A path may name a
//! single file or a directory, which is walked recursively.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::convert::{self, ConvertError, Format};
use crate::models::Chunk;

const PLAIN_TEXT_EXTENSIONS: [&str; 4] = ["txt", "md", "markdown", "text"];

/// Read the text content of one document.
///
/// Returns [`ConvertError::Unsupported`] (wrapped) for extensions that are
/// neither plain text, PDF, nor a convertible format.
pub fn read_document(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if PLAIN_TEXT_EXTENSIONS.contains(&ext.as_str()) {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }

    if ext == "pdf" {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        return pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| anyhow::anyhow!("PDF extraction failed for {}: {}", path.display(), e));
    }

    let format = Format::from_extension(&ext)
        .map_err(|_| ConvertError::Unsupported(path.display().to_string()))?;
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = convert::extract_text(&bytes, format)
        .with_context(|| format!("Failed to convert {}", path.display()))?;
    Ok(text)
}

/// Load `path` (a file or a directory) and split every readable document.
///
/// Each chunk's `source` is the document's path. Unreadable files inside a
/// directory are skipped with a warning; a single unreadable file is an error.
pub fn load_n_split(path: &Path, chunking: &ChunkingConfig) -> Result<Vec<Chunk>> {
    if path.is_file() {
        let text = read_document(path)?;
        return Ok(split(path, &text, chunking));
    }

    if !path.is_dir() {
        anyhow::bail!("Path does not exist: {}", path.display());
    }

    let mut entries: Vec<_> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    entries.sort();

    let mut chunks = Vec::new();
    for file in entries {
        match read_document(&file) {
            Ok(text) => {
                let doc_chunks = split(&file, &text, chunking);
                debug!(path = %file.display(), chunks = doc_chunks.len(), "loaded document");
                chunks.extend(doc_chunks);
            }
            Err(e) => warn!(path = %file.display(), error = %e, "skipping document"),
        }
    }
    Ok(chunks)
}

fn split(path: &Path, text: &str, chunking: &ChunkingConfig) -> Vec<Chunk> {
    chunk_text(
        &path.to_string_lossy(),
        text,
        chunking.max_tokens,
        chunking.overlap_tokens,
    )
}
