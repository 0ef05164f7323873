//! File records and the on-disk data directory.
//!
//! Two kinds of state live here. File records in SQLite track what was
//! ingested from each upload and how far ingestion got. The data directory
//! holds the uploads themselves, one subdirectory per folder, and is what
//! `/static` serves.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::convert::Format;
use crate::models::{FileRecord, FileState};

// ═══════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════

/// Insert a `pending_index` record holding `chunks`. Returns its id.
pub async fn insert_record(
    pool: &SqlitePool,
    file_name: &str,
    static_url: &str,
    chunks: &[String],
) -> Result<i64> {
    let chunks_json = serde_json::to_string(chunks)?;
    let result = sqlx::query(
        "INSERT INTO files (file_name, static_url, chunks, state, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(file_name)
    .bind(static_url)
    .bind(chunks_json)
    .bind(FileState::PendingIndex.as_str())
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn mark_indexed(pool: &SqlitePool, id: i64) -> Result<()> {
    set_state(pool, id, FileState::Indexed, None).await
}

pub async fn mark_failed(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
    set_state(pool, id, FileState::Failed, Some(error)).await
}

async fn set_state(pool: &SqlitePool, id: i64, state: FileState, error: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE files SET state = ?, error = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_record(pool: &SqlitePool, id: i64) -> Result<Option<FileRecord>> {
    let row = sqlx::query(
        "SELECT id, file_name, static_url, chunks, state, error, created_at FROM files WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let chunks_json: String = row.get("chunks");
    let chunks: Vec<String> = serde_json::from_str(&chunks_json)
        .with_context(|| format!("Corrupt chunk list for file record {}", id))?;
    let state: String = row.get("state");

    Ok(Some(FileRecord {
        id: row.get("id"),
        file_name: row.get("file_name"),
        static_url: row.get("static_url"),
        chunks,
        state: FileState::parse(&state)
            .ok_or_else(|| anyhow::anyhow!("Unknown file state '{}'", state))?,
        error: row.get("error"),
        created_at: row.get("created_at"),
    }))
}

// ═══════════════════════════════════════════════════════════════════════
// Data directory
// ═══════════════════════════════════════════════════════════════════════

/// A client-supplied folder or file name that would escape the data directory.
#[derive(Debug, thiserror::Error)]
#[error("invalid path component: {0}")]
pub struct InvalidName(pub String);

/// Join client-supplied relative parts under `root`, rejecting absolute
/// paths and `..`.
pub fn safe_join(root: &Path, parts: &[&str]) -> Result<PathBuf, InvalidName> {
    let mut path = root.to_path_buf();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        for component in Path::new(part).components() {
            match component {
                Component::Normal(c) => path.push(c),
                Component::CurDir => {}
                _ => return Err(InvalidName(part.to_string())),
            }
        }
    }
    Ok(path)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub file: String,
    pub url: String,
    /// Link to the plain-text conversion, for formats that have one.
    pub converted_url: Option<String>,
}

/// Public link to a file under the data directory.
pub fn static_url(public_base_url: &str, relative: &str) -> String {
    format!("{}/static/{}", public_base_url.trim_end_matches('/'), relative)
}

/// Every file under `data_dir` grouped by folder relative to it (`"."` for
/// the root). `None` when the directory does not exist.
pub fn list_files(
    data_dir: &Path,
    public_base_url: &str,
) -> Result<Option<BTreeMap<String, Vec<FileEntry>>>> {
    if !data_dir.is_dir() {
        return Ok(None);
    }

    let base = public_base_url.trim_end_matches('/');
    let mut grouped: BTreeMap<String, Vec<FileEntry>> = BTreeMap::new();

    for entry in walkdir::WalkDir::new(data_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let folder = path
            .parent()
            .and_then(|p| p.strip_prefix(data_dir).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let file = entry.file_name().to_string_lossy().into_owned();

        let relative = if folder == "." {
            file.clone()
        } else {
            format!("{}/{}", folder, file)
        };
        let converted_url = Format::from_path(path).ok().and_then(|_| {
            path.file_stem()
                .map(|stem| format!("{}/files/{}.txt", base, stem.to_string_lossy()))
        });

        grouped.entry(folder).or_default().push(FileEntry {
            url: static_url(base, &relative),
            converted_url,
            file,
        });
    }

    Ok(Some(grouped))
}

/// Names of the top-level folders in `data_dir`, creating it if missing.
pub fn list_folders(data_dir: &Path) -> Result<Vec<String>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let mut folders = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            folders.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    folders.sort();
    Ok(folders)
}

/// Write an upload to `<data_dir>/<folder>/<file_name>`.
///
/// The folder must already exist unless `create_new_folder` is set.
pub fn save_upload(
    data_dir: &Path,
    folder: &str,
    create_new_folder: bool,
    file_name: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let folder_path = safe_join(data_dir, &[folder])?;
    if create_new_folder {
        std::fs::create_dir_all(&folder_path)
            .with_context(|| format!("Failed to create {}", folder_path.display()))?;
    } else if !folder_path.is_dir() {
        return Err(MissingFolder(folder.to_string()).into());
    }

    let path = safe_join(&folder_path, &[file_name])?;
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, thiserror::Error)]
#[error("folder '{0}' does not exist")]
pub struct MissingFolder(pub String);

/// Remove `<data_dir>/<folder>/<file_name>` from disk. Returns `false` when
/// there is no such file. File records and index rows are left as they are.
pub fn delete_file(data_dir: &Path, folder: &str, file_name: &str) -> Result<bool> {
    let path = safe_join(data_dir, &[folder, file_name])?;
    if !path.is_file() {
        return Ok(false);
    }
    std::fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
    Ok(true)
}

/// Bytes of a converted file, `None` if it does not exist.
pub fn read_converted(converted_dir: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let path = safe_join(converted_dir, &[name])?;
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(std::fs::read(&path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_pool;

    #[tokio::test]
    async fn test_record_lifecycle() {
        let (_tmp, pool) = test_pool().await;
        let chunks = vec!["one".to_string(), "two".to_string()];
        let id = insert_record(&pool, "a.txt", "http://x/static/f/a.txt", &chunks)
            .await
            .unwrap();

        let record = get_record(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.state, FileState::PendingIndex);
        assert_eq!(record.chunks, chunks);

        mark_failed(&pool, id, "embedder down").await.unwrap();
        let record = get_record(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.state, FileState::Failed);
        assert_eq!(record.error.as_deref(), Some("embedder down"));

        mark_indexed(&pool, id).await.unwrap();
        let record = get_record(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.state, FileState::Indexed);
        assert!(record.error.is_none());

        assert!(get_record(&pool, id + 100).await.unwrap().is_none());
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let root = Path::new("/srv/data");
        assert!(safe_join(root, &["../etc", "passwd"]).is_err());
        assert!(safe_join(root, &["/etc"]).is_err());
        assert_eq!(
            safe_join(root, &["reports", "q1.pdf"]).unwrap(),
            PathBuf::from("/srv/data/reports/q1.pdf")
        );
    }

    #[test]
    fn test_list_files_grouped_by_folder() {
        let tmp = tempfile::TempDir::new().unwrap();
        let data = tmp.path().join("files");
        std::fs::create_dir_all(data.join("reports")).unwrap();
        std::fs::write(data.join("reports/q1.docx"), b"x").unwrap();
        std::fs::write(data.join("readme.md"), b"x").unwrap();

        let grouped = list_files(&data, "http://host:8000/").unwrap().unwrap();
        let reports = &grouped["reports"];
        assert_eq!(reports[0].file, "q1.docx");
        assert_eq!(reports[0].url, "http://host:8000/static/reports/q1.docx");
        assert_eq!(
            reports[0].converted_url.as_deref(),
            Some("http://host:8000/files/q1.txt")
        );
        let root = &grouped["."];
        assert_eq!(root[0].url, "http://host:8000/static/readme.md");
        assert!(root[0].converted_url.is_none());
    }

    #[test]
    fn test_list_files_missing_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(list_files(&tmp.path().join("nope"), "http://h").unwrap().is_none());
    }

    #[test]
    fn test_list_folders_creates_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let data = tmp.path().join("files");
        assert!(list_folders(&data).unwrap().is_empty());
        assert!(data.is_dir());

        std::fs::create_dir_all(data.join("b")).unwrap();
        std::fs::create_dir_all(data.join("a")).unwrap();
        std::fs::write(data.join("loose.txt"), b"x").unwrap();
        assert_eq!(list_folders(&data).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_save_upload_requires_folder_unless_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let data = tmp.path().join("files");
        std::fs::create_dir_all(&data).unwrap();

        let err = save_upload(&data, "new", false, "a.txt", b"hi").unwrap_err();
        assert!(err.downcast_ref::<MissingFolder>().is_some());

        let path = save_upload(&data, "new", true, "a.txt", b"hi").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hi");
    }

    #[test]
    fn test_delete_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let data = tmp.path().to_path_buf();
        std::fs::create_dir_all(data.join("f")).unwrap();
        std::fs::write(data.join("f/a.txt"), b"x").unwrap();

        assert!(!delete_file(&data, "f", "missing.txt").unwrap());
        assert!(delete_file(&data, "f", "a.txt").unwrap());
        assert!(!data.join("f/a.txt").exists());
    }
}
