//! Filesystem layout and atomic writes.
//!
//! ```text
//! {root}/entries/{digest hex}/module.bin
//! {root}/entries/{digest hex}/meta.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{LoaderError, LoaderResult};

pub(crate) const ENTRIES_DIR: &str = "entries";
pub(crate) const MODULE_FILE: &str = "module.bin";
pub(crate) const META_FILE: &str = "meta.json";

/// Metadata stored alongside each entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EntryMeta {
    pub(crate) id: String,
    pub(crate) size: u64,
    pub(crate) stored_at: DateTime<Utc>,
    pub(crate) last_access: DateTime<Utc>,
}

pub(crate) fn cache_error(context: &str, path: &Path, e: impl std::fmt::Display) -> LoaderError {
    LoaderError::Cache {
        message: format!("{} {}: {}", context, path.display(), e),
    }
}

/// Write via a temp file and rename so readers never see partial content.
///
/// Temp names are unique per call; concurrent writers of the same path
/// each rename a complete file and the last one wins.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> LoaderResult<()> {
    let temp_path = path.with_extension(format!("{:016x}.tmp", rand::random::<u64>()));

    let file = async {
        let mut file = fs::File::create(&temp_path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, content).await?;
        file.sync_all().await
    };
    file.await
        .map_err(|e| cache_error("failed to write temp file", &temp_path, e))?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| cache_error("failed to rename temp file", path, e))?;

    Ok(())
}

pub(crate) async fn read_meta(entry_dir: &Path) -> LoaderResult<EntryMeta> {
    let path = entry_dir.join(META_FILE);
    let content = fs::read(&path)
        .await
        .map_err(|e| cache_error("failed to read", &path, e))?;
    serde_json::from_slice(&content).map_err(|e| cache_error("failed to parse", &path, e))
}

pub(crate) async fn write_meta(entry_dir: &Path, meta: &EntryMeta) -> LoaderResult<()> {
    let path = entry_dir.join(META_FILE);
    let content =
        serde_json::to_vec_pretty(meta).map_err(|e| cache_error("failed to encode", &path, e))?;
    write_atomic(&path, &content).await
}

/// Remove an entry directory; a missing directory is not an error.
pub(crate) async fn remove_entry_dir(entry_dir: &Path) -> LoaderResult<()> {
    match fs::remove_dir_all(entry_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(cache_error("failed to remove", entry_dir, e)),
    }
}

pub(crate) fn entries_dir(root: &Path) -> PathBuf {
    root.join(ENTRIES_DIR)
}
