//! Per-application state persisted across restarts.
//!
//! State lives apart from the content cache: clearing one never loses the
//! other. Saves are last-write-wins, serialized per application and durable
//! once `save` returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::digest::compute_digest;
use crate::error::{LoaderError, LoaderResult};

/// What a restarted process needs to resume an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// Last successfully loaded manifest.
    pub manifest_id: String,

    /// Freshness of that manifest; seeds downgrade protection on restart.
    pub freshness: u64,

    /// Canonical digest of that manifest.
    pub manifest_digest: String,

    /// Opaque UI session snapshot.
    #[serde(default, with = "snapshot_b64", skip_serializing_if = "Option::is_none")]
    pub ui_snapshot: Option<Vec<u8>>,

    pub written_at: DateTime<Utc>,
}

mod snapshot_b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Persistence backend for [`AppState`].
#[async_trait]
pub trait AppStateStore: Send + Sync {
    /// Persist `state`, replacing any previous state. Durable on return.
    async fn save(&self, application_id: &str, state: &AppState) -> LoaderResult<()>;

    /// Read the persisted state, `None` if never saved.
    async fn load(&self, application_id: &str) -> LoaderResult<Option<AppState>>;
}

/// In-memory store (state does not survive the process).
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, AppState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppStateStore for MemoryStateStore {
    async fn save(&self, application_id: &str, state: &AppState) -> LoaderResult<()> {
        self.states
            .lock()
            .insert(application_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, application_id: &str) -> LoaderResult<Option<AppState>> {
        Ok(self.states.lock().get(application_id).cloned())
    }
}

/// One JSON file per application under a state directory.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn unavailable(context: &str, path: &Path, e: impl std::fmt::Display) -> LoaderError {
    LoaderError::StateStoreUnavailable {
        message: format!("{} {}: {}", context, path.display(), e),
    }
}

/// Persist a rename inside `dir`.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> LoaderResult<()> {
    let handle = fs::File::open(dir)
        .await
        .map_err(|e| unavailable("failed to open", dir, e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| unavailable("failed to sync", dir, e))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> LoaderResult<()> {
    Ok(())
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_for(&self, application_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(application_id.to_string())
                .or_default(),
        )
    }

    /// File for an application. Ids that are not filename-safe are hashed.
    fn state_path(&self, application_id: &str) -> PathBuf {
        let safe = !application_id.is_empty()
            && !application_id.starts_with('.')
            && application_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        let stem = if safe {
            application_id.to_string()
        } else {
            compute_digest(application_id.as_bytes()).replace(':', "-")
        };
        self.dir.join(format!("{}.json", stem))
    }
}

#[async_trait]
impl AppStateStore for FileStateStore {
    async fn save(&self, application_id: &str, state: &AppState) -> LoaderResult<()> {
        let lock = self.lock_for(application_id);
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unavailable("failed to create", &self.dir, e))?;

        let path = self.state_path(application_id);
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| unavailable("failed to encode", &path, e))?;

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&content).await?;
            file.sync_all().await
        };
        write
            .await
            .map_err(|e| unavailable("failed to write", &temp_path, e))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| unavailable("failed to rename", &path, e))?;

        sync_dir(&self.dir).await?;

        debug!(application_id, manifest_id = %state.manifest_id, "saved app state");
        Ok(())
    }

    async fn load(&self, application_id: &str) -> LoaderResult<Option<AppState>> {
        let path = self.state_path(application_id);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable("failed to read", &path, e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| unavailable("failed to parse", &path, e))
    }
}
