//! Loader configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, LoaderResult};

/// Placeholder substituted with the application identifier in `manifest_url`.
pub const APP_PLACEHOLDER: &str = "{app}";

/// Loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Logical cache namespace (subdirectory of `cache_dir`).
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Cache root directory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Eviction budget over unpinned entries, in bytes.
    #[serde(default = "default_cache_max_size_bytes")]
    pub cache_max_size_bytes: u64,

    /// Maximum simultaneous in-flight downloads.
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,

    /// Maximum retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout per fetch attempt, in seconds.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Timeout for a whole load, in seconds.
    #[serde(default)]
    pub load_timeout_secs: Option<u64>,

    /// Manifest locator template, `{app}` is replaced by the application id.
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,

    /// Directory for persisted application state.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Skip manifest signature checks (dev only).
    #[serde(default)]
    pub allow_unsigned: bool,
}

fn default_cache_name() -> String {
    "modload".to_string()
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("modload")
}

fn default_cache_max_size_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_concurrent_downloads() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_manifest_url() -> String {
    "http://localhost:8080/{app}/manifest.json".to_string()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_name: default_cache_name(),
            cache_dir: default_cache_dir(),
            cache_max_size_bytes: default_cache_max_size_bytes(),
            concurrent_downloads: default_concurrent_downloads(),
            max_retries: default_max_retries(),
            attempt_timeout_secs: default_attempt_timeout(),
            load_timeout_secs: None,
            manifest_url: default_manifest_url(),
            state_dir: None,
            allow_unsigned: false,
        }
    }
}

impl LoaderConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `MODLOAD_CACHE_DIR` | Cache root directory |
    /// | `MODLOAD_CACHE_MAX_BYTES` | Eviction budget |
    /// | `MODLOAD_CONCURRENT_DOWNLOADS` | In-flight download bound |
    /// | `MODLOAD_MAX_RETRIES` | Retries for transient failures |
    /// | `MODLOAD_ATTEMPT_TIMEOUT` | Per-attempt timeout (seconds) |
    /// | `MODLOAD_LOAD_TIMEOUT` | Whole-load timeout (seconds) |
    /// | `MODLOAD_MANIFEST_URL` | Manifest locator template |
    /// | `MODLOAD_ALLOW_UNSIGNED` | Skip signature checks (dev only) |
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        Self {
            cache_name: default_cache_name(),
            cache_dir: std::env::var("MODLOAD_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_cache_dir()),
            cache_max_size_bytes: parsed("MODLOAD_CACHE_MAX_BYTES")
                .unwrap_or_else(default_cache_max_size_bytes),
            concurrent_downloads: parsed("MODLOAD_CONCURRENT_DOWNLOADS")
                .unwrap_or_else(default_concurrent_downloads),
            max_retries: parsed("MODLOAD_MAX_RETRIES").unwrap_or_else(default_max_retries),
            attempt_timeout_secs: parsed("MODLOAD_ATTEMPT_TIMEOUT")
                .unwrap_or_else(default_attempt_timeout),
            load_timeout_secs: parsed("MODLOAD_LOAD_TIMEOUT"),
            manifest_url: std::env::var("MODLOAD_MANIFEST_URL")
                .unwrap_or_else(|_| default_manifest_url()),
            state_dir: None,
            allow_unsigned: std::env::var("MODLOAD_ALLOW_UNSIGNED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Check invariants that would otherwise surface as runtime failures.
    pub fn validate(&self) -> LoaderResult<()> {
        if self.concurrent_downloads == 0 {
            return Err(LoaderError::Config {
                message: "concurrent_downloads must be at least 1".to_string(),
            });
        }
        if matches!(self.cache_name.as_str(), "" | "." | "..")
            || self.cache_name.contains(['/', '\\'])
        {
            return Err(LoaderError::Config {
                message: format!("invalid cache name: {:?}", self.cache_name),
            });
        }
        let sample = self.manifest_locator("app");
        url::Url::parse(&sample).map_err(|e| LoaderError::Config {
            message: format!("invalid manifest url {}: {}", self.manifest_url, e),
        })?;
        Ok(())
    }

    /// Directory holding this namespace's cache entries.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.join(&self.cache_name)
    }

    /// Directory holding persisted application state.
    ///
    /// Kept outside `cache_root` so clearing the cache keeps resumable state.
    pub fn state_root(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join(format!("{}-state", self.cache_name)))
    }

    /// Manifest locator for an application.
    ///
    /// The id is percent-encoded, so it always stays within one path segment
    /// (or query value) of the template.
    pub fn manifest_locator(&self, application_id: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(application_id.as_bytes())
            .collect::<String>()
            .replace('+', "%20");
        self.manifest_url.replace(APP_PLACEHOLDER, &encoded)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_secs.map(Duration::from_secs)
    }

    /// Set the cache root directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the cache namespace.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Set the eviction budget.
    pub fn with_cache_max_size_bytes(mut self, bytes: u64) -> Self {
        self.cache_max_size_bytes = bytes;
        self
    }

    /// Set the in-flight download bound.
    pub fn with_concurrent_downloads(mut self, k: usize) -> Self {
        self.concurrent_downloads = k;
        self
    }

    /// Set the retry bound.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the whole-load timeout.
    pub fn with_load_timeout_secs(mut self, secs: u64) -> Self {
        self.load_timeout_secs = Some(secs);
        self
    }

    /// Set the manifest locator template.
    pub fn with_manifest_url(mut self, url: impl Into<String>) -> Self {
        self.manifest_url = url.into();
        self
    }

    /// Set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Allow unsigned manifests.
    pub fn with_allow_unsigned(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }
}
