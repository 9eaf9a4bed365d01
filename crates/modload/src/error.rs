//! Error types for the module loader.

/// Loader errors.
///
/// `Clone` so that one shared download outcome can be handed to every
/// caller waiting on the same content identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    /// Manifest bytes could not be parsed or are structurally invalid.
    #[error("malformed manifest: {reason}")]
    MalformedManifest { reason: String },

    /// No trusted key validates the manifest signature.
    #[error("untrusted manifest: {reason}")]
    UntrustedManifest { reason: String },

    /// Freshness token does not advance past the last accepted manifest.
    #[error("stale manifest for {application_id}: freshness {offered} <= accepted {accepted}")]
    StaleManifest {
        application_id: String,
        offered: u64,
        accepted: u64,
    },

    /// Transient transport failure (retryable).
    #[error("transient fetch error for {locator}: {message}")]
    TransientFetch { locator: String, message: String },

    /// Fetch failed permanently or retries were exhausted.
    #[error("fetch failed for {locator} after {attempts} attempt(s): {message}")]
    FetchFailed {
        locator: String,
        attempts: u32,
        message: String,
    },

    /// Downloaded bytes do not match the expected length or digest.
    #[error("integrity mismatch for {id}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// Conflicting bytes for an existing content identifier.
    #[error("cache corruption for {id}: {reason}")]
    CacheCorruption { id: String, reason: String },

    /// Cache storage I/O failure.
    #[error("cache error: {message}")]
    Cache { message: String },

    /// Application state could not be persisted or read.
    #[error("state store unavailable: {message}")]
    StateStoreUnavailable { message: String },

    /// Load-level timeout expired before all modules resolved.
    #[error("load of {application_id} timed out with {unresolved} module(s) unresolved")]
    LoadTimedOut {
        application_id: String,
        unresolved: usize,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl LoaderError {
    /// Whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }

    /// Whether the error was raised while verifying the manifest.
    pub fn is_manifest_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedManifest { .. }
                | Self::UntrustedManifest { .. }
                | Self::StaleManifest { .. }
        )
    }
}

impl From<reqwest::Error> for LoaderError {
    fn from(err: reqwest::Error) -> Self {
        Self::TransientFetch {
            locator: err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            message: err.to_string(),
        }
    }
}

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
