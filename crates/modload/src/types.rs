//! Wire and domain types for manifests and loaded modules.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::PinGuard;

/// Signed wrapper around an encoded [`ManifestBody`], DSSE wire layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    /// Media type bound into every signature.
    pub payload_type: String,

    /// Standard base64 of the JSON body bytes.
    pub payload: String,

    #[serde(default)]
    pub signatures: Vec<DsseSignature>,
}

/// One signature over the envelope's pre-authentication encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsseSignature {
    #[serde(rename = "keyid")]
    pub key_id: String,

    /// Standard base64 of the raw 64-byte Ed25519 signature.
    #[serde(rename = "sig")]
    pub signature: String,
}

/// Manifest body as carried inside the envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBody {
    /// Application this manifest belongs to.
    pub application_id: String,

    /// Opaque manifest identifier (e.g., build id).
    pub id: String,

    /// Monotonic freshness token (version or timestamp).
    pub freshness: u64,

    /// Modules, in load order.
    pub modules: Vec<ModuleRef>,
}

/// Reference to a remotely hosted module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    /// Module name handed to the host runtime.
    pub name: String,

    /// Source locator, absolute or relative to the manifest locator.
    pub url: String,

    /// Expected byte length.
    pub size: u64,

    /// Expected content digest (sha256:...).
    pub digest: String,
}

impl ModuleRef {
    /// Content identifier used for caching and deduplication.
    ///
    /// Identical to the digest, so equal identifiers imply identical bytes.
    pub fn content_id(&self) -> &str {
        &self.digest
    }
}

/// A verified manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Verified body.
    pub body: ManifestBody,

    /// Digest of the canonical (JCS) body, identifies this exact manifest.
    pub digest: String,

    /// Key that validated the signature (`None` when signature checks are off).
    pub key_id: Option<String>,

    /// Locator the manifest was fetched from, used to resolve relative module urls.
    pub locator: Option<String>,
}

impl Manifest {
    pub fn id(&self) -> &str {
        &self.body.id
    }

    pub fn application_id(&self) -> &str {
        &self.body.application_id
    }

    pub fn freshness(&self) -> u64 {
        self.body.freshness
    }

    pub fn modules(&self) -> &[ModuleRef] {
        &self.body.modules
    }
}

/// Signing key as configured by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKey {
    /// `sha256:` digest of the SPKI DER bytes.
    pub key_id: String,

    /// Only `Ed25519` is understood.
    pub algorithm: String,

    /// Standard base64 of the SPKI DER bytes.
    pub public_key: String,

    #[serde(default)]
    pub description: Option<String>,

    /// The key stops validating signatures after this instant.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A verified module ready for the host runtime.
#[derive(Debug)]
pub struct LoadedModule {
    /// Module name from the manifest.
    pub name: String,

    /// Content identifier.
    pub id: String,

    /// Verified payload.
    pub bytes: Bytes,
}

/// The resolved modules of one manifest, in manifest order.
///
/// Holds a cache pin on every module it references; the pins are released
/// when the set is dropped.
#[derive(Debug)]
pub struct ModuleSet {
    pub application_id: String,
    pub manifest_id: String,
    pub freshness: u64,
    modules: Vec<Arc<LoadedModule>>,
    _pins: Vec<PinGuard>,
}

impl ModuleSet {
    pub(crate) fn new(manifest: &Manifest, modules: Vec<Arc<LoadedModule>>, pins: Vec<PinGuard>) -> Self {
        Self {
            application_id: manifest.application_id().to_string(),
            manifest_id: manifest.id().to_string(),
            freshness: manifest.freshness(),
            modules,
            _pins: pins,
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LoadedModule>> {
        self.modules.iter()
    }

    /// Look up a module by name.
    pub fn get(&self, name: &str) -> Option<&Arc<LoadedModule>> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub(crate) fn into_modules(self) -> Vec<Arc<LoadedModule>> {
        self.modules
    }
}
