//! Manifest verification (structure, signature and freshness).
//!
//! A raw manifest is a JSON DSSE envelope whose payload is the JSON
//! [`ManifestBody`]. Verification:
//!
//! 1. Parse the envelope and payload (`MalformedManifest`)
//! 2. Validate module references (`MalformedManifest`)
//! 3. Verify an Ed25519 signature over the PAE from a trusted key (`UntrustedManifest`)
//! 4. Compare the freshness token with the last accepted manifest (`StaleManifest`)
//!
//! Verification never records anything; call [`ManifestVerifier::accept`]
//! once the manifest's modules have been loaded. Two loads of the same
//! application may both pass step 4; `accept` re-checks under the write lock
//! so only the fresher one is recorded.

use std::collections::{HashMap, HashSet};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::RwLock;
use tracing::debug;

use crate::digest::{compute_digest, compute_key_id, is_well_formed};
use crate::error::{LoaderError, LoaderResult};
use crate::trust::TrustPolicy;
use crate::types::{DsseEnvelope, Manifest, ManifestBody};

mod dsse;

/// Payload type for manifest bodies (DSSE-style binding).
pub const PAYLOAD_TYPE_MANIFEST_V1: &str = "application/vnd.modload.manifest+json;v=1";

/// Last accepted manifest for an application.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AcceptedManifest {
    freshness: u64,
    digest: String,
}

/// Verifies manifests and tracks the freshness high-water mark per application.
#[derive(Debug, Default)]
pub struct ManifestVerifier {
    accepted: RwLock<HashMap<String, AcceptedManifest>>,
}

impl ManifestVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify raw manifest bytes against a trust policy.
    pub async fn verify(&self, raw: &[u8], policy: &TrustPolicy) -> LoaderResult<Manifest> {
        let envelope: DsseEnvelope =
            serde_json::from_slice(raw).map_err(|e| LoaderError::MalformedManifest {
                reason: format!("invalid envelope: {}", e),
            })?;

        if envelope.payload_type != PAYLOAD_TYPE_MANIFEST_V1 {
            return Err(LoaderError::MalformedManifest {
                reason: format!(
                    "payload type mismatch: expected {}, got {}",
                    PAYLOAD_TYPE_MANIFEST_V1, envelope.payload_type
                ),
            });
        }

        let payload_bytes =
            BASE64
                .decode(&envelope.payload)
                .map_err(|e| LoaderError::MalformedManifest {
                    reason: format!("invalid base64 payload: {}", e),
                })?;

        let body: ManifestBody =
            serde_json::from_slice(&payload_bytes).map_err(|e| LoaderError::MalformedManifest {
                reason: format!("invalid manifest body: {}", e),
            })?;
        validate_body(&body)?;

        let key_id = if policy.allow_unsigned {
            None
        } else {
            Some(dsse::verify_signatures(&payload_bytes, &envelope, &policy.trust_store).await?)
        };

        let digest = canonical_digest(&body)?;
        check_freshness(
            self.accepted.read().get(&body.application_id),
            &body,
            &digest,
        )?;

        debug!(
            application_id = %body.application_id,
            manifest_id = %body.id,
            freshness = body.freshness,
            key_id = ?key_id,
            "manifest verified"
        );

        Ok(Manifest {
            body,
            digest,
            key_id,
            locator: None,
        })
    }

    /// Verify a manifest fetched for `application_id`.
    ///
    /// Rejects manifests issued for a different application.
    pub async fn verify_for(
        &self,
        application_id: &str,
        raw: &[u8],
        policy: &TrustPolicy,
    ) -> LoaderResult<Manifest> {
        let manifest = self.verify(raw, policy).await?;
        if manifest.application_id() != application_id {
            return Err(LoaderError::MalformedManifest {
                reason: format!(
                    "manifest is for application {}, expected {}",
                    manifest.application_id(),
                    application_id
                ),
            });
        }
        Ok(manifest)
    }

    /// Record `manifest` as the last accepted one for its application.
    ///
    /// Fails with `StaleManifest` if a manifest at least as fresh was
    /// accepted since `manifest` was verified.
    pub fn accept(&self, manifest: &Manifest) -> LoaderResult<()> {
        let mut accepted = self.accepted.write();
        check_freshness(
            accepted.get(manifest.application_id()),
            &manifest.body,
            &manifest.digest,
        )?;
        accepted.insert(
            manifest.application_id().to_string(),
            AcceptedManifest {
                freshness: manifest.freshness(),
                digest: manifest.digest.clone(),
            },
        );
        Ok(())
    }

    /// Restore a previously accepted freshness (e.g., from persisted state).
    ///
    /// Never lowers the high-water mark.
    pub fn seed(&self, application_id: &str, freshness: u64, digest: &str) {
        let mut accepted = self.accepted.write();
        match accepted.get(application_id) {
            Some(current) if current.freshness > freshness => {}
            _ => {
                accepted.insert(
                    application_id.to_string(),
                    AcceptedManifest {
                        freshness,
                        digest: digest.to_string(),
                    },
                );
            }
        }
    }

    /// Freshness of the last accepted manifest for an application.
    pub fn accepted_freshness(&self, application_id: &str) -> Option<u64> {
        self.accepted
            .read()
            .get(application_id)
            .map(|a| a.freshness)
    }
}

fn check_freshness(
    current: Option<&AcceptedManifest>,
    body: &ManifestBody,
    digest: &str,
) -> LoaderResult<()> {
    let Some(current) = current else {
        return Ok(());
    };

    // The exact manifest already loaded is unchanged, not a replay.
    if body.freshness == current.freshness && digest == current.digest {
        return Ok(());
    }

    if body.freshness <= current.freshness {
        return Err(LoaderError::StaleManifest {
            application_id: body.application_id.clone(),
            offered: body.freshness,
            accepted: current.freshness,
        });
    }

    Ok(())
}

/// Digest of the JCS canonical form of a manifest body.
pub(crate) fn canonical_digest(body: &ManifestBody) -> LoaderResult<String> {
    let canonical = serde_jcs::to_vec(body).map_err(|e| LoaderError::MalformedManifest {
        reason: format!("failed to canonicalize manifest: {}", e),
    })?;
    Ok(compute_digest(&canonical))
}

fn validate_body(body: &ManifestBody) -> LoaderResult<()> {
    let malformed = |reason: String| Err(LoaderError::MalformedManifest { reason });

    if body.application_id.is_empty() {
        return malformed("empty application_id".to_string());
    }
    if body.id.is_empty() {
        return malformed("empty manifest id".to_string());
    }

    let mut sizes: HashMap<&str, u64> = HashMap::new();
    let mut names = HashSet::new();
    for module in &body.modules {
        if module.name.is_empty() || module.url.is_empty() {
            return malformed(format!("module {:?} has an empty name or url", module.name));
        }
        if !names.insert(module.name.as_str()) {
            return malformed(format!("duplicate module name {}", module.name));
        }
        if !is_well_formed(&module.digest) {
            return malformed(format!(
                "module {} has malformed digest {}",
                module.name, module.digest
            ));
        }
        if let Some(size) = sizes.insert(module.content_id(), module.size) {
            if size != module.size {
                return malformed(format!(
                    "content id {} listed with sizes {} and {}",
                    module.digest, size, module.size
                ));
            }
        }
    }

    Ok(())
}

/// Compute key ID from a VerifyingKey.
pub fn compute_key_id_from_key(key: &VerifyingKey) -> LoaderResult<String> {
    use pkcs8::EncodePublicKey;
    let doc = key.to_public_key_der().map_err(|e| LoaderError::Config {
        message: format!("failed to encode public key: {}", e),
    })?;
    Ok(compute_key_id(doc.as_bytes()))
}

/// Encode and sign a manifest body (publisher side).
pub fn sign_manifest(body: &ManifestBody, signing_key: &SigningKey) -> LoaderResult<Vec<u8>> {
    let key_id = compute_key_id_from_key(&signing_key.verifying_key())?;
    encode_envelope(body, |payload| {
        vec![dsse::sign(
            PAYLOAD_TYPE_MANIFEST_V1,
            payload,
            signing_key,
            &key_id,
        )]
    })
}

/// Encode a manifest body without signatures.
pub fn unsigned_manifest(body: &ManifestBody) -> LoaderResult<Vec<u8>> {
    encode_envelope(body, |_| Vec::new())
}

fn encode_envelope<F>(body: &ManifestBody, signatures: F) -> LoaderResult<Vec<u8>>
where
    F: FnOnce(&[u8]) -> Vec<crate::types::DsseSignature>,
{
    let payload = serde_json::to_vec(body).map_err(|e| LoaderError::MalformedManifest {
        reason: format!("failed to encode manifest body: {}", e),
    })?;
    let envelope = DsseEnvelope {
        payload_type: PAYLOAD_TYPE_MANIFEST_V1.to_string(),
        payload: BASE64.encode(&payload),
        signatures: signatures(&payload),
    };
    serde_json::to_vec(&envelope).map_err(|e| LoaderError::MalformedManifest {
        reason: format!("failed to encode envelope: {}", e),
    })
}
