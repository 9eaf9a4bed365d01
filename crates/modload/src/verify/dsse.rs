//! Signature layer: DSSE pre-authentication encoding, signing and checking.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};

use crate::error::{LoaderError, LoaderResult};
use crate::trust::TrustStore;
use crate::types::{DsseEnvelope, DsseSignature};

/// `"DSSEv1" SP len(type) SP type SP len(payload) SP payload`
pub(crate) fn build_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!(
        "DSSEv1 {} {} {} ",
        payload_type.len(),
        payload_type,
        payload.len()
    );
    let mut pae = Vec::with_capacity(header.len() + payload.len());
    pae.extend_from_slice(header.as_bytes());
    pae.extend_from_slice(payload);
    pae
}

/// Key id of the first signature that a usable pinned key validates.
pub(crate) async fn verify_signatures(
    payload: &[u8],
    envelope: &DsseEnvelope,
    trust_store: &TrustStore,
) -> LoaderResult<String> {
    let pae = build_pae(&envelope.payload_type, payload);

    let mut rejections = Vec::new();
    for entry in &envelope.signatures {
        match check_signature(&pae, entry, trust_store).await {
            Ok(()) => return Ok(entry.key_id.clone()),
            Err(e) => rejections.push(e.to_string()),
        }
    }

    let reason = if rejections.is_empty() {
        "manifest is unsigned".to_string()
    } else {
        rejections.join("; ")
    };
    Err(LoaderError::UntrustedManifest { reason })
}

async fn check_signature(
    pae: &[u8],
    entry: &DsseSignature,
    trust_store: &TrustStore,
) -> LoaderResult<()> {
    let key = trust_store.usable_key(&entry.key_id).await?;

    let untrusted = |reason: String| LoaderError::UntrustedManifest { reason };
    let raw = BASE64
        .decode(&entry.signature)
        .map_err(|e| untrusted(format!("signature by {} is not base64: {}", entry.key_id, e)))?;
    let signature = Signature::from_slice(&raw)
        .map_err(|e| untrusted(format!("signature by {} is malformed: {}", entry.key_id, e)))?;

    key.verify(pae, &signature)
        .map_err(|_| untrusted(format!("signature by {} does not match", entry.key_id)))
}

pub(crate) fn sign(
    payload_type: &str,
    payload: &[u8],
    signing_key: &SigningKey,
    key_id: &str,
) -> DsseSignature {
    let signature = signing_key.sign(&build_pae(payload_type, payload));
    DsseSignature {
        key_id: key_id.to_string(),
        signature: BASE64.encode(signature.to_bytes()),
    }
}
