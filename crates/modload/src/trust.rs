//! Pinned signing keys and the policy manifests are checked against.
//!
//! Keys are pinned by the embedding application (compiled in or read from
//! configuration). A pinned key may expire and may be revoked locally;
//! either way it stops validating signatures but its metadata is kept.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use pkcs8::{DecodePublicKey, EncodePublicKey};
use tokio::sync::RwLock;
use tracing::debug;

use crate::digest::compute_key_id;
use crate::error::{LoaderError, LoaderResult};
use crate::types::TrustedKey;

/// What the store remembers about a pinned key.
#[derive(Debug, Clone)]
pub struct KeyMetadata {
    pub description: Option<String>,
    pub pinned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl KeyMetadata {
    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

#[derive(Debug, Clone)]
struct PinnedKey {
    key: VerifyingKey,
    meta: KeyMetadata,
}

/// Set of Ed25519 keys accepted for manifest signatures, keyed by key id.
///
/// Cloning is cheap; clones share the same keys.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    pinned: Arc<RwLock<HashMap<String, PinnedKey>>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a list of pinned keys, failing on the first bad one.
    pub async fn with_keys(keys: Vec<TrustedKey>) -> LoaderResult<Self> {
        let store = Self::new();
        for key in &keys {
            store.add_key(key).await?;
        }
        Ok(store)
    }

    /// Pin a key. The claimed key id must be the digest of its SPKI bytes.
    pub async fn add_key(&self, key: &TrustedKey) -> LoaderResult<()> {
        if !key.algorithm.eq_ignore_ascii_case("ed25519") {
            return Err(key_error(format!(
                "unsupported key algorithm: {}",
                key.algorithm
            )));
        }

        let spki = BASE64
            .decode(&key.public_key)
            .map_err(|e| key_error(format!("public key is not base64: {}", e)))?;
        let verifying_key = VerifyingKey::from_public_key_der(&spki)
            .map_err(|e| key_error(format!("public key is not Ed25519 SPKI: {}", e)))?;

        let expected_id = compute_key_id(&spki);
        if expected_id != key.key_id {
            return Err(key_error(format!(
                "key id {} does not match public key ({})",
                key.key_id, expected_id
            )));
        }

        let meta = KeyMetadata {
            description: key.description.clone(),
            pinned_at: Utc::now(),
            expires_at: key.expires_at,
            revoked: false,
        };
        self.pinned.write().await.insert(
            key.key_id.clone(),
            PinnedKey {
                key: verifying_key,
                meta,
            },
        );
        debug!(key_id = %key.key_id, "pinned signing key");
        Ok(())
    }

    /// Revoke a pinned key. Returns `false` if the key is unknown.
    pub async fn revoke(&self, key_id: &str) -> bool {
        match self.pinned.write().await.get_mut(key_id) {
            Some(pinned) => {
                pinned.meta.revoked = true;
                debug!(key_id = %key_id, "revoked signing key");
                true
            }
            None => false,
        }
    }

    /// Key for `key_id`, if it is pinned, unrevoked and unexpired.
    pub async fn usable_key(&self, key_id: &str) -> LoaderResult<VerifyingKey> {
        let pinned = self.pinned.read().await;
        match pinned.get(key_id) {
            Some(p) if p.meta.usable_at(Utc::now()) => Ok(p.key),
            Some(_) => Err(LoaderError::UntrustedManifest {
                reason: format!("key {} is revoked or expired", key_id),
            }),
            None => Err(LoaderError::UntrustedManifest {
                reason: format!("key {} is not pinned", key_id),
            }),
        }
    }

    pub async fn trusts(&self, key_id: &str) -> bool {
        self.usable_key(key_id).await.is_ok()
    }

    /// Ids of every pinned key, usable or not.
    pub async fn key_ids(&self) -> Vec<String> {
        self.pinned.read().await.keys().cloned().collect()
    }

    pub async fn metadata(&self, key_id: &str) -> Option<KeyMetadata> {
        self.pinned
            .read()
            .await
            .get(key_id)
            .map(|p| p.meta.clone())
    }
}

fn key_error(message: String) -> LoaderError {
    LoaderError::Config { message }
}

/// Describe a verifying key as a [`TrustedKey`] ready to pin.
pub fn pin_ed25519(key: &VerifyingKey, description: Option<&str>) -> LoaderResult<TrustedKey> {
    let spki = key
        .to_public_key_der()
        .map_err(|e| key_error(format!("failed to encode public key: {}", e)))?;
    Ok(TrustedKey {
        key_id: compute_key_id(spki.as_bytes()),
        algorithm: "Ed25519".to_string(),
        public_key: BASE64.encode(spki.as_bytes()),
        description: description.map(str::to_string),
        expires_at: None,
    })
}

/// What a manifest must satisfy to be accepted.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    /// Keys whose signatures are accepted.
    pub trust_store: TrustStore,

    /// Accept manifests without a valid signature (dev only).
    pub allow_unsigned: bool,
}

impl TrustPolicy {
    /// Require a signature from a key in `trust_store`.
    pub fn new(trust_store: TrustStore) -> Self {
        Self {
            trust_store,
            allow_unsigned: false,
        }
    }

    /// Accept any structurally valid manifest, signed or not.
    pub fn no_signature_checks() -> Self {
        Self::new(TrustStore::new()).with_allow_unsigned(true)
    }

    pub fn with_allow_unsigned(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    pub(crate) fn generate_trusted_key() -> (SigningKey, TrustedKey) {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let trusted = pin_ed25519(&signing_key.verifying_key(), Some("release key")).unwrap();
        (signing_key, trusted)
    }

    #[tokio::test]
    async fn test_unknown_key_is_untrusted() {
        let err = TrustStore::new()
            .usable_key("sha256:unknown")
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::UntrustedManifest { .. }));
    }

    #[tokio::test]
    async fn test_pinned_key_is_usable() {
        let (signing_key, trusted) = generate_trusted_key();
        let store = TrustStore::with_keys(vec![trusted.clone()]).await.unwrap();

        let key = store.usable_key(&trusted.key_id).await.unwrap();
        assert_eq!(key, signing_key.verifying_key());

        let meta = store.metadata(&trusted.key_id).await.unwrap();
        assert!(!meta.revoked);
        assert_eq!(meta.description.as_deref(), Some("release key"));
        assert_eq!(store.key_ids().await, vec![trusted.key_id]);
    }

    #[tokio::test]
    async fn test_claimed_id_must_match_public_key() {
        let store = TrustStore::new();
        let (_, mut trusted) = generate_trusted_key();
        trusted.key_id = "sha256:wrong".to_string();

        let err = store.add_key(&trusted).await.unwrap_err();
        assert!(matches!(err, LoaderError::Config { .. }));
        assert!(store.key_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_only_ed25519_accepted() {
        let (_, mut trusted) = generate_trusted_key();
        trusted.algorithm = "RSA".to_string();
        assert!(TrustStore::new().add_key(&trusted).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_public_key_rejected() {
        let (_, mut trusted) = generate_trusted_key();
        trusted.public_key = BASE64.encode(b"not a key");
        assert!(TrustStore::new().add_key(&trusted).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_key_stops_validating() {
        let (_, mut trusted) = generate_trusted_key();
        trusted.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        let store = TrustStore::with_keys(vec![trusted.clone()]).await.unwrap();

        assert!(!store.trusts(&trusted.key_id).await);
        assert!(store.metadata(&trusted.key_id).await.is_some());
    }

    #[tokio::test]
    async fn test_revoked_key_keeps_metadata() {
        let (_, trusted) = generate_trusted_key();
        let store = TrustStore::with_keys(vec![trusted.clone()]).await.unwrap();
        assert!(store.trusts(&trusted.key_id).await);

        assert!(store.revoke(&trusted.key_id).await);
        assert!(!store.trusts(&trusted.key_id).await);
        assert!(store.metadata(&trusted.key_id).await.unwrap().revoked);
        assert!(!store.revoke("sha256:unknown").await);
    }

    #[test]
    fn test_no_signature_checks_policy() {
        assert!(TrustPolicy::no_signature_checks().allow_unsigned);
        assert!(!TrustPolicy::new(TrustStore::new()).allow_unsigned);
    }
}
