use sha2::{Digest, Sha256};

/// Prefix of every digest string produced by this crate.
pub(crate) const SHA256_PREFIX: &str = "sha256:";

/// Compute the `sha256:<hex>` digest of a byte payload.
pub fn compute_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize()))
}

/// Compute key ID from public key bytes (SPKI DER).
pub fn compute_key_id(spki_bytes: &[u8]) -> String {
    compute_digest(spki_bytes)
}

/// Whether `digest` is `sha256:` followed by 64 lowercase hex characters.
pub(crate) fn is_well_formed(digest: &str) -> bool {
    match digest.strip_prefix(SHA256_PREFIX) {
        Some(hex_part) => {
            hex_part.len() == 64
                && hex_part
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
                && hex::decode(hex_part).is_ok()
        }
        None => false,
    }
}

/// Hex part of a well-formed digest, used as a filesystem-safe key.
pub(crate) fn digest_hex(digest: &str) -> Option<&str> {
    if is_well_formed(digest) {
        digest.strip_prefix(SHA256_PREFIX)
    } else {
        None
    }
}
