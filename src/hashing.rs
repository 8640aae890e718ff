//! Hashing System - SHA-256 fingerprints
//!
//! A slide's fingerprint covers everything that can change its page: the
//! engine, the renderer and the exact snapshot handed to it.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::ENGINE_VERSION;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// fingerprint = sha256(engine_version + renderer + snapshot)
pub fn slide_fingerprint(renderer: &str, snapshot: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ENGINE_VERSION.as_bytes());
    hasher.update([0]);
    hasher.update(renderer.as_bytes());
    hasher.update([0]);
    hasher.update(snapshot.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of a resolved presentation, independent of field order.
/// Going through `Value` sorts object keys (serde_json's default map).
pub fn digest<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let sorted = serde_json::to_value(value)?;
    Ok(sha256_hex(&serde_json::to_vec(&sorted)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_ignores_key_order() {
        let a = json!({"z": 1, "a": {"y": 2, "b": 3}});
        let b = json!({"a": {"b": 3, "y": 2}, "z": 1});
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
    }

    #[test]
    fn test_fingerprint_depends_on_every_input() {
        let base = slide_fingerprint("inkscape", "<svg/>");
        assert_eq!(base, slide_fingerprint("inkscape", "<svg/>"));
        assert_ne!(base, slide_fingerprint("other", "<svg/>"));
        assert_ne!(base, slide_fingerprint("inkscape", "<svg></svg>"));
        assert_eq!(base.len(), 64);
    }
}
