//! Row digests shared by connectors that compute checksums client-side.
//!
//! A row is hashed as the MD5 of its canonical JSON field list, so two stores
//! holding the same field names and values produce the same digest regardless
//! of how they keep them internally.

use md5::{Digest, Md5};
use serde_json::Value;

use super::{ConnectorError, ConnectorResult};

/// MD5 digest of a row's `(name, value)` pairs, in the given order.
pub fn record_digest(fields: &[(String, Value)]) -> ConnectorResult<[u8; 16]> {
    let canonical = serde_json::to_vec(fields)
        .map_err(|e| ConnectorError::InvalidResponse(format!("row is not serializable: {}", e)))?;
    let mut hasher = Md5::new();
    hasher.update(&canonical);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// Lowercase hex form used by [`super::IndividualChecksum::hash`].
pub fn digest_hex(digest: &[u8; 16]) -> String {
    hex::encode(digest)
}
