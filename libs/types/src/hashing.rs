//! Stable hashing utilities for keys and payload fingerprints
//!
//! Every key in the warehouse is derived from these functions, so their
//! output format is part of the storage contract:
//! - `md5_hex`: lowercase 32-char hex, identical to `TO_HEX(MD5(..))`
//! - `surrogate_key`: ordered tuple → MD5 hex (128 bits of hash space)
//! - `fingerprint_i64`: non-negative 63-bit integer key
//! - `sha256_hex`: payload and state integrity hashes

use md5::{Digest as _, Md5};
use sha2::Sha256;

use crate::ids::SurrogateKey;

/// Delimiter placed between surrogate key fields.
pub const FIELD_DELIMITER: &str = "-";

/// Token substituted for a null field, so `(None, "a")` and `("", "a")`
/// hash differently.
pub const NULL_TOKEN: &str = "_null_";

/// MD5 digest of `input`, hex-encoded.
pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// SHA-256 digest of `bytes`, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Deterministic surrogate key for an ordered tuple of field values.
///
/// Nulls become [`NULL_TOKEN`], fields are joined with [`FIELD_DELIMITER`]
/// and the result is MD5-hashed. Field order matters.
pub fn surrogate_key<I, S>(fields: I) -> SurrogateKey
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let joined = fields
        .into_iter()
        .map(|f| match f {
            Some(v) => v.as_ref().to_string(),
            None => NULL_TOKEN.to_string(),
        })
        .collect::<Vec<_>>()
        .join(FIELD_DELIMITER);
    SurrogateKey::from_hex(md5_hex(&joined))
}

/// Non-negative 63-bit integer fingerprint of `input`.
///
/// Takes the first eight bytes of the MD5 digest (big-endian) and clears the
/// sign bit, so the result can never collide with negative sentinel keys.
pub fn fingerprint_i64(input: &str) -> i64 {
    let digest = Md5::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) & (i64::MAX as u64)) as i64
}
