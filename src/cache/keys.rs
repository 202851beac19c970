//! Key and Namespace Codec
//!
//! Turns logical keys and namespaces into fixed-length hashed identifiers and
//! joins them into storage keys.

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{CacheError, Result};

// == Public Constants ==
/// Tag prepended to storage keys in shared, multi-tenant stores.
pub const GLOBAL_SIGNATURE: &str = "polycache";

/// Marker standing in for an unset namespace. Never a valid hex digest.
pub const NAMESPACE_WILDCARD: &str = "*";

/// Separator between composite storage key parts.
pub const KEY_SEPARATOR: char = ':';

// == Hash Algorithm ==
/// Digest used to hash keys and namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    /// 128-bit MD5, rendered as 32 hex characters
    #[default]
    Md5,
    /// 160-bit SHA-1
    Sha1,
    /// 256-bit SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Hex digest of `input`.
    pub fn digest_hex(&self, input: &str) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(input.as_bytes())),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown hash algorithm '{}'",
                other
            ))),
        }
    }
}

// == Hash Key ==
/// Hashes a single logical key.
///
/// Fails with `InvalidArgument` when the key is empty.
pub fn hash_key(key: &str, algorithm: HashAlgorithm) -> Result<String> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument(
            "invalid key: key must be a non-empty string".to_string(),
        ));
    }
    Ok(algorithm.digest_hex(key))
}

// == Hash Many Keys ==
/// Hashes every key of a batch.
///
/// Validation is all-or-nothing: one invalid key fails the whole batch.
pub fn hash_many_keys<S: AsRef<str>>(keys: &[S], algorithm: HashAlgorithm) -> Result<Vec<String>> {
    keys.iter()
        .map(|key| hash_key(key.as_ref(), algorithm))
        .collect()
}

// == Hash Namespace ==
/// Hashes a namespace, mapping an unset or empty namespace to the wildcard.
pub fn hash_namespace(namespace: Option<&str>, algorithm: HashAlgorithm) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => algorithm.digest_hex(ns),
        _ => NAMESPACE_WILDCARD.to_string(),
    }
}

// == Composite ==
/// Joins namespace and key hashes into a storage key.
///
/// The global signature is only prepended for shared stores.
pub fn composite(namespace_hash: &str, key_hash: &str, with_global_signature: bool) -> String {
    if with_global_signature {
        format!(
            "{GLOBAL_SIGNATURE}{KEY_SEPARATOR}{namespace_hash}{KEY_SEPARATOR}{key_hash}"
        )
    } else {
        format!("{namespace_hash}{KEY_SEPARATOR}{key_hash}")
    }
}
