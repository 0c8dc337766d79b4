//! Content-Addressed Template Store
//!
//! Persists biometric enrollments under owner-only paths:
//! - one file per fingerprint identity, named by the SHA-256 of the
//!   final merged template bytes
//! - one directory per face identity, keyed by the SHA-256 of the first
//!   accepted sample, containing numbered PNG files
//!
//! The digest is computed only from final, accepted bytes, so enrolling
//! byte-identical data always yields the same identity.

mod face;
mod fingerprint;

pub use face::FaceStore;
pub use fingerprint::FingerprintStore;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Largest fingerprint template the store will persist or read back.
pub const MAX_TEMPLATE_LEN: usize = 10 * 1024;

/// Upper bound on candidates loaded for verification.
pub const MAX_LOADED_TEMPLATES: usize = 100;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// No enrollment exists under the given identity
    #[error("identity {0} is not enrolled")]
    NotFound(String),

    /// Identity strings are lowercase hex digests; anything else is
    /// refused before it can reach the filesystem
    #[error("malformed identity {0:?}")]
    BadIdentity(String),

    /// Template exceeds [`MAX_TEMPLATE_LEN`]
    #[error("template of {0} bytes exceeds the size cap")]
    TooLarge(usize),

    /// Underlying filesystem failure
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sample image could not be encoded or decoded
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Deterministic identity digest: lowercase hex SHA-256 of the bytes.
pub fn identity_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Reject identities that are not plain hex digests. Identities double
/// as file names, so this is also the path-traversal guard.
pub(crate) fn validate_identity(id: &str) -> Result<(), StoreError> {
    let well_formed = !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
    if well_formed {
        Ok(())
    } else {
        Err(StoreError::BadIdentity(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_is_deterministic() {
        let a = identity_hash(b"composite-template");
        let b = identity_hash(b"composite-template");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, identity_hash(b"different-bytes"));
    }

    #[test]
    fn identity_validation_rejects_traversal() {
        assert!(validate_identity(&identity_hash(b"x")).is_ok());
        assert!(validate_identity("../etc/shadow").is_err());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("ABCDEF").is_err());
    }
}
