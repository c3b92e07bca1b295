//! Trust-on-first-use host key verification
//!
//! The pinned key lives in the caller's configuration store as base64 of the
//! raw wire-format public key. This module only compares against it; the
//! caller persists [`Connection::connected_host_key`](super::Connection::connected_host_key)
//! after a first contact.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

/// Result of checking an observed key against the pinned one
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Nothing pinned yet; accepted and should be persisted by the caller
    FirstContact { fingerprint: String },
    /// Observed key is byte-for-byte the pinned key
    Verified,
    /// Observed key differs from the pinned key
    Mismatch { pinned: String, observed: String },
}

impl HostKeyVerification {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, HostKeyVerification::Mismatch { .. })
    }
}

/// `SHA256:<base64>` fingerprint of raw key bytes (padded standard base64)
pub fn fingerprint_sha256(raw: &[u8]) -> String {
    let hash = Sha256::digest(raw);
    format!("SHA256:{}", BASE64.encode(hash))
}

/// Base64 form stored as a `HostKeyRecord`
pub fn encode_host_key(raw: &[u8]) -> String {
    BASE64.encode(raw)
}

/// Compare `observed` against the pinned base64 key.
///
/// An empty pin, or one that does not decode, counts as first contact.
pub fn verify_pinned(pinned_b64: &str, observed: &[u8]) -> HostKeyVerification {
    let pinned_b64 = pinned_b64.trim();
    if pinned_b64.is_empty() {
        return HostKeyVerification::FirstContact {
            fingerprint: fingerprint_sha256(observed),
        };
    }

    let pinned = match BASE64.decode(pinned_b64) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Pinned host key is not valid base64 ({}), treating as first contact", e);
            return HostKeyVerification::FirstContact {
                fingerprint: fingerprint_sha256(observed),
            };
        }
    };

    if pinned.len() == observed.len() && bool::from(pinned.ct_eq(observed)) {
        HostKeyVerification::Verified
    } else {
        HostKeyVerification::Mismatch {
            pinned: fingerprint_sha256(&pinned),
            observed: fingerprint_sha256(observed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIFkA5XISfbLla9oqpJOorfjduHihD4Se40VCl7rlJlFV";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIKysbcP5vXWPwV+MJx7gopz5iwHR20jcIeK6NBtByFuA";

    fn raw(b64: &str) -> Vec<u8> {
        BASE64.decode(b64).unwrap()
    }

    #[test]
    fn test_fingerprint_matches_openssh() {
        assert_eq!(
            fingerprint_sha256(&raw(KEY_A)),
            "SHA256:DyoWY9iVRZUqykkw35HLJ/631KW09K19WerKdVOntHM="
        );
    }

    #[test]
    fn test_empty_pin_is_first_contact() {
        let result = verify_pinned("", &raw(KEY_A));
        assert!(result.is_accepted());
        assert!(matches!(result, HostKeyVerification::FirstContact { .. }));
    }

    #[test]
    fn test_same_key_verifies() {
        assert_eq!(verify_pinned(KEY_A, &raw(KEY_A)), HostKeyVerification::Verified);
    }

    #[test]
    fn test_different_key_mismatches() {
        let result = verify_pinned(KEY_A, &raw(KEY_B));
        assert_eq!(
            result,
            HostKeyVerification::Mismatch {
                pinned: "SHA256:DyoWY9iVRZUqykkw35HLJ/631KW09K19WerKdVOntHM=".into(),
                observed: "SHA256:VGhtj8kTgSqzgDtyZY1i9VfhQ9nS9ZEAHdahSG3VXqk=".into(),
            }
        );
        assert!(!result.is_accepted());
    }

    #[test]
    fn test_garbage_pin_is_first_contact() {
        let result = verify_pinned("not base64 !!", &raw(KEY_A));
        assert!(matches!(result, HostKeyVerification::FirstContact { .. }));
    }

    #[test]
    fn test_encode_roundtrips_record() {
        assert_eq!(encode_host_key(&raw(KEY_B)), KEY_B);
    }
}
