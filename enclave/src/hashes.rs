//! Hashes bound into the attestation documents handed out to clients.
//!
//! Clients use them to tie the attestation document, which acts as the
//! root of trust, to the key material used by nitriding's TLS server and
//! by the enclave application.

use std::sync::{PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use shared::{Error, Result};

pub const HASH_LEN: usize = 32;
const HASH_PREFIX: &str = "sha256:";
const HASH_SEPARATOR: &str = ";";

/// Longest request body accepted when registering a hash: the Base64
/// encoding of a SHA-256 digest plus a trailing newline.
pub const MAX_HASH_BODY_LEN: usize = HASH_LEN.div_ceil(3) * 4 + 1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Hashes {
    tls_key_hash: [u8; HASH_LEN],
    app_key_hash: [u8; HASH_LEN],
}

#[derive(Debug, Default)]
pub struct AttestationHashes {
    inner: RwLock<Hashes>,
}

impl AttestationHashes {
    pub fn set_tls_key_hash(&self, hash: [u8; HASH_LEN]) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .tls_key_hash = hash;
    }

    pub fn set_app_key_hash(&self, hash: [u8; HASH_LEN]) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .app_key_hash = hash;
    }

    /// The user data of attestation documents:
    /// `sha256:<tls key hash>;sha256:<app key hash>` with raw hash bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let hashes = *self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::with_capacity(2 * (HASH_PREFIX.len() + HASH_LEN) + 1);
        out.extend_from_slice(HASH_PREFIX.as_bytes());
        out.extend_from_slice(&hashes.tls_key_hash);
        out.extend_from_slice(HASH_SEPARATOR.as_bytes());
        out.extend_from_slice(HASH_PREFIX.as_bytes());
        out.extend_from_slice(&hashes.app_key_hash);
        out
    }
}

pub fn sha256(bytes: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(bytes).into()
}

/// Parse the body of a hash registration: Base64 of a SHA-256 digest,
/// optionally surrounded by whitespace.
pub fn parse_app_key_hash(body: &str) -> Result<[u8; HASH_LEN]> {
    if body.len() > MAX_HASH_BODY_LEN {
        return Err(Error::MalformedInput(format!(
            "hash body exceeds {MAX_HASH_BODY_LEN} bytes"
        )));
    }
    let hash = STANDARD
        .decode(body.trim())
        .map_err(|_| Error::MalformedInput("hash is not valid Base64".to_string()))?;
    hash.try_into()
        .map_err(|_| Error::MalformedInput("given hash is of invalid size".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_layout() {
        let hashes = AttestationHashes::default();
        hashes.set_tls_key_hash([1; HASH_LEN]);
        hashes.set_app_key_hash([2; HASH_LEN]);
        let ser = hashes.serialize();
        assert_eq!(ser.len(), 2 * (7 + HASH_LEN) + 1);
        assert_eq!(&ser[..7], b"sha256:");
        assert_eq!(&ser[7..39], &[1; HASH_LEN]);
        assert_eq!(ser[39], b';');
        assert_eq!(&ser[40..47], b"sha256:");
        assert_eq!(&ser[47..], &[2; HASH_LEN]);
    }

    #[test]
    fn test_parse_app_key_hash() {
        let digest = sha256(b"application public key");
        let body = format!("{}\n", STANDARD.encode(digest));
        assert_eq!(body.len(), MAX_HASH_BODY_LEN);
        assert_eq!(parse_app_key_hash(&body).expect("Test failed"), digest);
    }

    #[test]
    fn test_parse_rejects_bad_hashes() {
        // too long
        let body = format!("{}\n\n", STANDARD.encode([0u8; HASH_LEN]));
        assert!(matches!(
            parse_app_key_hash(&body),
            Err(Error::MalformedInput(_))
        ));
        // not Base64
        assert!(parse_app_key_hash("not base64!").is_err());
        // wrong size
        assert!(parse_app_key_hash(&STANDARD.encode([0u8; 16])).is_err());
    }
}
