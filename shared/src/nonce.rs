//! Nonces and the cache of nonces we issued ourselves.
//!
//! Every handshake starts with a party issuing a fresh nonce that the
//! counterpart has to embed in its attestation document. A nonce is only
//! accepted once: verification consumes it from the cache, so a captured
//! document cannot be replayed to trigger a second acceptance. Nonces that
//! are never consumed are evicted after a TTL.

use core::fmt;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of our nonces in bytes
pub const NONCE_LEN: usize = 20;

/// Default time after which an unconsumed nonce is forgotten
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Draw a fresh nonce from a cryptographically secure RNG
    pub fn random<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The Base64 form, which is how nonces are cached and compared
    pub fn b64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl From<[u8; NONCE_LEN]> for Nonce {
    fn from(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Nonce {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        <[u8; NONCE_LEN]>::try_from(bytes).map(Self).map_err(|_| {
            Error::MalformedInput(format!(
                "expected a nonce of {NONCE_LEN} bytes, got {} bytes",
                bytes.len()
            ))
        })
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Registry of nonces we issued and have not seen come back yet.
///
/// Entries are keyed by the Base64 form of the nonce and remember when they
/// were issued.
pub struct NonceCache {
    ttl: Duration,
    outstanding: Mutex<HashMap<String, Instant>>,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_TTL)
    }
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a new nonce and remember it as outstanding.
    pub fn issue(&self) -> Nonce {
        self.issue_with(&mut OsRng)
    }

    /// Like [`Self::issue`] but with a caller supplied RNG
    pub fn issue_with<R: CryptoRng + RngCore>(&self, rng: &mut R) -> Nonce {
        let nonce = Nonce::random(rng);
        let now = Instant::now();
        let mut outstanding = self.lock();
        // abandoned handshakes are evicted here
        outstanding.retain(|_, issued| now.duration_since(*issued) < self.ttl);
        outstanding.insert(nonce.b64(), now);
        nonce
    }

    /// Check whether we issued the given nonce and it is still usable.
    /// Does not consume it.
    pub fn is_outstanding(&self, b64: &str) -> bool {
        self.lock()
            .get(b64)
            .is_some_and(|issued| issued.elapsed() < self.ttl)
    }

    /// Atomically check and remove a nonce. Returns `false` if the
    /// nonce was never issued, was already consumed or has expired.
    pub fn consume(&self, b64: &str) -> bool {
        self.lock()
            .remove(b64)
            .is_some_and(|issued| issued.elapsed() < self.ttl)
    }

    /// Drop all expired entries, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let mut outstanding = self.lock();
        let before = outstanding.len();
        outstanding.retain(|_, issued| issued.elapsed() < self.ttl);
        before - outstanding.len()
    }

    /// Number of entries currently held, including expired ones
    /// that have not been evicted yet.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_consume_exactly_once() {
        let cache = NonceCache::default();
        let nonce = cache.issue();
        assert!(cache.is_outstanding(&nonce.b64()));
        assert!(cache.consume(&nonce.b64()));
        assert!(!cache.consume(&nonce.b64()));
        assert!(!cache.is_outstanding(&nonce.b64()));
    }

    #[test]
    fn test_unknown_nonce_rejected() {
        let cache = NonceCache::default();
        let _ = cache.issue();
        let stranger = Nonce::random(&mut OsRng);
        assert!(!cache.is_outstanding(&stranger.b64()));
        assert!(!cache.consume(&stranger.b64()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_is_outstanding_has_no_side_effects() {
        let cache = NonceCache::default();
        let nonce = cache.issue();
        for _ in 0..3 {
            assert!(cache.is_outstanding(&nonce.b64()));
        }
        assert!(cache.consume(&nonce.b64()));
    }

    #[test]
    fn test_expired_nonce_rejected_and_evicted() {
        let cache = NonceCache::new(Duration::ZERO);
        let nonce = cache.issue();
        assert!(!cache.is_outstanding(&nonce.b64()));
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
        assert!(!cache.consume(&nonce.b64()));
    }

    #[test]
    fn test_issue_evicts_abandoned_nonces() {
        let cache = NonceCache::new(Duration::ZERO);
        for _ in 0..10 {
            cache.issue();
        }
        // every issuance drops the previous, already expired, entries
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_consumers_accept_once() {
        let cache = Arc::new(NonceCache::default());
        let nonce = cache.issue().b64();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let nonce = nonce.clone();
                std::thread::spawn(move || cache.consume(&nonce))
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().expect("Test failed"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_nonce_from_wrong_length_bytes() {
        assert!(matches!(
            Nonce::try_from([0u8; 8].as_slice()),
            Err(Error::MalformedInput(_))
        ));
        let nonce = Nonce::try_from([7u8; NONCE_LEN].as_slice()).expect("Test failed");
        assert_eq!(nonce.as_bytes(), &[7u8; NONCE_LEN]);
    }
}
