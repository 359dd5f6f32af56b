//! The trusted part of nitriding: key synchronization between enclaves,
//! attestation on behalf of the enclave application and the logic behind
//! the enclave's endpoints.

pub mod handlers;
pub mod hashes;
#[cfg(feature = "nitro")]
pub mod nitro;
pub mod ready;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use shared::tee::Attester;
use shared::{KeyStore, NonceCache};

use crate::hashes::AttestationHashes;
use crate::ready::ReadyLatch;

/// Default upper bound on a complete key synchronization handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables of an [`Enclave`]
#[derive(Debug, Clone)]
pub struct Settings {
    /// How long an issued nonce stays valid
    pub nonce_ttl: Duration,
    /// Deadline for a key synchronization, including all network
    /// and hardware calls
    pub handshake_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nonce_ttl: shared::nonce::DEFAULT_NONCE_TTL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Everything the enclave's tasks share. Cloning is cheap and yields a
/// handle to the same state.
pub struct Enclave<A> {
    attester: Arc<A>,
    keys: Arc<KeyStore>,
    nonces: Arc<NonceCache>,
    hashes: Arc<AttestationHashes>,
    ready: ReadyLatch,
    settings: Settings,
}

impl<A> Clone for Enclave<A> {
    fn clone(&self) -> Self {
        Self {
            attester: self.attester.clone(),
            keys: self.keys.clone(),
            nonces: self.nonces.clone(),
            hashes: self.hashes.clone(),
            ready: self.ready.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<A: Attester> Enclave<A> {
    pub fn new(attester: A, settings: Settings) -> Self {
        Self::with_keys(attester, settings, Arc::new(KeyStore::default()))
    }

    /// Create an enclave around an existing key store
    pub fn with_keys(attester: A, settings: Settings, keys: Arc<KeyStore>) -> Self {
        Self {
            attester: Arc::new(attester),
            keys,
            nonces: Arc::new(NonceCache::new(settings.nonce_ttl)),
            hashes: Arc::new(AttestationHashes::default()),
            ready: ReadyLatch::new(),
            settings,
        }
    }

    pub fn attester(&self) -> &Arc<A> {
        &self.attester
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn nonces(&self) -> &Arc<NonceCache> {
        &self.nonces
    }

    pub fn hashes(&self) -> &AttestationHashes {
        &self.hashes
    }

    pub fn ready(&self) -> &ReadyLatch {
        &self.ready
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Install nitriding's own TLS key and certificate and bind the
    /// certificate's hash into future attestation documents.
    pub fn set_nitriding_keys(&self, key: Vec<u8>, cert: Vec<u8>) {
        let tls_key_hash = hashes::sha256(&cert);
        self.keys.set_nitriding_keys(key, cert);
        self.hashes.set_tls_key_hash(tls_key_hash);
    }
}
