//! Key material held by the enclave.
//!
//! The TLS key and certificate of nitriding itself and whatever the enclave
//! application wants to store are managed by a leader enclave and, if the
//! deployment is horizontally scaled, synced to worker enclaves. The bundle
//! is only ever read and written as a whole under one lock so that readers
//! never observe a half-applied sync.

use core::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct EnclaveKeys {
    #[serde(with = "serde_bytes")]
    pub nitriding_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub nitriding_cert: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub app_keys: Vec<u8>,
}

impl EnclaveKeys {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| Error::MalformedInput(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(bytes)
            .map_err(|e| Error::MalformedInput(format!("invalid enclave keys: {e}")))
    }
}

impl fmt::Debug for EnclaveKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveKeys")
            .field("nitriding_key", &format_args!("<{} bytes>", self.nitriding_key.len()))
            .field("nitriding_cert", &format_args!("<{} bytes>", self.nitriding_cert.len()))
            .field("app_keys", &format_args!("<{} bytes>", self.app_keys.len()))
            .finish()
    }
}

/// Thread safe holder of the enclave's [`EnclaveKeys`].
///
/// Lives as long as the enclave process and is shared by reference
/// between the TLS server, the application facing handlers and the
/// sync logic.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<EnclaveKeys>,
}

impl KeyStore {
    pub fn new(keys: EnclaveKeys) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// A copy of the entire bundle
    pub fn get(&self) -> EnclaveKeys {
        self.read().clone()
    }

    pub fn app_keys(&self) -> Vec<u8> {
        self.read().app_keys.clone()
    }

    pub fn set_app_keys(&self, app_keys: Vec<u8>) {
        self.write().app_keys = app_keys;
    }

    pub fn set_nitriding_keys(&self, key: Vec<u8>, cert: Vec<u8>) {
        let mut keys = self.write();
        keys.nitriding_key = key;
        keys.nitriding_cert = cert;
    }

    /// Replace the whole bundle, used after a successful sync
    pub fn set(&self, new_keys: EnclaveKeys) {
        *self.write() = new_keys;
    }

    /// Byte-wise comparison of all fields against `other`
    pub fn equal(&self, other: &EnclaveKeys) -> bool {
        *self.read() == *other
    }

    fn read(&self) -> RwLockReadGuard<'_, EnclaveKeys> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EnclaveKeys> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn bundle(tag: u8) -> EnclaveKeys {
        EnclaveKeys {
            nitriding_key: vec![tag; 4],
            nitriding_cert: vec![tag; 8],
            app_keys: vec![tag; 16],
        }
    }

    #[test]
    fn test_set_then_get() {
        let store = KeyStore::default();
        assert_eq!(store.get(), EnclaveKeys::default());
        store.set(bundle(1));
        assert_eq!(store.get(), bundle(1));
        assert_eq!(store.app_keys(), vec![1; 16]);
    }

    #[test]
    fn test_partial_setters() {
        let store = KeyStore::new(bundle(1));
        store.set_app_keys(vec![9; 3]);
        assert_eq!(store.get().nitriding_key, vec![1; 4]);
        assert_eq!(store.app_keys(), vec![9; 3]);

        store.set_nitriding_keys(vec![5], vec![6]);
        let keys = store.get();
        assert_eq!(keys.nitriding_key, vec![5]);
        assert_eq!(keys.nitriding_cert, vec![6]);
        assert_eq!(keys.app_keys, vec![9; 3]);
    }

    #[test]
    fn test_equal() {
        let a = KeyStore::new(bundle(1));
        let b = KeyStore::new(bundle(1));
        // reflexive and symmetric
        assert!(a.equal(&a.get()));
        assert!(a.equal(&b.get()));
        assert!(b.equal(&a.get()));

        // any single field differing breaks equality
        let mut other = bundle(1);
        other.nitriding_key = vec![2; 4];
        assert!(!a.equal(&other));
        let mut other = bundle(1);
        other.nitriding_cert = vec![2; 8];
        assert!(!a.equal(&other));
        let mut other = bundle(1);
        other.app_keys.push(0);
        assert!(!a.equal(&other));
    }

    #[test]
    fn test_readers_never_see_torn_bundles() {
        let store = Arc::new(KeyStore::new(bundle(0)));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for tag in 1..=50u8 {
                    store.set(bundle(tag));
                }
            })
        };
        for _ in 0..200 {
            let keys = store.get();
            let tag = keys.nitriding_key[0];
            assert_eq!(keys, bundle(tag));
        }
        writer.join().expect("Test failed");
    }

    #[test]
    fn test_debug_redacts() {
        let dbg = format!("{:?}", bundle(0xAB));
        assert!(dbg.contains("<16 bytes>"));
        assert!(!dbg.contains("171"));
    }
}
