//! Sealing key material from a leader to a worker.
//!
//! The worker embeds an ephemeral X25519 public key in its attestation
//! document. The leader performs a Diffie-Hellman key exchange against it
//! with an ephemeral key of its own, encrypts the key bundle with ChaCha20
//! and ships its public key alongside the ciphertext. Both sides drop their
//! ephemeral secrets once the single transfer is done, so there are no
//! sessions to keep track of.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand_core::{CryptoRng, RngCore};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RatlsError {
    #[error("Cannot perform Diffie-Hellman on a connection that is already initialized")]
    AlreadyInitialized,
    #[error("Shared Secret was non-contributory. This suggests a man-in-the-middle attack.")]
    NonContributory,
    #[error("Cannot encrypt to a non-initialized channel")]
    NotInitialized,
    #[error("Public key must be 32 bytes, got {0} bytes")]
    PublicKeyLength(usize),
    #[error("Could not encrypt message")]
    Encryption,
    #[error("Could not decrypt message")]
    Decryption,
    #[error("Failed to serialize message with: {0}")]
    Serialize(serde_cbor::Error),
    #[error("Failed to deserialize message with: {0}")]
    Deserialize(serde_cbor::Error),
}

/// A ChaCha20 encrypted payload with nonce
#[derive(Debug, Clone)]
pub struct TlsCiphertext {
    payload: Vec<u8>,
    nonce: Nonce,
}

#[derive(Serialize, Deserialize)]
struct SimplifiedCiphertext {
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    #[serde(with = "serde_bytes")]
    nonce: Vec<u8>,
}

impl Serialize for TlsCiphertext {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let simplified = SimplifiedCiphertext {
            payload: self.payload.clone(),
            nonce: self.nonce.as_slice().to_vec(),
        };
        simplified.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TlsCiphertext {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let simplified = SimplifiedCiphertext::deserialize(deserializer)?;
        let nonce: [u8; 12] = simplified
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("ChaCha20 nonce must be 12 bytes"))?;
        Ok(Self {
            payload: simplified.payload,
            nonce: Nonce::from(nonce),
        })
    }
}

/// Key material sealed by the leader for one specific worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKeys {
    /// The leader's ephemeral public key
    pub leader_pk: [u8; 32],
    pub ciphertext: TlsCiphertext,
}

impl SealedKeys {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RatlsError> {
        serde_cbor::to_vec(self).map_err(RatlsError::Serialize)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatlsError> {
        serde_cbor::from_slice(bytes).map_err(RatlsError::Deserialize)
    }
}

/// One side of a key transfer.
/// It can be in two possible states:
///
///  * `Handshake` - holding an ephemeral key, waiting for the peer's
///  * `Initialized` - ready for sealing / opening the transfer
pub enum Connection {
    Handshake {
        ephemeral_key: x25519_dalek::EphemeralSecret,
    },
    Initialized {
        shared_key: ChaCha20Poly1305,
    },
}

impl Connection {
    /// Create a new connection, which creates an ephemeral key for
    /// Diffie-Hellman
    pub fn new(rng: impl CryptoRng + RngCore) -> Self {
        Self::Handshake {
            ephemeral_key: x25519_dalek::EphemeralSecret::random_from_rng(rng),
        }
    }

    /// The public part of our ephemeral key
    pub fn public_key(&self) -> Result<[u8; 32], RatlsError> {
        match self {
            Self::Handshake { ephemeral_key } => {
                Ok(x25519_dalek::PublicKey::from(ephemeral_key).to_bytes())
            }
            Self::Initialized { .. } => Err(RatlsError::AlreadyInitialized),
        }
    }

    /// Compute the shared ChaCha20 key for the connection.
    pub fn initialize(self, pk: &[u8]) -> Result<Self, RatlsError> {
        let Self::Handshake { ephemeral_key } = self else {
            return Err(RatlsError::AlreadyInitialized);
        };
        let pk: [u8; 32] = pk
            .try_into()
            .map_err(|_| RatlsError::PublicKeyLength(pk.len()))?;
        let shared_secret = ephemeral_key.diffie_hellman(&x25519_dalek::PublicKey::from(pk));
        let shared_key = if shared_secret.was_contributory() {
            ChaCha20Poly1305::new(Key::from_slice(shared_secret.as_bytes()))
        } else {
            return Err(RatlsError::NonContributory);
        };
        Ok(Self::Initialized { shared_key })
    }

    /// Serialize and encrypt a message with the session key
    pub fn encrypt_msg<T: Serialize, R: CryptoRng + RngCore>(
        &self,
        msg: &T,
        rng: &mut R,
    ) -> Result<TlsCiphertext, RatlsError> {
        let Self::Initialized { shared_key } = &self else {
            return Err(RatlsError::NotInitialized);
        };
        let payload = serde_cbor::to_vec(msg).map_err(RatlsError::Serialize)?;
        let nonce = ChaCha20Poly1305::generate_nonce(rng);
        let payload = shared_key
            .encrypt(&nonce, payload.as_slice())
            .map_err(|_| RatlsError::Encryption)?;
        Ok(TlsCiphertext { payload, nonce })
    }

    /// Decrypt and deserialize  message
    pub fn decrypt_msg<T: DeserializeOwned>(&self, msg: &TlsCiphertext) -> Result<T, RatlsError> {
        if let Self::Initialized { shared_key } = &self {
            shared_key
                .decrypt(&msg.nonce, &*msg.payload)
                .or(Err(RatlsError::Decryption))
                .and_then(|p| serde_cbor::from_slice(p.as_slice()).map_err(RatlsError::Deserialize))
        } else {
            Err(RatlsError::NotInitialized)
        }
    }
}

/// Leader side: seal `msg` to the worker's ephemeral public key.
pub fn seal<T: Serialize, R: CryptoRng + RngCore>(
    worker_pk: &[u8],
    msg: &T,
    rng: &mut R,
) -> Result<SealedKeys, RatlsError> {
    let conn = Connection::new(&mut *rng);
    let leader_pk = conn.public_key()?;
    let conn = conn.initialize(worker_pk)?;
    let ciphertext = conn.encrypt_msg(msg, rng)?;
    Ok(SealedKeys {
        leader_pk,
        ciphertext,
    })
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;

    #[test]
    fn test_seal_and_open() {
        let worker = Connection::new(OsRng);
        let worker_pk = worker.public_key().expect("Test failed");
        let sealed = seal(&worker_pk, &"secret".to_string(), &mut OsRng).expect("Test failed");
        let sealed = SealedKeys::from_bytes(&sealed.to_bytes().expect("Test failed"))
            .expect("Test failed");

        let worker = worker.initialize(&sealed.leader_pk).expect("Test failed");
        let opened: String = worker.decrypt_msg(&sealed.ciphertext).expect("Test failed");
        assert_eq!(opened, "secret");
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let worker = Connection::new(OsRng);
        let eavesdropper = Connection::new(OsRng);
        let sealed = seal(
            &worker.public_key().expect("Test failed"),
            &"secret".to_string(),
            &mut OsRng,
        )
        .expect("Test failed");
        let eavesdropper = eavesdropper
            .initialize(&sealed.leader_pk)
            .expect("Test failed");
        assert!(matches!(
            eavesdropper.decrypt_msg::<String>(&sealed.ciphertext),
            Err(RatlsError::Decryption)
        ));
    }

    /// The all-zero point yields a non-contributory shared secret
    #[test]
    fn test_low_order_key_rejected() {
        let conn = Connection::new(OsRng);
        assert!(matches!(
            conn.initialize(&[0u8; 32]),
            Err(RatlsError::NonContributory)
        ));
    }

    #[test]
    fn test_bad_key_length() {
        assert!(matches!(
            seal(&[1u8; 7], &0u8, &mut OsRng),
            Err(RatlsError::PublicKeyLength(7))
        ));
    }

    #[test]
    fn test_not_initialized() {
        let conn = Connection::new(OsRng);
        assert!(matches!(
            conn.encrypt_msg(&0u8, &mut OsRng),
            Err(RatlsError::NotInitialized)
        ));
    }
}
