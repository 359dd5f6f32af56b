//! Logic and types shared between the nitriding components: nonces, key
//! material, the attestation abstraction and the wire format.

pub mod aux_info;
pub mod communication;
pub mod error;
pub mod keys;
pub mod nonce;
pub mod ratls;
pub mod tee;

pub use aux_info::{AuxInfo, LeaderAuxInfo, WorkerAuxInfo};
pub use communication::*;
pub use error::{Error, Result, Role};
pub use keys::{EnclaveKeys, KeyStore};
pub use nonce::{NONCE_LEN, Nonce, NonceCache};
