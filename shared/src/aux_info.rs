//! The auxiliary information carried inside attestation documents
//! exchanged during key synchronization.
//!
//! Payloads carry their role as an explicit tag so that a document can
//! never be classified as both a worker's and a leader's payload.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Role};
use crate::nonce::Nonce;

/// Auxiliary information of the worker's attestation document.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAuxInfo {
    pub workers_nonce: Nonce,
    pub leaders_nonce: Nonce,
    /// The worker's ephemeral public key the leader seals key material to
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}

/// Auxiliary information of the leader's attestation document.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAuxInfo {
    pub workers_nonce: Nonce,
    /// The (sealed) key bundle being transferred
    #[serde(with = "serde_bytes")]
    pub enclave_keys: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuxInfo {
    Worker(WorkerAuxInfo),
    Leader(LeaderAuxInfo),
}

impl AuxInfo {
    pub fn role(&self) -> Role {
        match self {
            Self::Worker(_) => Role::Worker,
            Self::Leader(_) => Role::Leader,
        }
    }

    /// The worker's nonce, present in both shapes
    pub fn workers_nonce(&self) -> &Nonce {
        match self {
            Self::Worker(w) => &w.workers_nonce,
            Self::Leader(l) => &l.workers_nonce,
        }
    }

    /// The nonce the receiving party issued and now expects to see
    /// embedded: the leader's nonce in a worker's payload and vice versa.
    pub fn partner_nonce(&self) -> &Nonce {
        match self {
            Self::Worker(w) => &w.leaders_nonce,
            Self::Leader(l) => &l.workers_nonce,
        }
    }

    /// The value placed into the attestation's public key slot, if any
    pub fn public_key(&self) -> Option<&[u8]> {
        match self {
            Self::Worker(w) => Some(&w.public_key),
            Self::Leader(_) => None,
        }
    }

    /// Check that all required fields are present
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Worker(w) if w.public_key.is_empty() => Err(Error::MalformedInput(
                "worker's auxiliary information lacks a public key".to_string(),
            )),
            Self::Leader(l) if l.enclave_keys.is_empty() => Err(Error::MalformedInput(
                "leader's auxiliary information lacks enclave keys".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| Error::MalformedInput(e.to_string()))
    }

    /// Decode and validate a payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let aux: Self = serde_cbor::from_slice(bytes).map_err(|e| {
            Error::MalformedInput(format!("invalid auxiliary information: {e}"))
        })?;
        aux.validate()?;
        Ok(aux)
    }

    /// Unwrap a worker's payload, otherwise report protocol confusion
    pub fn into_worker(self) -> Result<WorkerAuxInfo> {
        match self {
            Self::Worker(w) => Ok(w),
            Self::Leader(_) => Err(Error::ProtocolConfusion {
                expected: Role::Worker,
                got: Role::Leader,
            }),
        }
    }

    /// Unwrap a leader's payload, otherwise report protocol confusion
    pub fn into_leader(self) -> Result<LeaderAuxInfo> {
        match self {
            Self::Leader(l) => Ok(l),
            Self::Worker(_) => Err(Error::ProtocolConfusion {
                expected: Role::Leader,
                got: Role::Worker,
            }),
        }
    }
}

impl From<WorkerAuxInfo> for AuxInfo {
    fn from(aux: WorkerAuxInfo) -> Self {
        Self::Worker(aux)
    }
}

impl From<LeaderAuxInfo> for AuxInfo {
    fn from(aux: LeaderAuxInfo) -> Self {
        Self::Leader(aux)
    }
}

impl fmt::Debug for WorkerAuxInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Worker's auxiliary info: worker's nonce: {}, leader's nonce: {}, public key: {}",
            self.workers_nonce,
            self.leaders_nonce,
            hex::encode(&self.public_key)
        )
    }
}

// key material stays out of the logs
impl fmt::Debug for LeaderAuxInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Leader's auxiliary info: worker's nonce: {}, enclave keys: <{} bytes>",
            self.workers_nonce,
            self.enclave_keys.len()
        )
    }
}
