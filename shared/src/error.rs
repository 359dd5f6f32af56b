//! Errors surfaced by the key synchronization core

use core::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::MsgError;
use crate::ratls::RatlsError;

pub type Result<T> = std::result::Result<T, Error>;

/// The two roles a replica can take during key synchronization
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => f.write_str("leader"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    #[error("Error verifying attestation document: {0}")]
    Verification(String),
    #[error("PCR values of remote enclave not identical to ours")]
    ImageMismatch,
    #[error("Nonce {0} is not in our cache")]
    ReplayOrUnknownNonce(String),
    #[error("Expected {expected}'s auxiliary information but received {got}'s")]
    ProtocolConfusion { expected: Role, got: Role },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Operation did not complete within {0:?}")]
    Timeout(Duration),
    #[error("No key material has been set")]
    NoKeyMaterial,
    #[error("The enclave application has not signalled readiness")]
    NotReady,
}

impl From<MsgError> for Error {
    fn from(err: MsgError) -> Self {
        match err {
            MsgError::Io(e) => Self::Transport(e.to_string()),
            MsgError::Closed => Self::Transport(err.to_string()),
            MsgError::Serialize(e) => Self::Transport(e.to_string()),
            err => Self::MalformedInput(err.to_string()),
        }
    }
}

impl From<RatlsError> for Error {
    fn from(err: RatlsError) -> Self {
        Self::Verification(err.to_string())
    }
}
