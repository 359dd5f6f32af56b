//! An attester that does not run in a TEE.
//!
//! Documents have the same fields a Nitro attestation payload has, but are
//! plain CBOR without any signature. Everything above the hardware, in
//! particular the nonce freshness and PCR checks, behaves exactly as in
//! production, which makes this useful for exercising the protocol
//! without enclave hardware.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::{Error, Result};
use crate::tee::{AttestationRequest, Attester, Pcrs, VerifiedDocument};

/// Size of a SHA-384 PCR as reported by the Nitro hypervisor
pub const PCR_LEN: usize = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransparentDocument {
    pcrs: std::collections::BTreeMap<u32, ByteBuf>,
    nonce: Option<ByteBuf>,
    user_data: Option<ByteBuf>,
    public_key: Option<ByteBuf>,
    timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct TransparentAttester {
    pcrs: Pcrs,
}

impl Default for TransparentAttester {
    /// PCRs 0, 1 and 2 all zero, as for a debug-mode enclave
    fn default() -> Self {
        Self::with_pcrs((0..3).map(|ix| (ix, vec![0u8; PCR_LEN])).collect())
    }
}

impl TransparentAttester {
    pub fn with_pcrs(pcrs: Pcrs) -> Self {
        Self { pcrs }
    }
}

impl Attester for TransparentAttester {
    fn attest(&self, request: AttestationRequest) -> Result<Vec<u8>> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let doc = TransparentDocument {
            pcrs: self
                .pcrs
                .iter()
                .map(|(ix, pcr)| (*ix, ByteBuf::from(pcr.clone())))
                .collect(),
            nonce: request.nonce.map(ByteBuf::from),
            user_data: request.user_data.map(ByteBuf::from),
            public_key: request.public_key.map(ByteBuf::from),
            timestamp,
        };
        serde_cbor::to_vec(&doc).map_err(|e| Error::Transport(e.to_string()))
    }

    fn verify_document(&self, document: &[u8]) -> Result<VerifiedDocument> {
        let doc: TransparentDocument = serde_cbor::from_slice(document)
            .map_err(|e| Error::Verification(format!("could not parse document: {e}")))?;
        Ok(VerifiedDocument {
            pcrs: doc
                .pcrs
                .into_iter()
                .map(|(ix, pcr)| (ix, pcr.into_vec()))
                .collect(),
            nonce: doc.nonce.map(ByteBuf::into_vec),
            user_data: doc.user_data.map(ByteBuf::into_vec),
            public_key: doc.public_key.map(ByteBuf::into_vec),
        })
    }

    fn pcrs(&self) -> Result<Pcrs> {
        Ok(self.pcrs.clone())
    }
}
