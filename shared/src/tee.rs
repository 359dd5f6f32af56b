//! Traits to abstract away the attestation capabilities of a particular TEE.
//!
//! An [`Attester`] only has to provide the hardware primitives: producing a
//! signed attestation document over a nonce / user data / public key triple,
//! verifying such a document and reporting our own PCR values. Turning
//! auxiliary information into documents and back is shared logic on top.

pub mod transparent;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aux_info::AuxInfo;
use crate::error::{Error, Result};
use crate::nonce::Nonce;

/// Measurement registers, indexed by register number
pub type Pcrs = BTreeMap<u32, Vec<u8>>;

/// The fields a caller may ask the hardware to sign
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttestationRequest {
    pub nonce: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
}

/// The contents of an attestation document whose signature and
/// validity were checked.
#[derive(Debug, Clone, Default)]
pub struct VerifiedDocument {
    pub pcrs: Pcrs,
    pub nonce: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
}

/// What is sent over the wire during key synchronization: the signed
/// document plus the auxiliary information whose digest it signs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedAuxInfo {
    #[serde(with = "serde_bytes")]
    pub attestation: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub aux: Vec<u8>,
}

/// Creation and verification of attestation documents.
///
/// Implemented once for real hardware and once transparently for
/// environments without it. Which one is used is decided at compile time.
pub trait Attester: Send + Sync + 'static {
    /// Ask the hardware for a signed attestation document.
    fn attest(&self, request: AttestationRequest) -> Result<Vec<u8>>;

    /// Check the signature and validity window of a document
    /// against the current time and return its contents.
    fn verify_document(&self, document: &[u8]) -> Result<VerifiedDocument>;

    /// The PCR values of the enclave we are running in
    fn pcrs(&self) -> Result<Pcrs>;

    /// Turn auxiliary information into a document the counterpart can
    /// verify.
    ///
    /// The worker's nonce goes into the nonce slot, the worker's public
    /// key (if any) into the public key slot and the SHA-256 digest of the
    /// tagged payload into the user data slot.
    fn create_attestation(&self, aux: &AuxInfo) -> Result<Vec<u8>> {
        aux.validate()?;
        let aux_bytes = aux.to_bytes()?;
        let attestation = self.attest(AttestationRequest {
            nonce: Some(aux.workers_nonce().as_bytes().to_vec()),
            user_data: Some(digest(&aux_bytes)),
            public_key: aux.public_key().map(<[u8]>::to_vec),
        })?;
        serde_cbor::to_vec(&SignedAuxInfo {
            attestation,
            aux: aux_bytes,
        })
        .map_err(|e| Error::MalformedInput(e.to_string()))
    }

    /// Verify a counterpart's document and recover its auxiliary
    /// information.
    ///
    /// `is_our_nonce` is called with the Base64 form of the nonce we are
    /// supposed to have issued. Callers bind it to
    /// [`crate::NonceCache::consume`] so a document is only accepted once.
    fn verify_attestation<F>(&self, doc: &[u8], is_our_nonce: F) -> Result<AuxInfo>
    where
        F: FnOnce(&str) -> bool,
    {
        let signed: SignedAuxInfo = serde_cbor::from_slice(doc)
            .map_err(|e| Error::MalformedInput(format!("invalid attestation envelope: {e}")))?;

        let theirs = self.verify_document(&signed.attestation)?;

        if self.pcrs()? != theirs.pcrs {
            return Err(Error::ImageMismatch);
        }

        if theirs.user_data.as_deref() != Some(digest(&signed.aux).as_slice()) {
            return Err(Error::Verification(
                "auxiliary information does not match the signed digest".to_string(),
            ));
        }
        let aux = AuxInfo::from_bytes(&signed.aux)?;
        let signed_nonce = theirs
            .nonce
            .as_deref()
            .map(Nonce::try_from)
            .transpose()?;
        if signed_nonce.as_ref() != Some(aux.workers_nonce()) {
            return Err(Error::Verification(
                "signed nonce does not match the worker's nonce".to_string(),
            ));
        }
        if theirs.public_key.as_deref() != aux.public_key() {
            return Err(Error::Verification(
                "signed public key does not match the auxiliary information".to_string(),
            ));
        }

        let b64 = aux.partner_nonce().b64();
        if !is_our_nonce(&b64) {
            return Err(Error::ReplayOrUnknownNonce(b64));
        }
        tracing::debug!("{:?}", aux);
        Ok(aux)
    }
}

fn digest(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}
