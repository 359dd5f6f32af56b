//! Attestation backed by the Nitro Secure Module (NSM).
//!
//! Documents are COSE_Sign1 structures whose payload is signed by a leaf
//! certificate chaining up to the AWS Nitro root certificate.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use aws_nitro_enclaves_cose::CoseSign1;
use aws_nitro_enclaves_cose::crypto::Openssl;
use aws_nitro_enclaves_nsm_api::api::{Request, Response};
use aws_nitro_enclaves_nsm_api::driver;
use openssl::asn1::Asn1Time;
use openssl::x509::{X509, X509Ref};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use shared::tee::{AttestationRequest, Attester, Pcrs, VerifiedDocument};
use shared::{Error, Result};
use tracing::debug;

/// The only digest the NSM signs with
const NSM_DIGEST: &str = "SHA384";

/// The payload of an NSM attestation document
#[derive(Debug, Deserialize)]
struct AttestationPayload {
    module_id: String,
    digest: String,
    timestamp: u64,
    pcrs: BTreeMap<u32, ByteBuf>,
    certificate: ByteBuf,
    cabundle: Vec<ByteBuf>,
    #[serde(default)]
    public_key: Option<ByteBuf>,
    #[serde(default)]
    user_data: Option<ByteBuf>,
    #[serde(default)]
    nonce: Option<ByteBuf>,
}

pub struct NitroAttester {
    root: X509,
    pcrs: OnceLock<Pcrs>,
}

impl NitroAttester {
    /// Create an attester trusting the given PEM encoded root certificate
    pub fn new(root_pem: &[u8]) -> Result<Self> {
        let root = X509::from_pem(root_pem)
            .map_err(|e| Error::MalformedInput(format!("invalid root certificate: {e}")))?;
        Ok(Self {
            root,
            pcrs: OnceLock::new(),
        })
    }

    fn nsm_attest(request: AttestationRequest) -> Result<Vec<u8>> {
        let fd = driver::nsm_init();
        if fd < 0 {
            return Err(Error::Transport("could not open the NSM device".to_string()));
        }
        let response = driver::nsm_process_request(
            fd,
            Request::Attestation {
                user_data: request.user_data.map(ByteBuf::from),
                nonce: request.nonce.map(ByteBuf::from),
                public_key: request.public_key.map(ByteBuf::from),
            },
        );
        driver::nsm_exit(fd);
        match response {
            Response::Attestation { document } => Ok(document),
            Response::Error(err) => Err(Error::Transport(format!("NSM refused attestation: {err:?}"))),
            _ => Err(Error::Transport("unexpected response from the NSM".to_string())),
        }
    }

    /// Parse a COSE_Sign1 document without checking its signature
    fn parse(document: &[u8]) -> Result<(CoseSign1, AttestationPayload)> {
        let cose = CoseSign1::from_bytes(document)
            .map_err(|e| Error::Verification(format!("could not parse COSE document: {e:?}")))?;
        let payload = cose
            .get_payload::<Openssl>(None)
            .map_err(|e| Error::Verification(format!("could not read COSE payload: {e:?}")))?;
        let payload: AttestationPayload = serde_cbor::from_slice(&payload)
            .map_err(|e| Error::Verification(format!("invalid attestation payload: {e}")))?;
        if payload.digest != NSM_DIGEST {
            return Err(Error::Verification(format!(
                "unexpected digest {}",
                payload.digest
            )));
        }
        Ok((cose, payload))
    }

    /// Walk the chain root -> cabundle -> leaf, checking every signature
    /// and validity window.
    fn verify_chain(&self, payload: &AttestationPayload) -> Result<X509> {
        let now = Asn1Time::days_from_now(0).map_err(verification)?;
        let mut issuer = self.root.clone();
        // the bundle starts with the root itself
        for der in payload.cabundle.iter().skip(1) {
            let cert = X509::from_der(der).map_err(verification)?;
            check_signed_by(&cert, &issuer, &now)?;
            issuer = cert;
        }
        let leaf = X509::from_der(&payload.certificate).map_err(verification)?;
        check_signed_by(&leaf, &issuer, &now)?;
        Ok(leaf)
    }
}

fn verification(err: openssl::error::ErrorStack) -> Error {
    Error::Verification(err.to_string())
}

fn check_signed_by(cert: &X509Ref, issuer: &X509Ref, now: &Asn1Time) -> Result<()> {
    let issuer_key = issuer.public_key().map_err(verification)?;
    if !cert.verify(&issuer_key).map_err(verification)? {
        return Err(Error::Verification(
            "certificate chain signature is invalid".to_string(),
        ));
    }
    let not_yet_valid = cert.not_before().compare(now).map_err(verification)? == Ordering::Greater;
    let expired = cert.not_after().compare(now).map_err(verification)? == Ordering::Less;
    if not_yet_valid || expired {
        return Err(Error::Verification(
            "certificate is not valid at the current time".to_string(),
        ));
    }
    Ok(())
}

fn into_pcrs(pcrs: BTreeMap<u32, ByteBuf>) -> Pcrs {
    pcrs.into_iter()
        .map(|(ix, pcr)| (ix, pcr.into_vec()))
        .collect()
}

impl Attester for NitroAttester {
    fn attest(&self, request: AttestationRequest) -> Result<Vec<u8>> {
        Self::nsm_attest(request)
    }

    fn verify_document(&self, document: &[u8]) -> Result<VerifiedDocument> {
        let (cose, payload) = Self::parse(document)?;
        let leaf = self.verify_chain(&payload)?;
        let leaf_key = leaf.public_key().map_err(verification)?;
        let valid = cose
            .verify_signature::<Openssl>(&leaf_key)
            .map_err(|e| Error::Verification(format!("could not check COSE signature: {e:?}")))?;
        if !valid {
            return Err(Error::Verification("COSE signature is invalid".to_string()));
        }
        debug!(
            "Verified attestation document of {} from {}",
            payload.module_id, payload.timestamp
        );
        Ok(VerifiedDocument {
            pcrs: into_pcrs(payload.pcrs),
            nonce: payload.nonce.map(ByteBuf::into_vec),
            user_data: payload.user_data.map(ByteBuf::into_vec),
            public_key: payload.public_key.map(ByteBuf::into_vec),
        })
    }

    /// Our own PCRs, taken from a locally produced document. They cannot
    /// change while we run, so they are only fetched once.
    fn pcrs(&self) -> Result<Pcrs> {
        if let Some(pcrs) = self.pcrs.get() {
            return Ok(pcrs.clone());
        }
        let document = Self::nsm_attest(AttestationRequest {
            nonce: None,
            user_data: None,
            public_key: None,
        })?;
        let (_, payload) = Self::parse(&document)?;
        Ok(self.pcrs.get_or_init(|| into_pcrs(payload.pcrs)).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_root_rejected() {
        assert!(matches!(
            NitroAttester::new(b"not a certificate"),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_garbage_document_rejected() {
        assert!(matches!(
            NitroAttester::parse(b"garbage"),
            Err(Error::Verification(_))
        ));
    }
}
