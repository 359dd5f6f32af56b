//! Logic behind the enclave's endpoints.
//!
//! Internal requests come from the trusted enclave application, external
//! requests from anyone on the Internet. Every request is answered with a
//! [`ServerMsg`]; failures are reported as [`ServerMsg::Error`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use shared::tee::{AttestationRequest, Attester};
use shared::tcp::validate_addr;
use shared::{Error, ExternalMsg, InternalMsg, Result, ServerMsg};
use tracing::{debug, info, warn};

use crate::Enclave;
use crate::hashes::parse_app_key_hash;

/// Most key material the enclave application may store with us
pub const MAX_KEY_MATERIAL_LEN: usize = 1024 * 1024;

/// Most raw bytes a client's nonce may have, as imposed by the NSM
pub const MAX_ATTESTATION_NONCE_LEN: usize = 512;

impl<A: Attester> Enclave<A> {
    /// Handle a request of the enclave application
    pub async fn handle_internal(&self, msg: InternalMsg) -> ServerMsg {
        debug!("Received internal request: {msg:?}");
        let res = match msg {
            InternalMsg::GetState => self.get_state().map(ServerMsg::State),
            InternalMsg::PutState(state) => self.put_state(state).map(|_| ServerMsg::Success),
            InternalMsg::RegisterHash(hash) => {
                parse_app_key_hash(&hash).map(|hash| {
                    self.hashes.set_app_key_hash(hash);
                    ServerMsg::Success
                })
            }
            InternalMsg::Ready => {
                if self.ready.set() {
                    info!("Enclave application signalled readiness");
                }
                Ok(ServerMsg::Success)
            }
            InternalMsg::Sync { addr } => self.sync_from(&addr).await.map(|_| ServerMsg::Success),
        };
        res.unwrap_or_else(|err| {
            warn!("Failed to handle internal request: {err}");
            ServerMsg::Error(err.to_string())
        })
    }

    /// Handle a request from outside of the enclave
    pub async fn handle_external(&self, msg: ExternalMsg) -> ServerMsg {
        debug!("Received external request: {msg:?}");
        let res = match msg {
            ExternalMsg::RequestAttestation { nonce } => self.attest_for_client(&nonce).await,
        };
        match res {
            Ok(doc) => ServerMsg::Attestation(doc),
            Err(err) => {
                warn!("Failed to handle external request: {err}");
                ServerMsg::Error(err.to_string())
            }
        }
    }

    fn get_state(&self) -> Result<Vec<u8>> {
        let state = self.keys.app_keys();
        if state.is_empty() {
            return Err(Error::NoKeyMaterial);
        }
        Ok(state)
    }

    fn put_state(&self, state: Vec<u8>) -> Result<()> {
        if state.len() > MAX_KEY_MATERIAL_LEN {
            return Err(Error::MalformedInput(format!(
                "key material exceeds {MAX_KEY_MATERIAL_LEN} bytes"
            )));
        }
        self.keys.set_app_keys(state);
        Ok(())
    }

    async fn sync_from(&self, addr: &str) -> Result<()> {
        validate_addr(addr)?;
        self.request_keys(addr).await?;
        Ok(())
    }

    /// Produce a Base64 encoded attestation document over a client's hex
    /// encoded nonce and our attestation hashes.
    async fn attest_for_client(&self, nonce: &str) -> Result<String> {
        if !self.ready.is_set() {
            return Err(Error::NotReady);
        }
        if nonce.is_empty() {
            return Err(Error::MalformedInput("no nonce given".to_string()));
        }
        if nonce.len() > 2 * MAX_ATTESTATION_NONCE_LEN {
            return Err(Error::MalformedInput(format!(
                "nonce exceeds {MAX_ATTESTATION_NONCE_LEN} bytes"
            )));
        }
        let nonce = hex::decode(nonce.to_lowercase())
            .map_err(|_| Error::MalformedInput("nonce is not hex encoded".to_string()))?;
        let request = AttestationRequest {
            nonce: Some(nonce),
            user_data: Some(self.hashes.serialize()),
            public_key: None,
        };
        let deadline = self.settings.handshake_timeout;
        let attester = self.attester.clone();
        let doc = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || attester.attest(request)),
        )
        .await
        .map_err(|_| Error::Timeout(deadline))?
        .map_err(|e| Error::Transport(format!("attestation task failed: {e}")))??;
        Ok(STANDARD.encode(doc))
    }
}
