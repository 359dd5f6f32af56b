//! Client library for nitriding's endpoints. The enclave application uses
//! the internal ones, anyone may request attestation documents from the
//! external one.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::{OsRng, RngCore};
use shared::{ExternalMsg, InternalMsg, NONCE_LEN, ServerMsg};
use tracing_subscriber::fmt::SubscriberBuilder;

use crate::com::OutgoingTcp;
use crate::error::{Error, Result};

pub mod com;
pub mod error;

/// How long to wait for a connection to nitriding
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    SubscriberBuilder::default().with_ansi(true).init();
}

/// A fresh nonce for an attestation request
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn unexpected(reply: ServerMsg) -> Error {
    Error::UnexpectedResponse(format!("{reply:?}"))
}

async fn expect_success(addr: &str, msg: InternalMsg) -> Result<()> {
    let mut conn = OutgoingTcp::new(addr, CONNECT_TIMEOUT).await?;
    match conn.request(&msg).await? {
        ServerMsg::Success => Ok(()),
        reply => Err(unexpected(reply)),
    }
}

/// Request an attestation document over `nonce` and return the raw
/// document
pub async fn request_attestation(addr: &str, nonce: &[u8]) -> Result<Vec<u8>> {
    let mut conn = OutgoingTcp::new(addr, CONNECT_TIMEOUT).await?;
    let msg = ExternalMsg::RequestAttestation {
        nonce: hex::encode(nonce),
    };
    match conn.request(&msg).await? {
        ServerMsg::Attestation(doc) => STANDARD
            .decode(doc.trim())
            .map_err(|e| Error::UnexpectedResponse(format!("document is not Base64: {e}"))),
        reply => Err(unexpected(reply)),
    }
}

/// Retrieve the application's key material
pub async fn get_state(addr: &str) -> Result<Vec<u8>> {
    let mut conn = OutgoingTcp::new(addr, CONNECT_TIMEOUT).await?;
    match conn.request(&InternalMsg::GetState).await? {
        ServerMsg::State(state) => Ok(state),
        reply => Err(unexpected(reply)),
    }
}

/// Store the application's key material
pub async fn put_state(addr: &str, state: Vec<u8>) -> Result<()> {
    expect_success(addr, InternalMsg::PutState(state)).await
}

/// Register the Base64 encoded SHA-256 hash of the application's public key
pub async fn register_hash(addr: &str, hash: &str) -> Result<()> {
    let decoded = STANDARD
        .decode(hash.trim())
        .map_err(|e| Error::InvalidInput(format!("hash is not Base64: {e}")))?;
    if decoded.len() != 32 {
        return Err(Error::InvalidInput(format!(
            "expected a SHA-256 hash but got {} bytes",
            decoded.len()
        )));
    }
    expect_success(addr, InternalMsg::RegisterHash(hash.trim().to_string())).await
}

/// Signal that the application is ready
pub async fn ready(addr: &str) -> Result<()> {
    expect_success(addr, InternalMsg::Ready).await
}

/// Ask nitriding to synchronize key material from `leader`
pub async fn sync(addr: &str, leader: &str) -> Result<()> {
    shared::tcp::validate_addr(leader).map_err(|e| Error::InvalidInput(e.to_string()))?;
    expect_success(
        addr,
        InternalMsg::Sync {
            addr: leader.to_string(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use enclave::{Enclave, Settings};
    use shared::tee::Attester;
    use shared::tee::transparent::TransparentAttester;
    use shared::{FramedStream, MsgError};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve internal and external requests like nitriding does, on
    /// a single port
    async fn serve(enclave: Enclave<TransparentAttester>) -> String {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Request {
            Internal(InternalMsg),
            External(ExternalMsg),
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
        let addr = listener.local_addr().expect("Test failed").to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let enclave = enclave.clone();
                tokio::spawn(async move {
                    let mut conn = FramedStream::new(stream);
                    loop {
                        let reply = match conn.read::<Request>().await {
                            Ok(Request::Internal(msg)) => enclave.handle_internal(msg).await,
                            Ok(Request::External(msg)) => enclave.handle_external(msg).await,
                            Err(MsgError::Closed) => return,
                            Err(e) => ServerMsg::Error(e.to_string()),
                        };
                        if conn.write(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn enclave() -> Enclave<TransparentAttester> {
        Enclave::new(TransparentAttester::default(), Settings::default())
    }

    #[tokio::test]
    async fn test_state() {
        let addr = serve(enclave()).await;
        assert!(matches!(
            get_state(&addr).await,
            Err(Error::ServerError(_))
        ));
        put_state(&addr, b"secret".to_vec())
            .await
            .expect("Test failed");
        assert_eq!(get_state(&addr).await.expect("Test failed"), b"secret");
    }

    #[tokio::test]
    async fn test_attestation_after_readiness() {
        let enclave = enclave();
        let addr = serve(enclave.clone()).await;
        let nonce = random_nonce();
        assert!(matches!(
            request_attestation(&addr, &nonce).await,
            Err(Error::ServerError(_))
        ));

        register_hash(&addr, &STANDARD.encode([7u8; 32]))
            .await
            .expect("Test failed");
        ready(&addr).await.expect("Test failed");
        let doc = request_attestation(&addr, &nonce)
            .await
            .expect("Test failed");
        let verified = enclave
            .attester()
            .verify_document(&doc)
            .expect("Test failed");
        assert_eq!(verified.nonce.as_deref(), Some(nonce.as_slice()));
        let user_data = verified.user_data.expect("Test failed");
        assert_eq!(&user_data[47..], &[7u8; 32]);
    }

    #[tokio::test]
    async fn test_invalid_input_never_sent() {
        assert!(matches!(
            register_hash("127.0.0.1:1", "too short").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            sync("127.0.0.1:1", "no port").await,
            Err(Error::InvalidInput(_))
        ));
    }
}
