//! Messages exchanged with nitriding and the framing used to send them.
//!
//! Every message is CBOR, framed with COBS using a zero sentinel. Frames
//! are bounded by [`MAX_FRAME_LEN`], so a peer cannot make us buffer
//! arbitrary amounts of data.

pub mod tcp;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::nonce::Nonce;

/// Upper bound on the encoded size of a single frame
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Requests of the enclave application to its enclave-internal endpoints
#[derive(Clone, Serialize, Deserialize)]
pub enum InternalMsg {
    /// Retrieve the application's key material
    GetState,
    /// Replace the application's key material
    PutState(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Register the Base64 encoded SHA-256 hash of the application's
    /// public key to be included in attestation documents
    RegisterHash(String),
    /// Signal that the application is ready to serve requests
    Ready,
    /// Synchronize key material from the leader at the given address
    Sync { addr: String },
}

impl core::fmt::Debug for InternalMsg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::GetState => f.write_str("GetState"),
            Self::PutState(s) => write!(f, "PutState(<{} bytes>)", s.len()),
            Self::RegisterHash(hash) => write!(f, "RegisterHash({hash})"),
            Self::Ready => f.write_str("Ready"),
            Self::Sync { addr } => write!(f, "Sync {{ addr: {addr} }}"),
        }
    }
}

/// Requests from outside of the enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExternalMsg {
    /// Request an attestation document over a hex encoded nonce
    RequestAttestation { nonce: String },
}

/// Replies to both internal and external requests
#[derive(Clone, Serialize, Deserialize)]
pub enum ServerMsg {
    State(#[serde(with = "serde_bytes")] Vec<u8>),
    /// A Base64 encoded attestation document
    Attestation(String),
    Success,
    Error(String),
}

impl core::fmt::Debug for ServerMsg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::State(s) => write!(f, "State(<{} bytes>)", s.len()),
            Self::Attestation(doc) => write!(f, "Attestation({doc})"),
            Self::Success => f.write_str("Success"),
            Self::Error(err) => write!(f, "Error({err})"),
        }
    }
}

/// Messages exchanged between a worker and a leader during key
/// synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMsg {
    /// A worker asks to start a handshake
    Hello,
    /// The nonce the leader expects in the worker's attestation
    LeaderNonce(Nonce),
    WorkerAttestation(#[serde(with = "serde_bytes")] Vec<u8>),
    LeaderAttestation(#[serde(with = "serde_bytes")] Vec<u8>),
    Error(String),
}

#[derive(Error, Debug)]
pub enum MsgError {
    #[error("COBS failed to decode frame with: {0}")]
    Decode(cobs::DecodeError),
    #[error("Failed to deserialize CBOR with: {0}")]
    Deserialize(serde_cbor::Error),
    #[error("Failed to serialize CBOR with: {0}")]
    Serialize(serde_cbor::Error),
    #[error("Frame exceeds the maximum size of {0} bytes")]
    FrameTooLarge(usize),
    #[error("Connection closed by peer")]
    Closed,
    #[error("{0}")]
    Io(std::io::Error),
}

pub struct Frame {
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T, MsgError> {
        serde_cbor::from_slice(&self.bytes).map_err(MsgError::Deserialize)
    }

    /// Decode a COBS encoded frame, including its zero sentinel
    fn decode(encoded: &[u8]) -> Result<Self, MsgError> {
        // decoded frames are never longer than their encoding
        let mut frame_buf = vec![0u8; encoded.len()];
        let len = {
            let mut decoder = cobs::CobsDecoder::new(&mut frame_buf);
            let mut decoded = None;
            for b in encoded.iter().copied() {
                if let Some(len) = decoder.feed(b).map_err(MsgError::Decode)? {
                    decoded = Some(len);
                    break;
                }
            }
            decoded.ok_or(MsgError::Closed)?
        };
        frame_buf.truncate(len);
        Ok(Frame { bytes: frame_buf })
    }
}

/// Encode a serializable message in CBOR, framed with COBS.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, MsgError> {
    let data = serde_cbor::to_vec(msg).map_err(MsgError::Serialize)?;
    let mut encoded = cobs::encode_vec_with_sentinel(&data, 0);
    encoded.push(0);
    Ok(encoded)
}

/// A byte stream carrying framed messages in both directions
pub struct FramedStream<S> {
    raw: BufReader<S>,
    max_frame_len: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_len(stream, MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(stream: S, max_frame_len: usize) -> Self {
        Self {
            raw: BufReader::new(stream),
            max_frame_len,
        }
    }

    /// Read the next frame. Fails if the frame exceeds the
    /// maximum frame length before its sentinel is seen.
    pub async fn get_frame(&mut self) -> Result<Frame, MsgError> {
        let mut encoded = Vec::new();
        let limit = self.max_frame_len as u64 + 1;
        (&mut self.raw)
            .take(limit)
            .read_until(0, &mut encoded)
            .await
            .map_err(MsgError::Io)?;
        match encoded.last() {
            Some(0) => Frame::decode(&encoded),
            _ if encoded.len() as u64 >= limit => Err(MsgError::FrameTooLarge(self.max_frame_len)),
            _ => Err(MsgError::Closed),
        }
    }

    /// Read and deserialize the next message
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<T, MsgError> {
        self.get_frame().await?.deserialize()
    }

    /// Serialize, frame and send a message
    pub async fn write<T: Serialize>(&mut self, msg: &T) -> Result<(), MsgError> {
        let encoded = encode_frame(msg)?;
        let raw = self.raw.get_mut();
        raw.write_all(&encoded).await.map_err(MsgError::Io)?;
        raw.flush().await.map_err(MsgError::Io)
    }

    pub fn into_inner(self) -> S {
        self.raw.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_key_material() {
        let dbg = format!("{:?}", InternalMsg::PutState(b"topsecret".to_vec()));
        assert_eq!(dbg, "PutState(<9 bytes>)");
        let dbg = format!("{:?}", ServerMsg::State(b"topsecret".to_vec()));
        assert_eq!(dbg, "State(<9 bytes>)");
        let dbg = format!(
            "{:?}",
            InternalMsg::Sync {
                addr: "10.0.0.1:9444".to_string()
            }
        );
        assert_eq!(dbg, "Sync { addr: 10.0.0.1:9444 }");
    }

    #[tokio::test]
    async fn test_messages_cross_the_stream() {
        let (a, b) = tokio::io::duplex(64);
        let mut a = FramedStream::new(a);
        let mut b = FramedStream::new(b);
        let big = vec![0u8; 10_000];
        let writer = tokio::spawn(async move {
            a.write(&InternalMsg::PutState(big)).await.expect("Test failed");
            a.write(&InternalMsg::Ready).await.expect("Test failed");
        });
        let Ok(InternalMsg::PutState(state)) = b.read().await else {
            panic!("Test failed");
        };
        assert_eq!(state.len(), 10_000);
        assert!(matches!(b.read().await, Ok(InternalMsg::Ready)));
        writer.await.expect("Test failed");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let mut a = FramedStream::new(a);
        let mut b = FramedStream::with_max_frame_len(b, 128);
        let writer = tokio::spawn(async move {
            // the reader gives up early, so this write may fail
            _ = a.write(&InternalMsg::PutState(vec![1u8; 4096])).await;
        });
        assert!(matches!(
            b.read::<InternalMsg>().await,
            Err(MsgError::FrameTooLarge(128))
        ));
        drop(b);
        writer.await.expect("Test failed");
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut b = FramedStream::new(b);
        let encoded = encode_frame(&InternalMsg::GetState).expect("Test failed");
        a.write_all(&encoded[..encoded.len() - 1]).await.expect("Test failed");
        drop(a);
        assert!(matches!(
            b.read::<InternalMsg>().await,
            Err(MsgError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_wrong_message_type() {
        let (a, b) = tokio::io::duplex(1024);
        let mut a = FramedStream::new(a);
        let mut b = FramedStream::new(b);
        a.write(&SyncMsg::Hello).await.expect("Test failed");
        assert!(matches!(
            b.read::<ExternalMsg>().await,
            Err(MsgError::Deserialize(_))
        ));
    }
}
