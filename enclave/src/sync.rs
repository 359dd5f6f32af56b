//! Key synchronization between horizontally scaled enclaves.
//!
//! A worker pulls the key material of a leader over a single connection:
//!
//! * The worker issues its nonce and says hello; the leader answers with a
//!   nonce of its own.
//! * The worker sends an attestation document over both nonces and an
//!   ephemeral public key.
//! * The leader verifies it (the worker must run the same image and echo
//!   the leader's nonce), seals its key material to the worker's public key
//!   and replies with an attestation document over the worker's nonce and
//!   the sealed keys.
//! * The worker verifies that document, opens the seal and installs the
//!   keys in one go.
//!
//! Every nonce is consumed on verification, so captured documents cannot be
//! replayed into another handshake.

use std::future::Future;
use std::time::Duration;

use rand_core::OsRng;
use shared::ratls::{self, Connection, SealedKeys};
use shared::tcp::{self, validate_addr};
use shared::tee::Attester;
use shared::{
    EnclaveKeys, Error, FramedStream, LeaderAuxInfo, Result, SyncMsg, WorkerAuxInfo,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::Enclave;
use crate::hashes::sha256;

/// How long we try to tell a peer why we aborted a handshake
const ERROR_REPORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a worker's handshake is at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    NonceIssued,
    RequestSent,
    DocumentReceived,
    Verified,
    Applied,
    Failed(String),
}

/// The result of a successful synchronization
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The leader's keys differed from ours and were installed
    Updated,
    /// We already had the leader's keys
    Unchanged,
}

/// Tracks the state transitions of one handshake
struct Handshake<'a> {
    peer: &'a str,
    state: HandshakeState,
    #[cfg(test)]
    history: Vec<HandshakeState>,
}

impl<'a> Handshake<'a> {
    fn new(peer: &'a str) -> Self {
        Self {
            peer,
            state: HandshakeState::Idle,
            #[cfg(test)]
            history: vec![HandshakeState::Idle],
        }
    }

    fn advance(&mut self, next: HandshakeState) {
        debug!(peer = self.peer, "Key sync: {:?} -> {:?}", self.state, next);
        #[cfg(test)]
        self.history.push(next.clone());
        self.state = next;
    }

    fn fail(&mut self, err: &Error) {
        // nothing can fail before a nonce is issued
        if self.state != HandshakeState::Idle {
            self.advance(HandshakeState::Failed(err.to_string()));
        }
    }
}

fn unexpected(msg: SyncMsg) -> Error {
    match msg {
        SyncMsg::Error(err) => Error::Transport(format!("peer aborted the handshake: {err}")),
        msg => Error::MalformedInput(format!("unexpected message during key sync: {msg:?}")),
    }
}

impl<A: Attester> Enclave<A> {
    /// Request the key material of the leader listening at `addr` and
    /// install it.
    ///
    /// The whole handshake, including connecting, is bounded by the
    /// configured handshake timeout. On any failure our keys are left
    /// untouched.
    pub async fn request_keys(&self, addr: &str) -> Result<SyncOutcome> {
        validate_addr(addr)?;
        let deadline = self.settings.handshake_timeout;
        let mut handshake = Handshake::new(addr);
        self.handshake(&mut handshake, tcp::connect(addr, deadline)).await
    }

    /// Like [`Self::request_keys`] but over an already established stream
    /// to the leader.
    pub async fn request_keys_over<S>(&self, peer: &str, stream: S) -> Result<SyncOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut handshake = Handshake::new(peer);
        let connected = async { Ok::<_, Error>(FramedStream::new(stream)) };
        self.handshake(&mut handshake, connected).await
    }

    /// Connect and run the worker's side of a handshake within the
    /// handshake timeout
    async fn handshake<S, C>(
        &self,
        handshake: &mut Handshake<'_>,
        connect: C,
    ) -> Result<SyncOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        C: Future<Output = Result<FramedStream<S>>>,
    {
        let deadline = self.settings.handshake_timeout;
        let res = tokio::time::timeout(deadline, async {
            let stream = connect.await?;
            self.run_worker(handshake, stream).await
        })
        .await
        .unwrap_or(Err(Error::Timeout(deadline)));
        match &res {
            Ok(outcome) => info!("Synchronized key material from {}: {outcome:?}", handshake.peer),
            Err(err) => {
                handshake.fail(err);
                error!("Failed to synchronize key material from {}: {err}", handshake.peer);
            }
        }
        res
    }

    async fn run_worker<S>(
        &self,
        handshake: &mut Handshake<'_>,
        mut stream: FramedStream<S>,
    ) -> Result<SyncOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let workers_nonce = self.nonces.issue();
        handshake.advance(HandshakeState::NonceIssued);

        stream.write(&SyncMsg::Hello).await?;
        let leaders_nonce = match stream.read::<SyncMsg>().await? {
            SyncMsg::LeaderNonce(nonce) => nonce,
            msg => return Err(unexpected(msg)),
        };

        let conn = Connection::new(OsRng);
        let aux = WorkerAuxInfo {
            workers_nonce,
            leaders_nonce,
            public_key: conn.public_key()?.to_vec(),
        };
        let doc = self
            .blocking(move |attester| attester.create_attestation(&aux.into()))
            .await?;
        stream.write(&SyncMsg::WorkerAttestation(doc)).await?;
        handshake.advance(HandshakeState::RequestSent);

        let doc = match stream.read::<SyncMsg>().await? {
            SyncMsg::LeaderAttestation(doc) => doc,
            msg => return Err(unexpected(msg)),
        };
        handshake.advance(HandshakeState::DocumentReceived);

        // only the nonce of this very handshake is acceptable
        let expected = workers_nonce.b64();
        let nonces = self.nonces.clone();
        let leader = self
            .blocking(move |attester| {
                attester.verify_attestation(&doc, |nonce| nonce == expected && nonces.consume(nonce))
            })
            .await?
            .into_leader()?;
        handshake.advance(HandshakeState::Verified);

        let sealed = SealedKeys::from_bytes(&leader.enclave_keys)?;
        let keys: EnclaveKeys = conn.initialize(&sealed.leader_pk)?.decrypt_msg(&sealed.ciphertext)?;
        let outcome = self.install_keys(keys);
        handshake.advance(HandshakeState::Applied);
        Ok(outcome)
    }

    /// Replace our key material wholesale, unless it is identical already.
    /// Skipping identical keys spares the TLS server a needless restart.
    pub fn install_keys(&self, keys: EnclaveKeys) -> SyncOutcome {
        if self.keys.equal(&keys) {
            return SyncOutcome::Unchanged;
        }
        let tls_key_hash = sha256(&keys.nitriding_cert);
        self.keys.set(keys);
        self.hashes.set_tls_key_hash(tls_key_hash);
        SyncOutcome::Updated
    }

    /// Serve one worker's request for our key material.
    pub async fn serve_key_sync<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let deadline = self.settings.handshake_timeout;
        let mut stream = FramedStream::new(stream);
        let res = tokio::time::timeout(deadline, self.run_leader(&mut stream))
            .await
            .unwrap_or(Err(Error::Timeout(deadline)));
        if let Err(err) = &res {
            warn!("Refused key sync request: {err}");
            let msg = SyncMsg::Error(err.to_string());
            let report = stream.write(&msg);
            if tokio::time::timeout(ERROR_REPORT_TIMEOUT, report).await.is_err() {
                debug!("Could not report key sync failure to worker");
            }
        }
        res
    }

    async fn run_leader<S>(&self, stream: &mut FramedStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match stream.read::<SyncMsg>().await? {
            SyncMsg::Hello => {}
            msg => return Err(unexpected(msg)),
        }
        let keys = self.keys.get();
        if keys == EnclaveKeys::default() {
            return Err(Error::NoKeyMaterial);
        }

        let leaders_nonce = self.nonces.issue();
        stream.write(&SyncMsg::LeaderNonce(leaders_nonce)).await?;

        let doc = match stream.read::<SyncMsg>().await? {
            SyncMsg::WorkerAttestation(doc) => doc,
            msg => return Err(unexpected(msg)),
        };
        let expected = leaders_nonce.b64();
        let nonces = self.nonces.clone();
        let worker = self
            .blocking(move |attester| {
                attester.verify_attestation(&doc, |nonce| nonce == expected && nonces.consume(nonce))
            })
            .await?
            .into_worker()?;

        let sealed = ratls::seal(&worker.public_key, &keys, &mut OsRng)?.to_bytes()?;
        let aux = LeaderAuxInfo {
            workers_nonce: worker.workers_nonce,
            enclave_keys: sealed,
        };
        let doc = self
            .blocking(move |attester| attester.create_attestation(&aux.into()))
            .await?;
        stream.write(&SyncMsg::LeaderAttestation(doc)).await?;
        info!("Sent key material to worker {}", worker.workers_nonce);
        Ok(())
    }

    /// Run a call into the attester, which may block on hardware, off the
    /// async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&A) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let attester = self.attester.clone();
        tokio::task::spawn_blocking(move || f(&attester))
            .await
            .map_err(|e| Error::Transport(format!("attestation task failed: {e}")))?
    }
}
