//! A one-time signal from the enclave application that it is ready.
//!
//! Access to the Internet-facing endpoints is gated on it so that no
//! attestation documents lacking the application's hash are issued because
//! the application could not register it in time. Once set, the latch
//! stays set.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct ReadyLatch {
    send: Arc<watch::Sender<bool>>,
}

impl Default for ReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyLatch {
    pub fn new() -> Self {
        let (send, _) = watch::channel(false);
        Self {
            send: Arc::new(send),
        }
    }

    /// Open the latch. Returns `true` if this call opened it and
    /// `false` if it was already open.
    pub fn set(&self) -> bool {
        !self.send.send_replace(true)
    }

    pub fn is_set(&self) -> bool {
        *self.send.borrow()
    }

    /// Wait until the latch is opened
    pub async fn wait(&self) {
        let mut recv = self.send.subscribe();
        // the sender lives in `self`, so this cannot fail
        _ = recv.wait_for(|ready| *ready).await;
    }
}
