use std::time::Duration;

use serde::Serialize;
use shared::ServerMsg;
use shared::tcp::{self, FramedTcp};

use crate::error::{self, Error};

/// A connection to one of nitriding's endpoints
pub struct OutgoingTcp(FramedTcp);

impl OutgoingTcp {
    /// Connect to `addr`, giving up after `timeout`
    pub async fn new(addr: &str, timeout: Duration) -> error::Result<Self> {
        tcp::validate_addr(addr).map_err(Error::Connection)?;
        Ok(Self(tcp::connect(addr, timeout).await.map_err(Error::Connection)?))
    }

    /// Send a request and wait for nitriding's reply. Errors reported by
    /// nitriding are turned into [`Error::ServerError`].
    pub async fn request<T: Serialize>(&mut self, msg: &T) -> error::Result<ServerMsg> {
        self.0.write(msg).await.map_err(Error::MsgError)?;
        match self.0.read().await.map_err(Error::MsgError)? {
            ServerMsg::Error(err) => Err(Error::ServerError(err)),
            reply => Ok(reply),
        }
    }
}
