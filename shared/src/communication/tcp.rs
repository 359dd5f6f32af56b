//! Framed TCP connections

use std::time::Duration;

use tokio::net::TcpStream;

use crate::communication::FramedStream;
use crate::error::{Error, Result};

pub type FramedTcp = FramedStream<TcpStream>;

/// Open a framed connection to `addr`, giving up after `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<FramedTcp> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(|e| Error::Transport(format!("could not connect to {addr}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(FramedStream::new(stream))
}

/// Check that `addr` has the form `host:port`
pub fn validate_addr(addr: &str) -> Result<()> {
    let malformed = || Error::MalformedInput(format!("invalid address '{addr}', expected host:port"));
    let (host, port) = addr.rsplit_once(':').ok_or_else(malformed)?;
    if host.is_empty() || host.chars().any(char::is_whitespace) || host.contains('/') {
        return Err(malformed());
    }
    port.parse::<u16>().map_err(|_| malformed())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_addr() {
        for addr in ["127.0.0.1:9444", "leader.internal:443", "[::1]:80"] {
            assert!(validate_addr(addr).is_ok(), "{addr}");
        }
        for addr in ["", "leader", ":443", "leader:", "leader:99999", "https://leader:443/x"] {
            assert!(
                matches!(validate_addr(addr), Err(Error::MalformedInput(_))),
                "{addr}"
            );
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Test failed");
        let addr = listener.local_addr().expect("Test failed").to_string();
        drop(listener);
        assert!(matches!(
            connect(&addr, Duration::from_secs(5)).await,
            Err(Error::Transport(_))
        ));
    }
}
