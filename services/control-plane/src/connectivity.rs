//! Control channel probes to account endpoints and live nodes.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

/// Port probed when an address carries none (ssh).
pub const DEFAULT_PORT: u16 = 22;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A validated control channel.
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    /// Endpoint name or hostname the caller asked for.
    pub target: String,
    /// `host:port` that answered.
    pub address: String,
    pub latency_ms: u64,
}

/// Add the default port to bare host names and IPv4 addresses.
pub fn with_default_port(address: &str) -> String {
    if address.starts_with('[') || address.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PORT}")
    }
}

/// Open a TCP connection to `address` and close it again.
pub async fn probe(target: &str, address: &str, timeout: Duration) -> Result<Channel> {
    let address = with_default_port(address);
    let started = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
        Ok(Ok(_stream)) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            debug!(target, %address, latency_ms, "Channel established");
            Ok(Channel {
                target: target.to_string(),
                address,
                latency_ms,
            })
        }
        Ok(Err(e)) => Err(Error::Connectivity(format!("{target} ({address}): {e}"))),
        Err(_) => Err(Error::Connectivity(format!(
            "{target} ({address}): timed out after {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[rstest::rstest]
    #[case("10.0.0.5", "10.0.0.5:22")]
    #[case("10.0.0.5:2222", "10.0.0.5:2222")]
    #[case("login.cluster", "login.cluster:22")]
    #[case("[::1]:22", "[::1]:22")]
    fn test_default_port(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(with_default_port(input), expected);
    }

    #[tokio::test]
    async fn test_probe_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let channel = probe("io", &addr, DEFAULT_CONNECT_TIMEOUT).await.unwrap();
        assert_eq!(channel.address, addr);
    }

    #[tokio::test]
    async fn test_probe_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = probe("io", &format!("127.0.0.1:{port}"), DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }
}
