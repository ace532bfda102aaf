//! Upstream dialing.
//!
//! The relay paths only see [`Dialer`]; routing, chaining through further
//! proxies, or test doubles all plug in behind it.

use futures::future::BoxFuture;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Duration, timeout};
use tracing::debug;

/// Any duplex byte stream an upstream connection can be.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

#[derive(Debug)]
pub enum DialError {
    UnsupportedNetwork(String),
    Resolve(String, io::Error),
    NoAddress(String),
    Connect(String, io::Error),
    Timeout(String),
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::UnsupportedNetwork(n) => write!(f, "unsupported network: {}", n),
            DialError::Resolve(addr, e) => write!(f, "failed to resolve {}: {}", addr, e),
            DialError::NoAddress(addr) => write!(f, "no address found for {}", addr),
            DialError::Connect(addr, e) => write!(f, "failed to connect to {}: {}", addr, e),
            DialError::Timeout(addr) => write!(f, "connect to {} timed out", addr),
        }
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DialError::Resolve(_, e) | DialError::Connect(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Opens upstream connections: `dial("tcp", "example.com:443")`.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        network: &'a str,
        address: &'a str,
    ) -> BoxFuture<'a, Result<BoxedStream, DialError>>;
}

/// Connects straight to the target over TCP.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, network: &str, address: &str) -> Result<TcpStream, DialError> {
        let addrs = lookup_host(address)
            .await
            .map_err(|e| DialError::Resolve(address.to_string(), e))?
            .filter(|addr| match network {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            });

        let mut last_err = None;
        for addr in addrs {
            debug!(%addr, target = address, "Connecting to upstream");
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => DialError::Connect(address.to_string(), e),
            None => DialError::NoAddress(address.to_string()),
        })
    }
}

impl Dialer for DirectDialer {
    fn dial<'a>(
        &'a self,
        network: &'a str,
        address: &'a str,
    ) -> BoxFuture<'a, Result<BoxedStream, DialError>> {
        Box::pin(async move {
            if !matches!(network, "tcp" | "tcp4" | "tcp6") {
                return Err(DialError::UnsupportedNetwork(network.to_string()));
            }
            let stream = timeout(self.connect_timeout, self.connect(network, address))
                .await
                .map_err(|_| DialError::Timeout(address.to_string()))??;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let dialer = DirectDialer::new(Duration::from_secs(5));
        let mut stream = dialer.dial("tcp", &addr).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let dialer = DirectDialer::new(Duration::from_secs(1));
        let err = dialer.dial("udp", "127.0.0.1:53").await.err().unwrap();
        assert!(matches!(err, DialError::UnsupportedNetwork(_)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = DirectDialer::new(Duration::from_secs(5));
        let err = dialer.dial("tcp", &addr).await.err().unwrap();
        assert!(matches!(err, DialError::Connect(..)));
    }

    #[tokio::test]
    async fn test_network_family_filter() {
        let dialer = DirectDialer::new(Duration::from_secs(1));
        let err = dialer.dial("tcp6", "127.0.0.1:1").await.err().unwrap();
        assert!(matches!(err, DialError::NoAddress(_)));
    }
}
