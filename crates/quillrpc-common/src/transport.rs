//! Connection-oriented byte-stream transport.
//!
//! TCP is the only transport the native protocol requires. `Connection`
//! wraps a dialed or accepted stream; `Listener` wraps the accept side.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, RpcError};

/// Transport selector carried in the option structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Tcp,
}

impl TransportKind {
    pub fn parse_name(name: &str) -> Result<Self> {
        match name {
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(RpcError::Transport(format!("transport {other} not found"))),
        }
    }
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Tcp
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DialOptions {
    pub timeout: Option<Duration>,
}

/// An established connection.
pub struct Connection {
    stream: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
}

impl Connection {
    /// Dials `addr` over the given network, honoring the optional timeout.
    pub async fn dial(network: &str, addr: &str, options: DialOptions) -> Result<Self> {
        check_network(network)?;
        let connect = TcpStream::connect(addr);
        let stream = match options.timeout {
            Some(timeout) if !timeout.is_zero() => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| {
                    RpcError::Transport(format!("dial {addr} timed out after {timeout:?}"))
                })?,
            _ => connect.await,
        }
        .map_err(|e| RpcError::Transport(format!("dial {addr}: {e}")))?;

        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        let local = stream
            .local_addr()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Connection { stream, local, peer })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Splits into independently owned read and write halves so a reader
    /// task and writers can run concurrently.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// The accept side of the transport.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(network: &str, addr: &str) -> Result<Self> {
        check_network(network)?;
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Transport(format!("listen on {addr}: {e}")))?;
        Ok(Listener { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    /// Blocks until a new connection arrives. When the listener has been
    /// dropped during shutdown the pending accept resolves with an error
    /// the serve loop recognizes as benign.
    pub async fn accept(&self) -> Result<Connection> {
        let (stream, _) = self
            .inner
            .accept()
            .await
            .map_err(|e| RpcError::Transport(format!("accept: {e}")))?;
        Connection::from_stream(stream)
    }
}

fn check_network(network: &str) -> Result<()> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Ok(()),
        other => Err(RpcError::Transport(format!(
            "unsupported network {other:?} (tcp only)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_and_accept() {
        let listener = Listener::bind("tcp", "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await });
        let mut client = Connection::dial("tcp", &addr, DialOptions::default())
            .await
            .unwrap();
        let mut server = accept.await.unwrap().unwrap();

        client.stream_mut().write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.stream_mut().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(server.peer_addr(), client.local_addr());
    }

    #[tokio::test]
    async fn test_dial_unknown_network_rejected() {
        let err = Connection::dial("udp", "127.0.0.1:1", DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_dial_timeout_is_honored() {
        // RFC 5737 TEST-NET address: connection attempts hang.
        let err = Connection::dial(
            "tcp",
            "192.0.2.1:9",
            DialOptions {
                timeout: Some(Duration::from_millis(50)),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_dial_refused_maps_to_transport_error() {
        let listener = Listener::bind("tcp", "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Connection::dial("tcp", &addr, DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
