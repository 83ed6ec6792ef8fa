//! Accept-side abstraction shared by the routing server and the tunnel listener.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A source of inbound byte streams.
#[async_trait]
pub trait Acceptor: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection and the peer address, when known.
    async fn accept(&mut self) -> io::Result<(Self::Conn, Option<SocketAddr>)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, Option<SocketAddr>)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok((stream, Some(addr)))
    }
}

/// Format a peer address for log prefixes.
pub fn display_peer(peer: Option<SocketAddr>) -> String {
    peer.map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
