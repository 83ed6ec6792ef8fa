//! Host side of the reverse tunnel: attach a session to a routing node and
//! accept the client connections it forwards back.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::client::{self, Msg, Session};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, ChannelStream, Disconnect};
use russh_keys::{HashAlg, PrivateKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::listener::Acceptor;
use crate::ssh::types::{ServerInfo, SERVER_INFO_COMMAND};

/// Missed keepalives tolerated before the tunnel is considered dead.
pub const KEEPALIVE_MAX: usize = 3;

const ACCEPT_BACKLOG: usize = 64;

/// Liveness of a reverse tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Established,
    Closed,
}

/// Everything needed to attach a session to a node.
#[derive(Clone)]
pub struct TunnelOptions {
    /// `host:port` of the node's tunnel endpoint
    pub host: String,
    pub session_id: String,
    /// Keys tried in order until one is accepted
    pub signers: Vec<Arc<PrivateKey>>,
    /// Zero disables keepalives
    pub keepalive: Duration,
    /// Expected node host key. `None` accepts any key.
    pub known_host_key: Option<PublicKey>,
}

/// What the node reported once the tunnel was up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub node_addr: String,
}

type Forwarded<S> = (S, Option<SocketAddr>);

struct ClientHandler {
    incoming: mpsc::Sender<Forwarded<ChannelStream<Msg>>>,
    state: Arc<Mutex<TunnelState>>,
    known_host_key: Option<PublicKey>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.known_host_key {
            Some(expected) => Ok(expected == server_public_key),
            None => {
                debug!(
                    "Accepting node key {}",
                    server_public_key.fingerprint(HashAlg::Sha256)
                );
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded connection for {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let peer = originator_address
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, originator_port as u16));

        if self.incoming.try_send((channel.into_stream(), peer)).is_err() {
            warn!("Dropping forwarded connection: listener is closed or full");
        }
        Ok(())
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        set_state(&self.state, TunnelState::Closed);
    }
}

fn set_state(state: &Mutex<TunnelState>, next: TunnelState) {
    match state.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

/// Forwarded client connections arriving over a tunnel.
pub struct TunnelListener<S = ChannelStream<Msg>> {
    incoming: mpsc::Receiver<Forwarded<S>>,
    closed: CancellationToken,
}

impl<S> TunnelListener<S> {
    pub fn new(incoming: mpsc::Receiver<Forwarded<S>>, closed: CancellationToken) -> Self {
        Self { incoming, closed }
    }
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, TunnelError::Closed)
}

#[async_trait]
impl<S> Acceptor for TunnelListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Conn = S;

    async fn accept(&mut self) -> io::Result<(S, Option<SocketAddr>)> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(listener_closed()),
            next = self.incoming.recv() => next.ok_or_else(listener_closed),
        }
    }
}

/// An SSH session to a node with a session id registered on it.
pub struct ReverseTunnel {
    handle: client::Handle<ClientHandler>,
    listener: Option<TunnelListener>,
    info: TunnelInfo,
    state: Arc<Mutex<TunnelState>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl ReverseTunnel {
    /// Dial, authenticate, register the session and learn the node address.
    pub async fn establish(options: &TunnelOptions) -> Result<Self, TunnelError> {
        let state = Arc::new(Mutex::new(TunnelState::Connecting));
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let handler = ClientHandler {
            incoming: tx,
            state: Arc::clone(&state),
            known_host_key: options.known_host_key.clone(),
        };
        let config = Arc::new(client::Config {
            keepalive_interval: (!options.keepalive.is_zero()).then_some(options.keepalive),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        info!("Dialing {} for session {}", options.host, options.session_id);
        let mut handle = client::connect(config, options.host.as_str(), handler)
            .await
            .map_err(|e| TunnelError::Dial {
                host: options.host.clone(),
                reason: e.to_string(),
            })?;

        let info = match register_session(&mut handle, options).await {
            Ok(info) => info,
            Err(e) => {
                let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
                set_state(&state, TunnelState::Closed);
                return Err(e);
            }
        };

        set_state(&state, TunnelState::Established);
        info!(
            "Session {} established via {} (node {})",
            options.session_id, options.host, info.node_addr
        );

        let closed = CancellationToken::new();
        Ok(Self {
            handle,
            listener: Some(TunnelListener::new(rx, closed.clone())),
            info,
            state,
            closing: AtomicBool::new(false),
            closed,
        })
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    pub fn state(&self) -> TunnelState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Take the listener for forwarded connections. Returns it once.
    pub fn listener(&mut self) -> Option<TunnelListener> {
        self.listener.take()
    }

    /// Tear the tunnel down. Idempotent; a closed listener stops accepting.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect failed: {}", e);
        }
        set_state(&self.state, TunnelState::Closed);
        info!("Tunnel to {} closed", self.info.node_addr);
    }
}

async fn register_session(
    handle: &mut client::Handle<ClientHandler>,
    options: &TunnelOptions,
) -> Result<TunnelInfo, TunnelError> {
    if !authenticate(handle, &options.session_id, &options.signers).await? {
        return Err(TunnelError::AuthRejected(options.host.clone()));
    }

    match handle.tcpip_forward(options.session_id.clone(), 0).await {
        Ok(_) => {}
        Err(russh::Error::RequestDenied) => {
            return Err(TunnelError::SessionTaken(options.session_id.clone()))
        }
        Err(e) => return Err(e.into()),
    }
    fetch_server_info(handle).await
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
    signers: &[Arc<PrivateKey>],
) -> Result<bool, TunnelError> {
    for signer in signers {
        if handle.authenticate_publickey(user, Arc::clone(signer)).await? {
            return Ok(true);
        }
        debug!(
            "Key {} rejected",
            signer.public_key().fingerprint(HashAlg::Sha256)
        );
    }
    Ok(false)
}

async fn fetch_server_info(handle: &client::Handle<ClientHandler>) -> Result<TunnelInfo, TunnelError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, SERVER_INFO_COMMAND).await?;

    let mut output = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.extend_from_slice(&data),
            ChannelMsg::Failure => {
                return Err(TunnelError::RequestRefused(SERVER_INFO_COMMAND.to_string()))
            }
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => {}
        }
    }

    let server_info: ServerInfo = serde_json::from_slice(&output)?;
    Ok(TunnelInfo {
        node_addr: server_info.node_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn listener() -> (
        mpsc::Sender<Forwarded<DuplexStream>>,
        CancellationToken,
        TunnelListener<DuplexStream>,
    ) {
        let (tx, rx) = mpsc::channel(4);
        let closed = CancellationToken::new();
        (tx, closed.clone(), TunnelListener::new(rx, closed))
    }

    #[tokio::test]
    async fn test_listener_yields_forwarded_connections() {
        let (tx, _closed, mut listener) = listener();
        let (mut near, far) = duplex(64);
        let peer: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        tx.send((far, Some(peer))).await.unwrap();

        let (mut conn, addr) = listener.accept().await.unwrap();
        assert_eq!(addr, Some(peer));

        near.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_listener_fails_after_close() {
        let (tx, closed, mut listener) = listener();
        let (_near, far) = duplex(64);
        tx.send((far, None)).await.unwrap();
        closed.cancel();

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_listener_fails_when_session_ends() {
        let (tx, _closed, mut listener) = listener();
        drop(tx);

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(err.to_string(), "tunnel closed");
    }

    #[tokio::test]
    async fn test_establish_reports_dial_failure() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let options = TunnelOptions {
            host: addr.to_string(),
            session_id: "abc123".to_string(),
            signers: Vec::new(),
            keepalive: Duration::from_secs(60),
            known_host_key: None,
        };

        match ReverseTunnel::establish(&options).await {
            Err(TunnelError::Dial { host, .. }) => assert_eq!(host, addr.to_string()),
            Err(other) => panic!("expected dial error, got {}", other),
            Ok(_) => panic!("expected dial error"),
        }
    }
}
