//! Tunnel endpoint: the SSH server hosts attach their sessions to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use russh::server::{self, Config, Handler, Server};
use russh::{Disconnect, MethodSet, SshId};
use russh_keys::PrivateKey;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::handler::TunnelHandler;
use crate::routing::{is_temporary_accept_error, AcceptBackoff};
use crate::state::TunnelRegistry;

/// Creates a [`TunnelHandler`] for each host connection.
#[derive(Clone)]
pub struct TunnelServer {
    registry: Arc<TunnelRegistry>,
    node_addr: Arc<str>,
}

impl TunnelServer {
    pub fn new(registry: Arc<TunnelRegistry>, node_addr: impl Into<String>) -> Self {
        Self {
            registry,
            node_addr: Arc::from(node_addr.into()),
        }
    }
}

impl Server for TunnelServer {
    type Handler = TunnelHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!("New host connection from {:?}", peer_addr);
        TunnelHandler::new(self.registry.clone(), self.node_addr.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!("Host session error: {:?}", error);
    }
}

/// Accept host connections on `listener` until `shutdown` is cancelled.
///
/// Each connection runs its SSH session on its own task.
pub async fn run_tunnel_endpoint(
    mut endpoint: TunnelServer,
    config: Arc<Config>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut backoff = AcceptBackoff::new();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Tunnel endpoint stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) if is_temporary_accept_error(&e) => {
                let delay = backoff.next_delay();
                error!("Tunnel accept error: {}; retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        backoff.reset();

        let handler = endpoint.new_client(Some(peer));
        let config = Arc::clone(&config);
        let mut errors = endpoint.clone();
        tokio::spawn(async move {
            let session = match server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    errors.handle_session_error(e);
                    return;
                }
            };
            match session.await {
                Ok(()) => debug!("Host session from {} ended", peer),
                Err(e) => errors.handle_session_error(e),
            }
        });
    }
}

/// Server configuration shared by the tunnel endpoint and the routing piper.
pub fn server_config(key: PrivateKey, inactivity_timeout: Option<Duration>) -> Config {
    Config {
        server_id: SshId::Standard(format!("SSH-2.0-termlink-{}", env!("CARGO_PKG_VERSION"))),
        inactivity_timeout,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::PUBLICKEY,
        keys: vec![key],
        ..Default::default()
    }
}

/// Drop every registered session and disconnect its host. Returns how many
/// sessions were detached.
pub async fn detach_hosts(registry: &TunnelRegistry) -> usize {
    let mut detached = 0;
    for entry in registry.list().await {
        let Ok(entry) = registry.remove(&entry.session_id).await else {
            // Its host went away while we were iterating.
            continue;
        };
        if let Err(e) = entry
            .handle
            .disconnect(
                Disconnect::ByApplication,
                "node shutting down".to_string(),
                "en".to_string(),
            )
            .await
        {
            warn!("Failed to disconnect host of {}: {}", entry.session_id, e);
        }
        detached += 1;
    }
    detached
}
