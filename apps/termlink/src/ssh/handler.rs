//! SSH handler for host connections on the tunnel endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::HashAlg;

use super::types::{is_valid_session_id, ServerInfo, SERVER_INFO_COMMAND};
use crate::error::TunnelError;
use crate::state::{TunnelEntry, TunnelRegistry};

/// Handler for a single host connection.
///
/// The SSH username is the session id. A `tcpip-forward` request registers the
/// session; the registration lives until it is cancelled or the connection ends.
pub struct TunnelHandler {
    registry: Arc<TunnelRegistry>,
    node_addr: Arc<str>,
    peer_addr: Option<SocketAddr>,
    connection_id: u64,
    username: Option<String>,
    session_handle: Option<Handle>,
    registered_sessions: Vec<String>,
}

impl TunnelHandler {
    pub fn new(registry: Arc<TunnelRegistry>, node_addr: Arc<str>, peer_addr: Option<SocketAddr>) -> Self {
        let connection_id = registry.next_connection_id();
        Self {
            registry,
            node_addr,
            peer_addr,
            connection_id,
            username: None,
            session_handle: None,
            registered_sessions: Vec::new(),
        }
    }

    /// Session id a forward request registers. A host only ever binds its own
    /// username; the address must be empty or equal to it.
    fn forward_session_id(&self, address: &str) -> Option<String> {
        let username = self.username.as_deref()?;
        if address.is_empty() || address == username {
            Some(username.to_string())
        } else {
            None
        }
    }

    fn client_ip(&self) -> String {
        self.peer_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn server_info_json(&self) -> Result<String, TunnelError> {
        let info = ServerInfo {
            node_addr: self.node_addr.to_string(),
        };
        Ok(serde_json::to_string(&info)?)
    }
}

#[async_trait]
impl Handler for TunnelHandler {
    type Error = TunnelError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        info!(
            "Host auth attempt: session='{}', fingerprint='{}'",
            user, fingerprint
        );

        if !is_valid_session_id(user) {
            warn!("Rejecting host with invalid session id '{}'", user);
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        debug!("Host authenticated: {:?}", self.username);
        self.session_handle = Some(session.handle());
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let session_id = match self.forward_session_id(address) {
            Some(id) if is_valid_session_id(&id) => id,
            _ => {
                warn!(
                    "Refusing forward of '{}' for host {:?}",
                    address, self.username
                );
                return Ok(false);
            }
        };

        let handle = match &self.session_handle {
            Some(h) => h.clone(),
            None => {
                error!("No session handle available!");
                return Ok(false);
            }
        };

        let entry = TunnelEntry {
            session_id: session_id.clone(),
            handle,
            requested_address: address.to_string(),
            requested_port: *port,
            created_at: SystemTime::now(),
            client_ip: self.client_ip(),
            connection_id: self.connection_id,
        };

        match self.registry.register(entry).await {
            Ok(()) => {
                self.registered_sessions.push(session_id);
                Ok(true)
            }
            Err(TunnelError::SessionTaken(id)) => {
                warn!("Session {} already taken", id);
                Ok(false)
            }
            Err(e) => {
                error!("Failed to register session: {}", e);
                Err(e)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("Cancel tcpip_forward: address='{}', port={}", address, port);

        let Some(session_id) = self.forward_session_id(address) else {
            return Ok(false);
        };
        if !self.registry.remove_owned(&session_id, self.connection_id).await {
            return Ok(false);
        }
        self.registered_sessions.retain(|s| s != &session_id);
        Ok(true)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: id={:?}", channel.id());
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if data != SERVER_INFO_COMMAND.as_bytes() {
            warn!(
                "Unsupported exec request on channel {:?}: {}",
                channel,
                String::from_utf8_lossy(data)
            );
            session.channel_failure(channel)?;
            return Ok(());
        }

        session.channel_success(channel)?;
        let reply = self.server_info_json()?;
        let handle = session.handle();
        tokio::spawn(async move {
            if handle.data(channel, CryptoVec::from(reply.into_bytes())).await.is_err() {
                debug!("Host went away before server info was sent");
                return;
            }
            let _ = handle.exit_status_request(channel, 0).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel {:?} closed", channel);
        Ok(())
    }
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        if self.registered_sessions.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let sessions = std::mem::take(&mut self.registered_sessions);
        let connection_id = self.connection_id;
        runtime.spawn(async move {
            for session_id in sessions {
                registry.remove_owned(&session_id, connection_id).await;
            }
        });
    }
}
