//! Upstream resolution: which host a client connection belongs to.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use russh::keys::PublicKey;
use russh::server::Handle;
use russh_keys::{HashAlg, PrivateKey};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ResolveError;
use crate::state::TunnelRegistry;

/// Byte stream toward the upstream host.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> UpstreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type UpstreamStream = Box<dyn UpstreamIo>;

/// What the transport knows about an inbound connection.
#[derive(Debug, Clone)]
pub struct ConnMetadata {
    /// SSH username, carrying the session id.
    pub user: String,
    pub remote_addr: Option<SocketAddr>,
}

/// Credentials presented by the client during authentication.
#[derive(Debug, Clone, Default)]
pub struct ChallengeContext {
    pub public_key: Option<PublicKey>,
}

impl ChallengeContext {
    pub fn fingerprint(&self) -> Option<String> {
        self.public_key
            .as_ref()
            .map(|key| key.fingerprint(HashAlg::Sha256).to_string())
    }
}

/// How the piper authenticates itself toward the upstream.
#[derive(Clone)]
pub enum UpstreamAuth {
    None,
    PublicKey(Arc<PrivateKey>),
}

impl fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamAuth::None => f.write_str("None"),
            UpstreamAuth::PublicKey(_) => f.write_str("PublicKey(..)"),
        }
    }
}

/// Authentication policy for re-terminating the session toward the upstream.
#[derive(Debug, Clone)]
pub struct AuthPipe {
    pub user: String,
    pub method: UpstreamAuth,
    /// Expected upstream host key. `None` accepts any key.
    pub host_key: Option<PublicKey>,
}

impl AuthPipe {
    pub fn none(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            method: UpstreamAuth::None,
            host_key: None,
        }
    }

    pub fn public_key(user: impl Into<String>, key: Arc<PrivateKey>) -> Self {
        Self {
            user: user.into(),
            method: UpstreamAuth::PublicKey(key),
            host_key: None,
        }
    }

    pub fn with_host_key(mut self, host_key: PublicKey) -> Self {
        self.host_key = Some(host_key);
        self
    }
}

/// A resolved upstream. Ownership of the stream moves to the piping layer.
pub struct Route {
    pub upstream: UpstreamStream,
    pub auth: AuthPipe,
}

/// Maps an inbound connection to its upstream.
///
/// Called concurrently from every connection task. Returning
/// [`ResolveError::UnknownClient`] means "no such session" and is treated as
/// ordinary traffic.
#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    async fn find_upstream(
        &self,
        conn: &ConnMetadata,
        challenge: &ChallengeContext,
    ) -> Result<Route, ResolveError>;
}

/// Resolves clients against the hosts registered on this node's tunnel endpoint.
pub struct RegistryResolver {
    registry: Arc<TunnelRegistry<Handle>>,
    upstream_key: Arc<PrivateKey>,
}

impl RegistryResolver {
    pub fn new(registry: Arc<TunnelRegistry<Handle>>, upstream_key: Arc<PrivateKey>) -> Self {
        Self {
            registry,
            upstream_key,
        }
    }
}

#[async_trait]
impl UpstreamResolver for RegistryResolver {
    async fn find_upstream(
        &self,
        conn: &ConnMetadata,
        challenge: &ChallengeContext,
    ) -> Result<Route, ResolveError> {
        let tunnel = self
            .registry
            .get(&conn.user)
            .await
            .ok_or_else(|| ResolveError::UnknownClient(conn.user.clone()))?;

        let (originator_address, originator_port) = match conn.remote_addr {
            Some(addr) => (addr.ip().to_string(), addr.port() as u32),
            None => ("127.0.0.1".to_string(), 0),
        };

        let channel = tunnel
            .handle
            .channel_open_forwarded_tcpip(
                tunnel.requested_address.clone(),
                tunnel.requested_port,
                originator_address,
                originator_port,
            )
            .await
            .map_err(|e| ResolveError::Unavailable {
                session: conn.user.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "Routing client {:?} (key {}) to session {} on {}",
            conn.remote_addr,
            challenge.fingerprint().unwrap_or_else(|| "none".to_string()),
            tunnel.session_id,
            tunnel.client_ip
        );

        Ok(Route {
            upstream: Box::new(channel.into_stream()),
            auth: AuthPipe::public_key(conn.user.clone(), Arc::clone(&self.upstream_key)),
        })
    }
}
