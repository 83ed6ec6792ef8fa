//! Host side: publish a local session through a routing node.

pub mod admin;
pub mod tunnel;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use russh::keys::PublicKey;
use russh_keys::PrivateKey;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::ssh::types::{generate_session_id, is_valid_session_id};
use crate::supervisor::Supervisor;
use tunnel::{ReverseTunnel, TunnelListener, TunnelOptions};

pub use tunnel::{TunnelInfo, TunnelState};

/// Environment variable telling the command where the admin socket lives.
pub const ADMIN_SOCKET_ENV: &str = "TERMLINK_ADMIN_SOCKET";

const ADMIN_SOCKET_NAME: &str = "admin.sock";

/// A published session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Tunnel endpoint the host dialed
    pub host: String,
    /// Address clients dial, reported by the node
    pub node_addr: String,
    pub command: Vec<String>,
    pub force_command: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// What the command server should run for each client.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub command: Vec<String>,
    pub force_command: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Serves client sessions arriving on the tunnel listener.
#[async_trait]
pub trait CommandServer: Send + Sync + 'static {
    /// Serve until `shutdown` is cancelled or the listener fails.
    async fn serve(
        &self,
        listener: TunnelListener,
        spec: CommandSpec,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>;
}

pub type SessionCallback = Box<dyn Fn(&Session) -> anyhow::Result<()> + Send + Sync>;

/// Host settings.
#[derive(Clone)]
pub struct HostConfig {
    /// `host:port` of the node's tunnel endpoint
    pub host: String,
    /// Generated when empty
    pub session_id: String,
    pub keepalive: Duration,
    pub command: Vec<String>,
    pub force_command: Vec<String>,
    pub signers: Vec<Arc<PrivateKey>>,
    pub known_host_key: Option<PublicKey>,
    /// Explicit admin socket path. When unset the socket goes in
    /// `<runtime_dir>/<session_id>/admin.sock`.
    pub admin_socket_file: Option<PathBuf>,
    pub runtime_dir: PathBuf,
}

impl HostConfig {
    pub fn new(host: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            host: host.into(),
            session_id: String::new(),
            keepalive: Duration::from_secs(60),
            command,
            force_command: Vec::new(),
            signers: Vec::new(),
            known_host_key: None,
            admin_socket_file: None,
            runtime_dir: default_runtime_dir(),
        }
    }
}

/// `$XDG_RUNTIME_DIR/termlink`, or the temp dir when unset.
pub fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("termlink")
}

/// Per-session directory holding the admin socket. Removed on drop.
struct AdminDir {
    path: PathBuf,
}

impl AdminDir {
    fn create(runtime_dir: &Path, session_id: &str) -> io::Result<Self> {
        let path = runtime_dir.join(session_id);
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&path)?;
        Ok(Self { path })
    }

    fn socket_path(&self) -> PathBuf {
        self.path.join(ADMIN_SOCKET_NAME)
    }
}

impl Drop for AdminDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Publishes one session: tunnel, admin API and command server.
pub struct Host {
    config: HostConfig,
    command_server: Arc<dyn CommandServer>,
    session_created: Option<SessionCallback>,
}

impl Host {
    pub fn new(config: HostConfig, command_server: Arc<dyn CommandServer>) -> Self {
        Self {
            config,
            command_server,
            session_created: None,
        }
    }

    /// Called once the tunnel is up, before serving starts. An error aborts `run`.
    pub fn on_session_created<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Session) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.session_created = Some(Box::new(callback));
        self
    }

    /// Run until `shutdown` is cancelled or any part fails.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        if self.config.session_id.is_empty() {
            self.config.session_id = generate_session_id();
        }
        let session_id = self.config.session_id.clone();
        if !is_valid_session_id(&session_id) {
            return Err(TunnelError::InvalidSessionId(session_id).into());
        }

        let (admin_socket, _admin_dir) = match &self.config.admin_socket_file {
            Some(path) => (path.clone(), None),
            None => {
                let dir = AdminDir::create(&self.config.runtime_dir, &session_id)?;
                (dir.socket_path(), Some(dir))
            }
        };

        let options = TunnelOptions {
            host: self.config.host.clone(),
            session_id: session_id.clone(),
            signers: self.config.signers.clone(),
            keepalive: self.config.keepalive,
            known_host_key: self.config.known_host_key.clone(),
        };
        let mut tunnel = ReverseTunnel::establish(&options).await?;

        let result = self.serve(&mut tunnel, admin_socket, shutdown).await;
        tunnel.close().await;
        result
    }

    async fn serve(
        &self,
        tunnel: &mut ReverseTunnel,
        admin_socket: PathBuf,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let session = Arc::new(Session {
            session_id: self.config.session_id.clone(),
            host: self.config.host.clone(),
            node_addr: tunnel.info().node_addr.clone(),
            command: self.config.command.clone(),
            force_command: self.config.force_command.clone(),
            created_at: Utc::now(),
        });
        info!(
            "Session {} is reachable via {}",
            session.session_id, session.node_addr
        );

        if let Some(callback) = &self.session_created {
            callback(&session)?;
        }

        let listener = tunnel
            .listener()
            .ok_or_else(|| anyhow!("tunnel listener already taken"))?;

        let mut group = Supervisor::new();

        let admin_token = shutdown.child_token();
        let stop_admin = admin_token.clone();
        let admin_session = Arc::clone(&session);
        let admin_path = admin_socket.clone();
        group.add(
            "admin api",
            async move { admin::run_admin_api(&admin_path, admin_session, admin_token).await },
            move |_| stop_admin.cancel(),
        );

        let command_token = shutdown.child_token();
        let stop_command = command_token.clone();
        let spec = CommandSpec {
            command: self.config.command.clone(),
            force_command: self.config.force_command.clone(),
            env: vec![(
                ADMIN_SOCKET_ENV.to_string(),
                admin_socket.display().to_string(),
            )],
        };
        let server = Arc::clone(&self.command_server);
        group.add(
            "command server",
            async move { server.serve(listener, spec, command_token).await },
            move |_| stop_command.cancel(),
        );

        group.run_all().await
    }
}
