//! SSH-aware negotiator: terminates the client's SSH session, resolves the
//! upstream from the offered username and key, then re-originates the session
//! toward the upstream and relays its channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{client, Channel, ChannelId, Disconnect, MethodSet, Pty};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::bridge::{spawn_bridge, ChannelCommand};
use crate::error::PipeError;
use crate::listener::display_peer;
use crate::routing::{
    ChallengeContext, ConnMetadata, Negotiator, PipedConnection, Route, UpstreamAuth,
    UpstreamResolver,
};

/// Negotiates SSH sessions and pipes them to resolved upstreams.
pub struct SshPiper {
    config: Arc<server::Config>,
    upstream_config: Arc<client::Config>,
    resolver: Arc<dyn UpstreamResolver>,
}

impl SshPiper {
    pub fn new(mut config: server::Config, resolver: Arc<dyn UpstreamResolver>) -> Self {
        config.methods = MethodSet::PUBLICKEY;
        Self {
            config: Arc::new(config),
            upstream_config: Arc::new(client::Config::default()),
            resolver,
        }
    }

    /// Keepalive toward upstreams. A zero interval disables it.
    pub fn with_upstream_keepalive(mut self, interval: Duration, max: usize) -> Self {
        self.upstream_config = Arc::new(client::Config {
            keepalive_interval: (!interval.is_zero()).then_some(interval),
            keepalive_max: max,
            ..Default::default()
        });
        self
    }
}

#[async_trait]
impl<C> Negotiator<C> for SshPiper
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Piped = SshPipe;

    async fn negotiate(&self, conn: C, peer: Option<SocketAddr>) -> Result<SshPipe, PipeError> {
        let (established_tx, established_rx) = oneshot::channel();
        let upstream_gone = CancellationToken::new();
        let handler = PiperHandler {
            resolver: Arc::clone(&self.resolver),
            upstream_config: Arc::clone(&self.upstream_config),
            peer,
            resolved: false,
            upstream: None,
            upstream_gone: upstream_gone.clone(),
            established: Some(established_tx),
            channels: HashMap::new(),
        };

        let session = server::run_stream(Arc::clone(&self.config), conn, handler).await?;
        let client = session.handle();
        let mut task = tokio::spawn(session);
        let guard = SessionGuard {
            client,
            abort: Some(task.abort_handle()),
        };

        if established_rx.await.is_ok() {
            return Ok(SshPipe {
                task: Some(task),
                guard,
                upstream_gone,
            });
        }

        // The handler is gone, so the session ended during the handshake.
        match (&mut task).await {
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => Err(PipeError::HandshakeAborted),
            Err(join_err) => Err(PipeError::Task(join_err.to_string())),
        }
    }
}

/// Ends the client session when the pipe is dropped without `close`.
struct SessionGuard {
    client: server::Handle,
    abort: Option<AbortHandle>,
}

impl SessionGuard {
    async fn disconnect(&mut self) {
        if self.abort.take().is_none() {
            return;
        }
        let _ = self
            .client
            .disconnect(
                Disconnect::ByApplication,
                "session closed".to_string(),
                "en".to_string(),
            )
            .await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

/// A client session relayed to its upstream.
pub struct SshPipe {
    task: Option<JoinHandle<Result<(), PipeError>>>,
    guard: SessionGuard,
    upstream_gone: CancellationToken,
}

#[async_trait]
impl PipedConnection for SshPipe {
    async fn wait(&mut self) -> Result<(), PipeError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        let joined = tokio::select! {
            joined = task => joined,
            _ = self.upstream_gone.cancelled() => {
                debug!("Upstream session ended");
                return Ok(());
            }
        };

        self.task = None;
        match joined {
            Ok(result) => result,
            Err(join_err) => Err(PipeError::Task(join_err.to_string())),
        }
    }

    async fn close(&mut self) {
        self.guard.disconnect().await;
        self.task = None;
    }
}

struct UpstreamHandler {
    host_key: Option<PublicKey>,
    gone: CancellationToken,
}

#[async_trait]
impl client::Handler for UpstreamHandler {
    type Error = PipeError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(match &self.host_key {
            Some(expected) => expected == server_public_key,
            None => true,
        })
    }
}

impl Drop for UpstreamHandler {
    fn drop(&mut self) {
        self.gone.cancel();
    }
}

async fn connect_upstream(
    route: Route,
    config: Arc<client::Config>,
    gone: CancellationToken,
) -> Result<client::Handle<UpstreamHandler>, PipeError> {
    let handler = UpstreamHandler {
        host_key: route.auth.host_key.clone(),
        gone,
    };
    let mut upstream = client::connect_stream(config, route.upstream, handler).await?;

    let accepted = match &route.auth.method {
        UpstreamAuth::None => upstream.authenticate_none(route.auth.user.clone()).await?,
        UpstreamAuth::PublicKey(key) => {
            upstream
                .authenticate_publickey(route.auth.user.clone(), Arc::clone(key))
                .await?
        }
    };

    if !accepted {
        let _ = upstream
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        return Err(PipeError::UpstreamAuthRejected(route.auth.user));
    }
    Ok(upstream)
}

struct PiperHandler {
    resolver: Arc<dyn UpstreamResolver>,
    upstream_config: Arc<client::Config>,
    peer: Option<SocketAddr>,
    resolved: bool,
    upstream: Option<client::Handle<UpstreamHandler>>,
    upstream_gone: CancellationToken,
    established: Option<oneshot::Sender<()>>,
    channels: HashMap<ChannelId, mpsc::Sender<ChannelCommand>>,
}

impl PiperHandler {
    /// Hand a command to the channel's bridge, waiting while its queue is full.
    async fn forward(&mut self, channel: ChannelId, command: ChannelCommand) -> bool {
        match self.channels.get(&channel) {
            Some(bridge) => bridge.send(command).await.is_ok(),
            None => false,
        }
    }

    fn ack(&self, channel: ChannelId, forwarded: bool, session: &mut Session) -> Result<(), PipeError> {
        if forwarded {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }
}

#[async_trait]
impl server::Handler for PiperHandler {
    type Error = PipeError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.resolved {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }
        self.resolved = true;

        let conn = ConnMetadata {
            user: user.to_string(),
            remote_addr: self.peer,
        };
        let challenge = ChallengeContext {
            public_key: Some(public_key.clone()),
        };
        let route = self.resolver.find_upstream(&conn, &challenge).await?;
        let upstream = connect_upstream(
            route,
            Arc::clone(&self.upstream_config),
            self.upstream_gone.clone(),
        )
        .await?;

        info!("[{}] piping session '{}'", display_peer(self.peer), user);
        self.upstream = Some(upstream);
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(established) = self.established.take() {
            let _ = established.send(());
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(upstream) = &self.upstream else {
            return Ok(false);
        };

        let upstream_channel = match upstream.channel_open_session().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Upstream refused session channel: {}", e);
                return Ok(false);
            }
        };

        let id = channel.id();
        let bridge = spawn_bridge(upstream_channel, session.handle(), id);
        self.channels.insert(id, bridge);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let forwarded = self
            .forward(
                channel,
                ChannelCommand::Pty {
                    term: term.to_string(),
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    modes: modes.to_vec(),
                },
            )
            .await;
        self.ack(channel, forwarded, session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let forwarded = self.forward(channel, ChannelCommand::Shell).await;
        self.ack(channel, forwarded, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let forwarded = self
            .forward(channel, ChannelCommand::Exec(data.to_vec()))
            .await;
        self.ack(channel, forwarded, session)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let forwarded = self
            .forward(
                channel,
                ChannelCommand::Env {
                    name: variable_name.to_string(),
                    value: variable_value.to_string(),
                },
            )
            .await;
        self.ack(channel, forwarded, session)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let forwarded = self
            .forward(channel, ChannelCommand::Subsystem(name.to_string()))
            .await;
        self.ack(channel, forwarded, session)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelCommand::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelCommand::Data(data.to_vec())).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelCommand::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelCommand::Close).await;
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for PiperHandler {
    fn drop(&mut self) {
        let Some(upstream) = self.upstream.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = upstream
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
            });
        }
    }
}
