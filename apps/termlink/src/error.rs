//! Error types for tunnels, routing and piping.

use std::io;

/// Errors raised while establishing or serving reverse tunnels.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to dial {host}: {reason}")]
    Dial { host: String, reason: String },

    #[error("authentication rejected by {0}")]
    AuthRejected(String),

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("session '{0}' is already registered")]
    SessionTaken(String),

    #[error("no tunnel registered for session '{0}'")]
    SessionNotFound(String),

    #[error("server refused the '{0}' request")]
    RequestRefused(String),

    #[error("malformed server info: {0}")]
    ServerInfo(#[from] serde_json::Error),

    #[error("tunnel closed")]
    Closed,

    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Answer of an upstream resolver that could not produce a route.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No session matches the connection. Expected traffic, logged quietly.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("upstream for session '{session}' is unavailable: {reason}")]
    Unavailable { session: String, reason: String },
}

/// Errors ending a single piped connection, during handshake or relay.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("upstream rejected authentication for user '{0}'")]
    UpstreamAuthRejected(String),

    #[error("connection closed before a route was established")]
    HandshakeAborted,

    #[error("pipe task failed: {0}")]
    Task(String),

    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Errors ending the routing accept loop.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// `shutdown` was requested. Not a failure.
    #[error("routing: listener closed")]
    ListenerClosed,

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}
