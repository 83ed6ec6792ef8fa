//! termlink: publish an interactive session from behind NAT through a routing
//! node over SSH reverse tunnels.
//!
//! The host side lives in [`host`]; the node side is [`routing`] plus the SSH
//! pieces in [`ssh`].

pub mod config;
pub mod error;
pub mod host;
pub mod key;
pub mod listener;
pub mod routing;
pub mod ssh;
pub mod state;
pub mod supervisor;

pub use error::{PipeError, ResolveError, RoutingError, TunnelError};
pub use host::{CommandServer, CommandSpec, Host, HostConfig, Session};
pub use key::load_or_generate_key;
pub use listener::Acceptor;
pub use routing::{Negotiator, PipedConnection, RegistryResolver, Routing, UpstreamResolver};
pub use ssh::{SshPiper, TunnelServer};
pub use state::{TunnelEntry, TunnelRegistry};
pub use supervisor::Supervisor;
