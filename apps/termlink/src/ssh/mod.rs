//! SSH sides of a node: the tunnel endpoint hosts attach to, and the piper
//! that relays client sessions to them.

mod bridge;
mod handler;
mod piper;
mod server;
pub mod types;

pub use handler::TunnelHandler;
pub use piper::{SshPipe, SshPiper};
pub use server::{detach_hosts, run_tunnel_endpoint, server_config, TunnelServer};
