//! termlink routing node.
//!
//! Runs the host-facing tunnel endpoint and the client-facing routing server
//! side by side; if either stops, or Ctrl-C arrives, both are shut down.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use termlink::config;
use termlink::host::tunnel::KEEPALIVE_MAX;
use termlink::key::load_or_generate_key;
use termlink::routing::{RegistryResolver, Routing};
use termlink::ssh::{detach_hosts, run_tunnel_endpoint, server_config, SshPiper, TunnelServer};
use termlink::state::TunnelRegistry;
use termlink::supervisor::Supervisor;
use termlink::RoutingError;

/// Idle host connections are dropped after this long.
const TUNNEL_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    config::init();
    let config = config::get();
    info!("Starting termlink node...");

    let server_key = load_or_generate_key(Path::new(&config.server_key_path))?;
    let upstream_key = Arc::new(load_or_generate_key(Path::new(&config.upstream_key_path))?);
    let registry: Arc<TunnelRegistry> = Arc::new(TunnelRegistry::new());

    let mut group = Supervisor::new();

    // Host-facing tunnel endpoint
    let tunnel_listener = TcpListener::bind(config.tunnel_addr).await?;
    info!("Tunnel endpoint listening on {}", config.tunnel_addr);
    let tunnel_server = TunnelServer::new(Arc::clone(&registry), config.node_addr.clone());
    let tunnel_config = Arc::new(server_config(
        server_key.clone(),
        Some(TUNNEL_INACTIVITY_TIMEOUT),
    ));
    let tunnel_token = CancellationToken::new();
    let stop_tunnel = tunnel_token.clone();
    group.add(
        "tunnel endpoint",
        run_tunnel_endpoint(tunnel_server, tunnel_config, tunnel_listener, tunnel_token),
        move |_| stop_tunnel.cancel(),
    );

    // Client-facing routing server
    let resolver = Arc::new(RegistryResolver::new(Arc::clone(&registry), upstream_key));
    let piper = SshPiper::new(server_config(server_key, None), resolver)
        .with_upstream_keepalive(config.keepalive, KEEPALIVE_MAX);
    let routing = Arc::new(Routing::new(piper));
    let ssh_listener = TcpListener::bind(config.ssh_addr).await?;
    info!("Routing server listening on {} (node address {})", config.ssh_addr, config.node_addr);
    let serving = Arc::clone(&routing);
    group.add(
        "routing server",
        async move {
            match serving.serve(ssh_listener).await {
                Err(RoutingError::ListenerClosed) | Ok(()) => Ok(()),
                Err(e) => Err(anyhow::Error::from(e)),
            }
        },
        move |_| routing.shutdown(),
    );

    // Ctrl-C
    let signal_token = CancellationToken::new();
    let stop_signal = signal_token.clone();
    group.add(
        "signal handler",
        async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl-C, shutting down...");
                    Ok::<(), anyhow::Error>(())
                }
                _ = signal_token.cancelled() => Ok(()),
            }
        },
        move |_| stop_signal.cancel(),
    );

    info!("Supervising {} actors", group.len());
    let result = group.run_all().await;

    let detached = detach_hosts(&registry).await;
    if detached > 0 {
        info!("Detached {} host session(s)", detached);
    }
    result
}
