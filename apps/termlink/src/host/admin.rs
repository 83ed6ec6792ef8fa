//! Admin API for a running host session, served on a Unix socket.

use std::path::Path;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use log::{debug, info};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use super::Session;

/// GET /session - The session this host is serving
async fn get_session(State(session): State<Arc<Session>>) -> Json<Session> {
    Json(session.as_ref().clone())
}

/// Create the admin API router
pub fn create_admin_router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/session", get(get_session))
        .with_state(session)
}

/// Serve the admin API on `socket_path` until `shutdown` is cancelled.
pub async fn run_admin_api(
    socket_path: &Path,
    session: Arc<Session>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        debug!("Removing stale admin socket {}", socket_path.display());
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!("Admin API listening on {}", socket_path.display());

    axum::serve(listener, create_admin_router(session))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Admin API stopped");
    Ok(())
}
