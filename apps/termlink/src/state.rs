//! Registry of host sessions attached to this node's tunnel endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use log::info;
use russh::server::Handle;
use tokio::sync::RwLock;

use crate::error::TunnelError;

/// A host session registered through `tcpip-forward`.
#[derive(Debug, Clone)]
pub struct TunnelEntry<H = Handle> {
    pub session_id: String,
    /// SSH session handle for opening forwarded channels
    pub handle: H,
    /// The address the host requested to forward
    pub requested_address: String,
    pub requested_port: u32,
    pub created_at: SystemTime,
    pub client_ip: String,
    /// Connection that owns this entry
    pub connection_id: u64,
}

/// Thread-safe map from session id to its tunnel.
#[derive(Debug)]
pub struct TunnelRegistry<H = Handle> {
    tunnels: RwLock<HashMap<String, TunnelEntry<H>>>,
    next_connection_id: AtomicU64,
}

impl<H> Default for TunnelRegistry<H> {
    fn default() -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }
}

impl<H: Clone> TunnelRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, entry: TunnelEntry<H>) -> Result<(), TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&entry.session_id) {
            return Err(TunnelError::SessionTaken(entry.session_id));
        }
        info!(
            "Registered session {} from {} (connection {})",
            entry.session_id, entry.client_ip, entry.connection_id
        );
        tunnels.insert(entry.session_id.clone(), entry);
        Ok(())
    }

    pub async fn remove(&self, session_id: &str) -> Result<TunnelEntry<H>, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        tunnels
            .remove(session_id)
            .ok_or_else(|| TunnelError::SessionNotFound(session_id.to_string()))
    }

    /// Remove the entry only if `connection_id` still owns it.
    pub async fn remove_owned(&self, session_id: &str, connection_id: u64) -> bool {
        let mut tunnels = self.tunnels.write().await;
        match tunnels.get(session_id) {
            Some(entry) if entry.connection_id == connection_id => {
                tunnels.remove(session_id);
                info!("Removed session {} (connection {})", session_id, connection_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<TunnelEntry<H>> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<TunnelEntry<H>> {
        let tunnels = self.tunnels.read().await;
        tunnels.values().cloned().collect()
    }
}
