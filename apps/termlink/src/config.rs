//! Centralized configuration for the routing node.
//!
//! Configuration comes from environment variables (a `.env` file is loaded
//! first when present). Every variable has a default; an unparsable value
//! panics at startup.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Environment variable names
// ============================================================================

mod env {
    pub const SSH_ADDR: &str = "TERMLINK_SSH_ADDR";
    pub const TUNNEL_ADDR: &str = "TERMLINK_TUNNEL_ADDR";
    pub const NODE_ADDR: &str = "TERMLINK_NODE_ADDR";
    pub const SERVER_KEY_PATH: &str = "SERVER_KEY_PATH";
    pub const UPSTREAM_KEY_PATH: &str = "UPSTREAM_KEY_PATH";
    pub const KEEPALIVE_SECS: &str = "TERMLINK_KEEPALIVE_SECS";
}

const DEFAULT_SSH_ADDR: &str = "0.0.0.0:2222";
const DEFAULT_TUNNEL_ADDR: &str = "0.0.0.0:2223";
const DEFAULT_SERVER_KEY_PATH: &str = "server_key.pem";
const DEFAULT_UPSTREAM_KEY_PATH: &str = "upstream_key.pem";
const DEFAULT_KEEPALIVE_SECS: u64 = 60;

// ============================================================================
// Global configuration (loaded once at startup)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Client-facing routing listener
    pub ssh_addr: SocketAddr,
    /// Host-facing tunnel endpoint
    pub tunnel_addr: SocketAddr,
    /// Address advertised to hosts in server-info
    pub node_addr: String,
    pub server_key_path: String,
    pub upstream_key_path: String,
    /// Keepalive toward upstreams, zero disables
    pub keepalive: Duration,
}

impl Config {
    fn load() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let ssh_addr = parse_addr(env::SSH_ADDR, lookup(env::SSH_ADDR), DEFAULT_SSH_ADDR);
        let tunnel_addr = parse_addr(
            env::TUNNEL_ADDR,
            lookup(env::TUNNEL_ADDR),
            DEFAULT_TUNNEL_ADDR,
        );
        let node_addr = lookup(env::NODE_ADDR).unwrap_or_else(|| ssh_addr.to_string());

        let keepalive_secs = match lookup(env::KEEPALIVE_SECS) {
            Some(value) => value.parse::<u64>().unwrap_or_else(|_| {
                panic!("{} must be a number of seconds, got '{}'", env::KEEPALIVE_SECS, value)
            }),
            None => DEFAULT_KEEPALIVE_SECS,
        };

        Self {
            ssh_addr,
            tunnel_addr,
            node_addr,
            server_key_path: lookup(env::SERVER_KEY_PATH)
                .unwrap_or_else(|| DEFAULT_SERVER_KEY_PATH.to_string()),
            upstream_key_path: lookup(env::UPSTREAM_KEY_PATH)
                .unwrap_or_else(|| DEFAULT_UPSTREAM_KEY_PATH.to_string()),
            keepalive: Duration::from_secs(keepalive_secs),
        }
    }
}

fn parse_addr(name: &str, value: Option<String>, default: &str) -> SocketAddr {
    let value = value.unwrap_or_else(|| default.to_string());
    value
        .parse()
        .unwrap_or_else(|_| panic!("{} must be a socket address, got '{}'", name, value))
}

// ============================================================================
// Public API
// ============================================================================

/// Initialize configuration. Must be called once at startup.
/// Panics if a variable holds an invalid value.
pub fn init() {
    CONFIG.get_or_init(Config::load);
}

/// Get the global configuration. Panics if not initialized.
pub fn get() -> &'static Config {
    CONFIG.get().expect("Config not initialized. Call config::init() first.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.ssh_addr, "0.0.0.0:2222".parse().unwrap());
        assert_eq!(config.tunnel_addr, "0.0.0.0:2223".parse().unwrap());
        assert_eq!(config.node_addr, "0.0.0.0:2222");
        assert_eq!(config.server_key_path, "server_key.pem");
        assert_eq!(config.upstream_key_path, "upstream_key.pem");
        assert_eq!(config.keepalive, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("TERMLINK_SSH_ADDR", "127.0.0.1:22"),
            ("TERMLINK_NODE_ADDR", "node-1.example.com:22"),
            ("TERMLINK_KEEPALIVE_SECS", "0"),
        ]);
        assert_eq!(config.ssh_addr.port(), 22);
        assert_eq!(config.node_addr, "node-1.example.com:22");
        assert!(config.keepalive.is_zero());
    }

    #[test]
    #[should_panic(expected = "TERMLINK_TUNNEL_ADDR must be a socket address")]
    fn test_invalid_address_panics() {
        config_from(&[("TERMLINK_TUNNEL_ADDR", "not-an-address")]);
    }

    #[test]
    #[should_panic(expected = "TERMLINK_KEEPALIVE_SECS must be a number of seconds")]
    fn test_invalid_keepalive_panics() {
        config_from(&[("TERMLINK_KEEPALIVE_SECS", "soon")]);
    }
}
