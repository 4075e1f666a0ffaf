//! Node configuration: defaults plus `PK_*` environment overrides.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PK_PEER_BIND` | `peer_bind` |
//! | `PK_UDP_BIND` | `udp_bind` |
//! | `PK_MULTICAST_GROUP` | `multicast_group` |
//! | `PK_MULTICAST_PORT` | `multicast_port` |
//! | `PK_PEER_STORE` | `peer_store_path` |
//!
//! Values that do not parse are logged and ignored.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::discovery::{
    DEFAULT_BROADCAST_INTERVAL, DEFAULT_FIND_TIMEOUT, DEFAULT_MULTICAST_GROUP,
    DEFAULT_MULTICAST_PORT, MulticastConfig,
};
use crate::node_graph::{DEFAULT_ALPHA, DEFAULT_K};
use crate::relay::MAX_RELAY_SESSIONS;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// TCP peer server.
    pub peer_bind: SocketAddr,
    /// UDP endpoint for hole punching.
    pub udp_bind: SocketAddr,
    /// Host advertised to peers in place of the bound IP.
    pub advertise_host: Option<String>,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub broadcast_interval: Duration,
    pub find_timeout: Duration,
    pub ping_timeout: Duration,
    pub peer_store_path: Option<PathBuf>,
    pub stealth: bool,
    /// Run multicast discovery at all.
    pub multicast: bool,
    pub k: usize,
    pub alpha: usize,
    pub max_relay_sessions: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            udp_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_host: None,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            find_timeout: DEFAULT_FIND_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            peer_store_path: None,
            stealth: false,
            multicast: true,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            max_relay_sessions: MAX_RELAY_SESSIONS,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}

impl NodeConfig {
    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply `PK_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var("PK_PEER_BIND", lookup("PK_PEER_BIND")) {
            self.peer_bind = v;
        }
        if let Some(v) = parse_var("PK_UDP_BIND", lookup("PK_UDP_BIND")) {
            self.udp_bind = v;
        }
        if let Some(v) = parse_var::<Ipv4Addr>("PK_MULTICAST_GROUP", lookup("PK_MULTICAST_GROUP")) {
            if v.is_multicast() {
                self.multicast_group = v;
            } else {
                warn!(value = %v, "PK_MULTICAST_GROUP is not a multicast address, ignoring");
            }
        }
        if let Some(v) = parse_var("PK_MULTICAST_PORT", lookup("PK_MULTICAST_PORT")) {
            self.multicast_port = v;
        }
        if let Some(path) = lookup("PK_PEER_STORE").filter(|p| !p.trim().is_empty()) {
            self.peer_store_path = Some(PathBuf::from(path));
        }
    }

    pub fn multicast_config(&self) -> MulticastConfig {
        MulticastConfig {
            group: self.multicast_group,
            port: self.multicast_port,
            interval: self.broadcast_interval,
            ..MulticastConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_discovery_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.multicast_group, Ipv4Addr::new(224, 0, 0, 251));
        assert_eq!(config.multicast_port, 5353);
        assert_eq!(config.find_timeout, Duration::from_secs(50));
        assert_eq!(config.k, 20);
        assert!(!config.stealth);
    }

    #[test]
    fn valid_overrides_apply() {
        let mut config = NodeConfig::default();
        config.apply_env_overrides(env(&[
            ("PK_PEER_BIND", "127.0.0.1:1314"),
            ("PK_MULTICAST_GROUP", "239.1.2.3"),
            ("PK_MULTICAST_PORT", "6000"),
            ("PK_PEER_STORE", "/tmp/peers.db"),
        ]));
        assert_eq!(config.peer_bind, SocketAddr::from(([127, 0, 0, 1], 1314)));
        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(config.multicast_port, 6000);
        assert_eq!(config.peer_store_path, Some(PathBuf::from("/tmp/peers.db")));
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut config = NodeConfig::default();
        config.apply_env_overrides(env(&[
            ("PK_UDP_BIND", "not an address"),
            ("PK_MULTICAST_GROUP", "10.0.0.1"),
            ("PK_MULTICAST_PORT", "70000"),
        ]));
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = NodeConfig {
            stealth: true,
            peer_store_path: Some(PathBuf::from("peers.db")),
            ..NodeConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<NodeConfig>(&json).unwrap(), config);
        assert_eq!(serde_json::from_str::<NodeConfig>("{}").unwrap(), NodeConfig::default());
    }
}
