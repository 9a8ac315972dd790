use std::env;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub path: String,
    pub ping_interval: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Unset or unusable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: lookup("PARLEY_BIND_ADDR")
                .and_then(|addr| addr.parse().ok())
                .unwrap_or(defaults.bind_addr),
            path: lookup("PARLEY_PATH")
                .filter(|path| path.starts_with('/'))
                .unwrap_or(defaults.path),
            ping_interval: lookup("PARLEY_PING_INTERVAL_SECS")
                .and_then(|secs| secs.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.ping_interval),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            path: "/signal".to_string(),
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            relay_url: lookup("PARLEY_RELAY_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| Self::default().relay_url),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:3000/signal".to_string(),
        }
    }
}
