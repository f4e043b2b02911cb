use std::env;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_PREFIX: &str = "dataChannel";
/// Subprotocol requested on the rendezvous websocket.
pub const SIGNALING_SUBPROTOCOL: &str = "json";

/// Where the rendezvous service listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    pub host: String,
    pub port: u16,
}

impl SignalingEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: normalize_host(host.into()),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl Default for SignalingEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

// Prefer IPv4 loopback; `localhost` may resolve to ::1 first.
fn normalize_host(host: String) -> String {
    if host == "localhost" {
        DEFAULT_HOST.to_string()
    } else {
        host
    }
}

/// Peer connection layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub signaling: SignalingEndpoint,
    /// STUN/TURN urls handed to every new connection
    pub ice_servers: Vec<String>,
    /// Leading component of derived data channel labels
    pub channel_prefix: String,
    /// Upper bound for a single negotiation step; `None` waits indefinitely
    pub negotiation_timeout: Option<Duration>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingEndpoint::default(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            negotiation_timeout: None,
        }
    }
}

impl PeerConfig {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = env::var("PORTAL_SIGNALING_HOST") {
            if !host.trim().is_empty() {
                config.signaling.host = normalize_host(host.trim().to_string());
            }
        }
        if let Some(port) = env::var("PORTAL_SIGNALING_PORT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            config.signaling.port = port;
        }
        if let Ok(servers) = env::var("PORTAL_ICE_SERVERS") {
            config.ice_servers = parse_server_list(&servers);
        }
        if let Some(ms) = env::var("PORTAL_NEGOTIATION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config.negotiation_timeout = Some(Duration::from_millis(ms));
        }
        config
    }

    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::default()
    }

    /// Label for the channel this process opens towards `remote`, e.g.
    /// `dataChannel-a-b` when `a` connects to `b`.
    pub fn channel_label(&self, local: &impl std::fmt::Display, remote: &impl std::fmt::Display) -> String {
        format!("{}-{local}-{remote}", self.channel_prefix)
    }
}

fn parse_server_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
pub struct PeerConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    ice_servers: Option<Vec<String>>,
    channel_prefix: Option<String>,
    negotiation_timeout: Option<Duration>,
}

impl PeerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn add_ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_servers.get_or_insert_with(Vec::new).push(url.into());
        self
    }

    /// Disables STUN/TURN entirely, useful for loopback setups.
    pub fn no_ice_servers(mut self) -> Self {
        self.ice_servers = Some(Vec::new());
        self
    }

    pub fn channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = Some(prefix.into());
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> PeerConfig {
        let mut config = PeerConfig::default();
        if let Some(host) = self.host {
            config.signaling.host = normalize_host(host);
        }
        if let Some(port) = self.port {
            config.signaling.port = port;
        }
        if let Some(servers) = self.ice_servers {
            config.ice_servers = servers;
        }
        if let Some(prefix) = self.channel_prefix {
            config.channel_prefix = prefix;
        }
        config.negotiation_timeout = self.negotiation_timeout;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment mutations must not interleave across tests.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 4] = [
        "PORTAL_SIGNALING_HOST",
        "PORTAL_SIGNALING_PORT",
        "PORTAL_ICE_SERVERS",
        "PORTAL_NEGOTIATION_TIMEOUT_MS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn defaults() {
        let config = PeerConfig::default();
        assert_eq!(config.signaling.url(), "ws://127.0.0.1:8080");
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.negotiation_timeout, None);
    }

    #[test]
    fn from_env_without_variables_matches_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(PeerConfig::from_env(), PeerConfig::default());
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("PORTAL_SIGNALING_HOST", "localhost");
            env::set_var("PORTAL_SIGNALING_PORT", "9001");
            env::set_var("PORTAL_ICE_SERVERS", "stun:a.example:3478, ,turn:b.example");
            env::set_var("PORTAL_NEGOTIATION_TIMEOUT_MS", "1500");
        }
        let config = PeerConfig::from_env();
        clear_env();

        assert_eq!(config.signaling.url(), "ws://127.0.0.1:9001");
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example".to_string()]
        );
        assert_eq!(config.negotiation_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unparsable_port_falls_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("PORTAL_SIGNALING_PORT", "not-a-port") };
        let config = PeerConfig::from_env();
        clear_env();
        assert_eq!(config.signaling.port, DEFAULT_PORT);
    }

    #[test]
    fn builder_and_channel_label() {
        let config = PeerConfig::builder()
            .host("rendezvous.local")
            .port(7000)
            .no_ice_servers()
            .channel_prefix("portal")
            .build();
        assert_eq!(config.signaling.url(), "ws://rendezvous.local:7000");
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.channel_label(&"a", &"b"), "portal-a-b");
    }
}
