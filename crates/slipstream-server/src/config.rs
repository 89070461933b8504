use serde::Deserialize;
use std::time::Duration;

/// Top-level server configuration, loaded from `slipstream.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub web_root: String,
    pub limits: LimitsConfig,
    pub sessions: SessionsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            web_root: "web".to_string(),
            limits: LimitsConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Maximum concurrent WebSocket connections per IP address.
    pub max_ws_per_ip: usize,
    pub ws_rate_limit_per_sec: f64,
    /// Outbound per-connection channel depth. Full channels drop frames,
    /// which is acceptable for steering: only the latest angle matters.
    pub outbound_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 200,
            max_ws_per_ip: 10,
            ws_rate_limit_per_sec: 50.0,
            outbound_buffer: 256,
        }
    }
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_players: usize,
    /// How long a dropped controller keeps its player slot.
    pub controller_grace_secs: u64,
    /// How long a session survives without its host display.
    pub host_grace_secs: u64,
    /// Server-side Lobby → Racing delay, matching the host's 3-2-1-GO.
    pub countdown_secs: u64,
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_players: 10,
            controller_grace_secs: 5,
            host_grace_secs: 30,
            countdown_secs: 4,
            idle_timeout_secs: 3600,
            reap_interval_secs: 60,
        }
    }
}

impl SessionsConfig {
    pub fn controller_grace(&self) -> Duration {
        Duration::from_secs(self.controller_grace_secs)
    }

    pub fn host_grace(&self) -> Duration {
        Duration::from_secs(self.host_grace_secs)
    }

    pub fn countdown(&self) -> Duration {
        Duration::from_secs(self.countdown_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ServerConfig {
    /// Validate configuration, exiting on unrecoverable problems.
    pub fn validate(&self) {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::error!(
                addr = %self.listen_addr,
                "listen_addr is not a valid socket address"
            );
            std::process::exit(1);
        }
        if self.limits.max_ws_connections == 0 {
            tracing::error!("limits.max_ws_connections must be > 0");
            std::process::exit(1);
        }
        if self.limits.max_ws_per_ip == 0 {
            tracing::error!("limits.max_ws_per_ip must be > 0");
            std::process::exit(1);
        }
        if self.limits.ws_rate_limit_per_sec <= 0.0 {
            tracing::error!("limits.ws_rate_limit_per_sec must be > 0");
            std::process::exit(1);
        }
        if self.limits.outbound_buffer == 0 {
            tracing::error!("limits.outbound_buffer must be > 0");
            std::process::exit(1);
        }
        if self.sessions.max_players == 0 {
            tracing::error!("sessions.max_players must be > 0");
            std::process::exit(1);
        }
        if self.sessions.idle_timeout_secs == 0 {
            tracing::error!("sessions.idle_timeout_secs must be > 0");
            std::process::exit(1);
        }
        if self.sessions.reap_interval_secs == 0 {
            tracing::error!("sessions.reap_interval_secs must be > 0");
            std::process::exit(1);
        }
    }

    /// Load config from `slipstream.toml` if it exists, then apply env var
    /// overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("slipstream.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from slipstream.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse slipstream.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No slipstream.toml found, using defaults");
                ServerConfig::default()
            },
        };

        if let Ok(addr) = std::env::var("SLIPSTREAM_LISTEN_ADDR")
            && !addr.is_empty()
        {
            config.listen_addr = addr;
        }
        if let Ok(root) = std::env::var("SLIPSTREAM_WEB_ROOT")
            && !root.is_empty()
        {
            config.web_root = root;
        }
        if let Ok(val) = std::env::var("SLIPSTREAM_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.limits.max_ws_connections = n;
        }
        if let Ok(val) = std::env::var("SLIPSTREAM_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            config.limits.ws_rate_limit_per_sec = n;
        }
        if let Ok(val) = std::env::var("SLIPSTREAM_MAX_PLAYERS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.sessions.max_players = n;
        }
        if let Ok(val) = std::env::var("SLIPSTREAM_HOST_GRACE_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.sessions.host_grace_secs = n;
        }
        if let Ok(val) = std::env::var("SLIPSTREAM_CONTROLLER_GRACE_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.sessions.controller_grace_secs = n;
        }

        config
    }
}
