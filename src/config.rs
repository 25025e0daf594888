use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Relay the client connects to when none is configured.
pub const DEFAULT_SERVER_URL: &str = "wss://tunnel.heavymeta.art/connect";

/// Service requested when the caller does not name any.
pub const DEFAULT_SERVICE: &str = "pintheon";

/// Local port the default service listens on.
pub const DEFAULT_LOCAL_PORT: u16 = 9998;

/// HVYM tunnel client.
///
/// Exposes local HTTP services through a relay, authenticating with an
/// Ed25519 keypair. The public URL is derived from the client's key.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Relay WebSocket URL (e.g. wss://tunnel.example.com/connect)
    #[arg(long, env = "HVYM_TUNNEL_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server_url: String,

    /// Relay identity used as the token audience (learned on first contact if empty)
    #[arg(long, env = "HVYM_TUNNEL_SERVER_ADDRESS", default_value = "")]
    pub server_address: String,

    /// Services to request from the relay
    #[arg(
        long,
        env = "HVYM_TUNNEL_SERVICES",
        value_delimiter = ',',
        default_value = DEFAULT_SERVICE
    )]
    pub services: Vec<String>,

    /// Port bindings as service=port pairs
    #[arg(
        long = "bind",
        env = "HVYM_TUNNEL_BINDINGS",
        value_delimiter = ',',
        default_value = "pintheon=9998"
    )]
    pub bindings: Vec<BindingEntry>,

    /// Path to the hex-encoded Ed25519 seed
    #[arg(long, env = "HVYM_TUNNEL_KEY_FILE", default_value = "hvym-tunnel.key")]
    pub key_file: PathBuf,

    /// Reconnect base delay in milliseconds
    #[arg(long, env = "HVYM_TUNNEL_RECONNECT_BASE_MS", default_value_t = 1000)]
    pub reconnect_base_ms: u64,

    /// Reconnect max delay in milliseconds
    #[arg(long, env = "HVYM_TUNNEL_RECONNECT_MAX_MS", default_value_t = 60000)]
    pub reconnect_max_ms: u64,

    /// Reconnect backoff multiplier
    #[arg(long, env = "HVYM_TUNNEL_RECONNECT_MULTIPLIER", default_value_t = 2.0)]
    pub reconnect_multiplier: f64,

    /// WebSocket keepalive ping interval in seconds
    #[arg(long, env = "HVYM_TUNNEL_KEEPALIVE_INTERVAL", default_value_t = 30)]
    pub keepalive_interval_secs: u64,

    /// Extra grace period in seconds before a silent connection is dropped
    #[arg(long, env = "HVYM_TUNNEL_KEEPALIVE_TIMEOUT", default_value_t = 10)]
    pub keepalive_timeout_secs: u64,

    /// Lifetime of the signed auth token in seconds
    #[arg(long, env = "HVYM_TUNNEL_TOKEN_LIFETIME", default_value_t = 3600)]
    pub token_lifetime_secs: u64,

    /// Local port used when the default service has no binding
    #[arg(long, env = "HVYM_TUNNEL_DEFAULT_LOCAL_PORT", default_value_t = DEFAULT_LOCAL_PORT)]
    pub default_local_port: u16,

    /// Timeout in seconds for each handshake wait
    #[arg(long, env = "HVYM_TUNNEL_HANDSHAKE_TIMEOUT", default_value_t = 30)]
    pub handshake_timeout_secs: u64,

    /// Relay connect timeout in seconds
    #[arg(long, env = "HVYM_TUNNEL_CONNECT_TIMEOUT", default_value_t = 15)]
    pub connect_timeout_secs: u64,

    /// Timeout in seconds for each forwarded local request
    #[arg(long, env = "HVYM_TUNNEL_FORWARD_TIMEOUT", default_value_t = 30)]
    pub forward_timeout_secs: u64,

    /// Maximum forwarded requests handled concurrently
    #[arg(long, env = "HVYM_TUNNEL_MAX_CONCURRENT_REQUESTS", default_value_t = 64)]
    pub max_concurrent_requests: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HVYM_TUNNEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "HVYM_TUNNEL_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// A `service=port` pair, as given on the command line or in `[[bindings]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingEntry {
    pub service: String,
    pub port: u16,
}

impl FromStr for BindingEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service, port) = s
            .split_once('=')
            .ok_or_else(|| format!("binding must be service=port, got '{s}'"))?;
        let service = service.trim();
        if service.is_empty() {
            return Err(format!("binding has an empty service name: '{s}'"));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid port in binding '{s}': {e}"))?;
        Ok(Self {
            service: service.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for BindingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.service, self.port)
    }
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Immutable configuration for one [`TunnelClient`](crate::TunnelClient).
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub server_url: String,
    /// Relay identity. Empty until the relay supplies it during the first handshake.
    pub server_address: String,
    pub services: Vec<String>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub reconnect_multiplier: f64,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub token_lifetime: Duration,
    pub default_local_port: u16,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub forward_timeout: Duration,
    pub max_concurrent_requests: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            server_address: String::new(),
            services: vec![DEFAULT_SERVICE.to_string()],
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            reconnect_multiplier: 2.0,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            token_lifetime: Duration::from_secs(3600),
            default_local_port: DEFAULT_LOCAL_PORT,
            handshake_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            forward_timeout: Duration::from_secs(30),
            max_concurrent_requests: 64,
        }
    }
}

impl TunnelConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::new("services list cannot be empty"));
        }
        if let Some(i) = self.services.iter().position(|s| s.trim().is_empty()) {
            return Err(ConfigError::new(format!("services[{i}] is empty")));
        }

        if self.server_url.is_empty() {
            return Err(ConfigError::new("server_url cannot be empty"));
        }
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(ConfigError::new("server_url must start with ws:// or wss://"));
        }

        if self.reconnect_delay > self.max_reconnect_delay {
            return Err(ConfigError::new(format!(
                "reconnect_delay ({:?}) must be <= max_reconnect_delay ({:?})",
                self.reconnect_delay, self.max_reconnect_delay
            )));
        }
        if !(self.reconnect_multiplier >= 1.0 && self.reconnect_multiplier.is_finite()) {
            return Err(ConfigError::new(format!(
                "reconnect_multiplier ({}) must be a finite value >= 1.0",
                self.reconnect_multiplier
            )));
        }

        let timeouts = [
            ("keepalive_interval", self.keepalive_interval),
            ("handshake_timeout", self.handshake_timeout),
            ("connect_timeout", self.connect_timeout),
            ("forward_timeout", self.forward_timeout),
            ("token_lifetime", self.token_lifetime),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::new(format!("{name} must be > 0")));
            }
        }

        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::new("max_concurrent_requests must be > 0"));
        }

        Ok(())
    }

    /// The service inbound requests are forwarded to.
    ///
    /// Requests carry no target service, so everything goes to the first
    /// requested service.
    pub fn primary_service(&self) -> &str {
        self.services
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_SERVICE)
    }

    /// Host part of the relay URL, used to derive a fallback endpoint URL.
    pub fn relay_host(&self) -> Option<String> {
        let url = url::Url::parse(&self.server_url).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

impl From<&Config> for TunnelConfig {
    fn from(config: &Config) -> Self {
        Self {
            server_url: config.server_url.clone(),
            server_address: config.server_address.clone(),
            services: config
                .services
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            reconnect_delay: Duration::from_millis(config.reconnect_base_ms),
            max_reconnect_delay: Duration::from_millis(config.reconnect_max_ms),
            reconnect_multiplier: config.reconnect_multiplier,
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(config.keepalive_timeout_secs),
            token_lifetime: Duration::from_secs(config.token_lifetime_secs),
            default_local_port: config.default_local_port,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            forward_timeout: Duration::from_secs(config.forward_timeout_secs),
            max_concurrent_requests: config.max_concurrent_requests,
        }
    }
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Persisted tunnel settings.
/// All fields are optional -- only populated values are written.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_connect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_base_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_lifetime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,

    /// Port bindings in registration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<BindingEntry>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load, apply `f`, and write back. A missing file starts from defaults.
    pub fn update(path: &Path, f: impl FnOnce(&mut Self)) -> anyhow::Result<()> {
        let mut file = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        f(&mut file);
        file.save(path)
    }

    /// Whether a relay identity has been stored.
    pub fn is_configured(&self) -> bool {
        self.server_address
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    /// Tunnel is enabled unless explicitly switched off.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Record (or replace) a binding, keeping the original position of an existing service.
    pub fn set_binding(&mut self, service: &str, port: u16) {
        match self.bindings.iter_mut().find(|b| b.service == service) {
            Some(entry) => entry.port = port,
            None => self.bindings.push(BindingEntry {
                service: service.to_string(),
                port,
            }),
        }
    }

    pub fn remove_binding(&mut self, service: &str) {
        self.bindings.retain(|b| b.service != service);
    }

    /// Inject values as environment variables so clap picks them up.
    ///
    /// Only sets variables that are **not** already present in the
    /// environment, preserving the precedence: CLI > env > config file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }

        set!("HVYM_TUNNEL_SERVER_URL", self.server_url);
        set!("HVYM_TUNNEL_SERVER_ADDRESS", self.server_address);
        set!(
            "HVYM_TUNNEL_KEY_FILE",
            self.key_file.as_ref().map(|p| p.display())
        );
        set!("HVYM_TUNNEL_RECONNECT_BASE_MS", self.reconnect_base_ms);
        set!("HVYM_TUNNEL_RECONNECT_MAX_MS", self.reconnect_max_ms);
        set!("HVYM_TUNNEL_RECONNECT_MULTIPLIER", self.reconnect_multiplier);
        set!(
            "HVYM_TUNNEL_KEEPALIVE_INTERVAL",
            self.keepalive_interval_secs
        );
        set!("HVYM_TUNNEL_KEEPALIVE_TIMEOUT", self.keepalive_timeout_secs);
        set!("HVYM_TUNNEL_TOKEN_LIFETIME", self.token_lifetime_secs);
        set!("HVYM_TUNNEL_DEFAULT_LOCAL_PORT", self.default_local_port);
        set!("HVYM_TUNNEL_HANDSHAKE_TIMEOUT", self.handshake_timeout_secs);
        set!("HVYM_TUNNEL_CONNECT_TIMEOUT", self.connect_timeout_secs);
        set!("HVYM_TUNNEL_FORWARD_TIMEOUT", self.forward_timeout_secs);
        set!(
            "HVYM_TUNNEL_MAX_CONCURRENT_REQUESTS",
            self.max_concurrent_requests
        );
        set!("HVYM_TUNNEL_LOG_LEVEL", self.log_level);
        set!("HVYM_TUNNEL_LOG_JSON", self.log_json);

        // list-valued settings are comma-separated
        if let Some(ref services) = self.services {
            if std::env::var("HVYM_TUNNEL_SERVICES").is_err() {
                std::env::set_var("HVYM_TUNNEL_SERVICES", services.join(","));
            }
        }
        if !self.bindings.is_empty() && std::env::var("HVYM_TUNNEL_BINDINGS").is_err() {
            let s = self
                .bindings
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            std::env::set_var("HVYM_TUNNEL_BINDINGS", s);
        }
    }
}
