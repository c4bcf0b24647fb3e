//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::time::Duration;

use parkping_shared::constants::{
    DEFAULT_ADMIN_ID, DEFAULT_HTTP_PORT, DEFAULT_PULSE_INTERVAL_SECS,
};

/// Development-only administrator secret. A warning is logged when the
/// server runs with it.
pub const DEV_ADMIN_SECRET: &str = "super-secret-password";

/// How much of the registry admin snapshots reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// Every account with its flags and channels.
    Full,
    /// Aggregate counts only.
    Summary,
}

impl std::str::FromStr for SnapshotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "summary" => Ok(Self::Summary),
            other => Err(format!("unknown snapshot mode: {other}")),
        }
    }
}

/// Settings the hub task needs.
#[derive(Clone)]
pub struct HubConfig {
    /// Reserved id that logs in as administrator.
    /// Env: `ADMIN_ID`
    /// Default: `admin`
    pub admin_id: String,

    /// Administrator secret, also required by `adminAction`.
    /// Env: `ADMIN_SECRET`
    pub admin_secret: String,

    /// Delay between escalation pulses.
    /// Env: `ALARM_PULSE_INTERVAL_SECS`
    /// Default: 5 seconds
    pub pulse_interval: Duration,

    /// Env: `ADMIN_SNAPSHOT_MODE` (`full` / `summary`)
    /// Default: `full`
    pub snapshot_policy: SnapshotPolicy,
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("admin_id", &self.admin_id)
            .field("admin_secret", &"<redacted>")
            .field("pulse_interval", &self.pulse_interval)
            .field("snapshot_policy", &self.snapshot_policy)
            .finish()
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            admin_id: DEFAULT_ADMIN_ID.to_string(),
            admin_secret: DEV_ADMIN_SECRET.to_string(),
            pulse_interval: Duration::from_secs(DEFAULT_PULSE_INTERVAL_SECS),
            snapshot_policy: SnapshotPolicy::Full,
        }
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3001`
    pub http_addr: SocketAddr,

    pub hub: HubConfig,

    /// Push gateway endpoint. Push is disabled when unset.
    /// Env: `PUSH_GATEWAY_URL`
    pub push_gateway_url: Option<String>,

    /// Bearer token sent to the push gateway.
    /// Env: `PUSH_ACCESS_TOKEN`
    pub push_access_token: Option<String>,

    /// Sustained inbound events per second per connection.
    /// Env: `EVENT_RATE_PER_SEC`
    /// Default: `5`
    pub event_rate: f64,

    /// Inbound event burst per connection.
    /// Env: `EVENT_BURST`
    /// Default: `20`
    pub event_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("hub", &self.hub)
            .field("push_gateway_url", &self.push_gateway_url)
            .field(
                "push_access_token",
                &self.push_access_token.as_ref().map(|_| "<redacted>"),
            )
            .field("event_rate", &self.event_rate)
            .field("event_burst", &self.event_burst)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            hub: HubConfig::default(),
            push_gateway_url: None,
            push_access_token: None,
            event_rate: 5.0,
            event_burst: 20.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        // -- Hub settings --

        if let Ok(id) = std::env::var("ADMIN_ID") {
            if !id.is_empty() {
                config.hub.admin_id = id;
            }
        }

        match std::env::var("ADMIN_SECRET") {
            Ok(secret) if !secret.is_empty() => config.hub.admin_secret = secret,
            _ => tracing::warn!("ADMIN_SECRET not set, using the development secret"),
        }

        if let Ok(val) = std::env::var("ALARM_PULSE_INTERVAL_SECS") {
            match parse_interval(&val) {
                Ok(interval) => config.hub.pulse_interval = interval,
                Err(e) => tracing::warn!(
                    value = %val,
                    error = %e,
                    "Invalid ALARM_PULSE_INTERVAL_SECS, using default"
                ),
            }
        }

        if let Ok(val) = std::env::var("ADMIN_SNAPSHOT_MODE") {
            match val.parse::<SnapshotPolicy>() {
                Ok(policy) => config.hub.snapshot_policy = policy,
                Err(e) => tracing::warn!(error = %e, "Invalid ADMIN_SNAPSHOT_MODE, using default"),
            }
        }

        // -- Push gateway --

        if let Ok(url) = std::env::var("PUSH_GATEWAY_URL") {
            if !url.is_empty() {
                config.push_gateway_url = Some(url);
            }
        }

        if let Ok(token) = std::env::var("PUSH_ACCESS_TOKEN") {
            if !token.is_empty() {
                config.push_access_token = Some(token);
            }
        }

        // -- Inbound event limits --

        if let Ok(val) = std::env::var("EVENT_RATE_PER_SEC") {
            match parse_positive(&val) {
                Some(rate) => config.event_rate = rate,
                None => tracing::warn!(value = %val, "Invalid EVENT_RATE_PER_SEC, using default"),
            }
        }

        if let Ok(val) = std::env::var("EVENT_BURST") {
            match parse_positive(&val) {
                Some(burst) => config.event_burst = burst,
                None => tracing::warn!(value = %val, "Invalid EVENT_BURST, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a whole number of seconds, rejecting zero.
fn parse_interval(value: &str) -> Result<Duration, String> {
    let secs = value
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("not a number of seconds: {e}"))?;
    if secs == 0 {
        return Err("interval must be at least one second".to_string());
    }
    Ok(Duration::from_secs(secs))
}

fn parse_positive(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}
