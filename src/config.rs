//! Configuration loading and validation.
//!
//! All configuration comes from the environment. `Config::load` validates
//! everything up front so a bad deployment fails at startup (exit code 1)
//! instead of at the first handshake.

use crate::error::{ConfigError, Result};

use std::net::SocketAddr;
use std::time::Duration;

/// Hivecore configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data-plane bind address agents connect to.
    pub listen_address: SocketAddr,

    /// Admin HTTP API bind address.
    pub admin_address: SocketAddr,

    /// Optional Prometheus exporter bind address. Disabled when unset.
    pub metrics_address: Option<SocketAddr>,

    /// Bearer token required on every admin API call.
    pub admin_token: String,

    /// Heartbeat interval handed to instances at handshake.
    pub heartbeat_interval: Duration,

    /// A session is torn down after `grace_factor * heartbeat_interval`
    /// without a heartbeat.
    pub heartbeat_grace_factor: u32,

    /// How long a connection may sit in HandshakePending.
    pub handshake_timeout: Duration,

    /// Shutdown / teardown window for flushing outbound lanes.
    pub drain_timeout: Duration,

    /// Deadline for dispatches that do not carry their own.
    pub dispatch_default_deadline: Duration,

    /// Retry budget for tasks failing with a recoverable cause.
    pub task_max_retries: u32,

    /// Durable state store URL (`sqlite:...`). In-memory when unset.
    pub state_store_url: Option<String>,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let listen_address = env_addr("LISTEN_ADDRESS", "0.0.0.0:7700")?;
        let admin_address = env_addr("ADMIN_ADDRESS", "127.0.0.1:7780")?;

        let metrics_address = match std::env::var("METRICS_ADDRESS") {
            Ok(raw) => Some(parse_addr("METRICS_ADDRESS", &raw)?),
            Err(_) => None,
        };

        let admin_token = std::env::var("ADMIN_TOKEN")
            .map_err(|_| ConfigError::MissingKey("ADMIN_TOKEN".into()))?;
        if admin_token.trim().is_empty() {
            return Err(ConfigError::Invalid("ADMIN_TOKEN must not be empty".into()).into());
        }

        let heartbeat_interval = env_secs("HEARTBEAT_INTERVAL_SEC", 30)?;
        if heartbeat_interval.is_zero() {
            return Err(
                ConfigError::Invalid("HEARTBEAT_INTERVAL_SEC must be at least 1".into()).into(),
            );
        }

        let heartbeat_grace_factor = env_u32("HEARTBEAT_GRACE_FACTOR", 3)?;
        if heartbeat_grace_factor == 0 {
            return Err(
                ConfigError::Invalid("HEARTBEAT_GRACE_FACTOR must be at least 1".into()).into(),
            );
        }

        Ok(Self {
            listen_address,
            admin_address,
            metrics_address,
            admin_token,
            heartbeat_interval,
            heartbeat_grace_factor,
            handshake_timeout: env_secs("HANDSHAKE_TIMEOUT_SEC", 10)?,
            drain_timeout: env_secs("DRAIN_TIMEOUT_SEC", 30)?,
            dispatch_default_deadline: env_secs("DISPATCH_DEFAULT_DEADLINE_SEC", 30)?,
            task_max_retries: env_u32("TASK_MAX_RETRIES", 3)?,
            state_store_url: std::env::var("STATE_STORE_URL").ok(),
        })
    }

    /// The window after which a silent instance is considered gone.
    pub fn heartbeat_miss_window(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_grace_factor
    }
}

fn parse_addr(key: &str, raw: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|_| ConfigError::Invalid(format!("{key} is not a socket address: {raw}")).into())
}

fn env_addr(key: &str, default: &str) -> Result<SocketAddr> {
    match std::env::var(key) {
        Ok(raw) => parse_addr(key, &raw),
        Err(_) => parse_addr(key, default),
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid(format!("{key} is not a number: {raw}")).into()),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{key} is not a number: {raw}")).into()),
        Err(_) => Ok(default),
    }
}
