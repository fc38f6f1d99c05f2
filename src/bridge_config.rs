use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional JSON configuration file
pub const CONFIG_PATH_ENV: &str = "UNITY_BRIDGE_CONFIG";

/// Which wire transport the bridge uses to reach the Unity Editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed JSON frames over a persistent TCP socket
    Socket,
    /// JSON over HTTP, `GET /` for liveness and `POST /` for commands
    Http,
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "socket" | "tcp" => Ok(TransportKind::Socket),
            "http" => Ok(TransportKind::Http),
            other => Err(ConfigError::InvalidValue {
                key: "unity_transport".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("Invalid port range: {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },
    #[error("max_failed_ports must be at least 1")]
    ZeroFailedPorts,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Settings consumed by the connection layer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub unity_host: String,
    pub unity_port_start: u16,
    pub unity_port_end: u16,
    pub unity_transport: TransportKind,
    /// Timeout for establishing a transport connection
    #[serde(with = "seconds")]
    pub connection_timeout: Duration,
    /// Timeout for one command send/receive exchange
    #[serde(with = "seconds")]
    pub send_timeout: Duration,
    /// Timeout for a liveness ping
    #[serde(with = "seconds")]
    pub ping_timeout: Duration,
    /// Timeout for the TCP connect of a discovery probe
    #[serde(with = "seconds")]
    pub port_scan_timeout: Duration,
    /// Pause after a failed discovery before the next attempt
    #[serde(with = "seconds")]
    pub connection_retry_delay: Duration,
    /// How long a failed port is excluded from discovery
    #[serde(with = "seconds")]
    pub port_failure_timeout: Duration,
    pub max_failed_ports: usize,
    /// Probe every candidate port before committing to one
    pub smart_port_discovery: bool,
    /// Retries after the first attempt for a `single_call` tool call
    pub max_retries: u32,
    /// Pause before retrying a command that failed at the application level
    #[serde(with = "seconds")]
    pub retry_delay: Duration,
    /// Commands larger than this are logged as a warning
    pub buffer_warning_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            unity_host: "127.0.0.1".to_string(),
            unity_port_start: 8100,
            unity_port_end: 8105,
            unity_transport: TransportKind::Socket,
            connection_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(3),
            port_scan_timeout: Duration::from_secs(1),
            connection_retry_delay: Duration::from_secs(1),
            port_failure_timeout: Duration::from_secs(60),
            max_failed_ports: 10,
            smart_port_discovery: true,
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            buffer_warning_size: 8 * 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Loads the configuration: defaults, then the JSON file named by `UNITY_BRIDGE_CONFIG`
    /// (if set), then `UNITY_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_json_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file. Missing keys keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies overrides from a variable lookup. Each key maps to the upper-case
    /// variable name, e.g. `unity_port_start` is read from `UNITY_PORT_START`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("UNITY_HOST") {
            self.unity_host = host.trim().to_string();
        }
        override_parsed(&lookup, "UNITY_PORT_START", &mut self.unity_port_start)?;
        override_parsed(&lookup, "UNITY_PORT_END", &mut self.unity_port_end)?;
        override_parsed(&lookup, "UNITY_TRANSPORT", &mut self.unity_transport)?;
        override_seconds(&lookup, "UNITY_CONNECTION_TIMEOUT", &mut self.connection_timeout)?;
        override_seconds(&lookup, "UNITY_SEND_TIMEOUT", &mut self.send_timeout)?;
        override_seconds(&lookup, "UNITY_PING_TIMEOUT", &mut self.ping_timeout)?;
        override_seconds(&lookup, "UNITY_PORT_SCAN_TIMEOUT", &mut self.port_scan_timeout)?;
        override_seconds(
            &lookup,
            "UNITY_CONNECTION_RETRY_DELAY",
            &mut self.connection_retry_delay,
        )?;
        override_seconds(
            &lookup,
            "UNITY_PORT_FAILURE_TIMEOUT",
            &mut self.port_failure_timeout,
        )?;
        override_parsed(&lookup, "UNITY_MAX_FAILED_PORTS", &mut self.max_failed_ports)?;
        override_bool(&lookup, "UNITY_SMART_PORT_DISCOVERY", &mut self.smart_port_discovery)?;
        override_parsed(&lookup, "UNITY_MAX_RETRIES", &mut self.max_retries)?;
        override_seconds(&lookup, "UNITY_RETRY_DELAY", &mut self.retry_delay)?;
        override_parsed(&lookup, "UNITY_BUFFER_WARNING_SIZE", &mut self.buffer_warning_size)?;
        Ok(())
    }

    /// Checks invariants the connection layer relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unity_port_start > self.unity_port_end || self.unity_port_start == 0 {
            return Err(ConfigError::InvalidPortRange {
                start: self.unity_port_start,
                end: self.unity_port_end,
            });
        }
        if self.max_failed_ports == 0 {
            return Err(ConfigError::ZeroFailedPorts);
        }
        if self.unity_host.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "unity_host".to_string(),
                value: String::new(),
            });
        }
        Ok(())
    }

    /// Inclusive port range scanned during discovery
    pub fn port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.unity_port_start..=self.unity_port_end
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_lowercase(),
        value: value.to_string(),
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| invalid(key, &raw))?;
    }
    Ok(())
}

fn override_seconds<F>(lookup: &F, key: &str, target: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        let secs: f64 = raw.trim().parse().map_err(|_| invalid(key, &raw))?;
        *target = Duration::try_from_secs_f64(secs).map_err(|_| invalid(key, &raw))?;
    }
    Ok(())
}

fn override_bool<F>(lookup: &F, key: &str, target: &mut bool) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => return Err(invalid(key, &raw)),
        };
    }
    Ok(())
}

/// Durations are written as fractional seconds in configuration files
mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
