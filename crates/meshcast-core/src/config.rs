//! Configuration for the meshcast server and its components.
//!
//! The CLI is the only configuration surface; `main` builds a [`Config`]
//! from parsed arguments and hands each component its own section.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default signaling port.
pub const DEFAULT_SIGNAL_PORT: u16 = 7070;

/// Default metrics port and path.
pub const DEFAULT_METRICS_PORT: u16 = 9090;
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Default STUN server injected into WebRTC peer connections.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Complete meshcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Validate the assembled configuration before the server starts.
    pub fn validate(&self) -> Result<()> {
        if self.signal.port == 0 {
            return Err(Error::Config("signal port must be nonzero".into()));
        }
        if self.metrics.port == 0 {
            return Err(Error::Config("metrics port must be nonzero".into()));
        }
        if !self.metrics.path.starts_with('/') {
            return Err(Error::Config(format!(
                "metrics path must start with '/', given {}",
                self.metrics.path
            )));
        }
        if self.media.udp_port_min > self.media.udp_port_max {
            return Err(Error::Config(format!(
                "invalid UDP port range: {} > {}",
                self.media.udp_port_min, self.media.udp_port_max
            )));
        }
        if self.coordinator.max_forwarding_number < 1 {
            return Err(Error::Config(
                "max forwarding number must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Signaling (WebSocket) server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Listening port for the WebSocket endpoint.
    pub port: u16,
    /// Create a channel on first authenticated ACTIVATE instead of
    /// requiring it to be pre-seeded.
    pub auto_create_channels: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SIGNAL_PORT,
            auto_create_channels: false,
        }
    }
}

/// In-memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Seed the debug/test channel at startup.
    pub set_default_channel: bool,
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum number of fetchers a single forwarder may serve.
    pub max_forwarding_number: i64,
    /// Enable re-parenting viewers onto peer forwarders.
    pub set_peer_connection: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_forwarding_number: 1,
            set_peer_connection: false,
        }
    }
}

/// Classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Interval between periodic classification sweeps, in seconds.
    pub interval_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Media façade (WebRTC) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// STUN server URL handed to every peer connection.
    pub stun_server: String,
    /// Ephemeral UDP port range for ICE; 0/0 leaves the OS default.
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Public IP advertised in ICE candidates (NAT 1:1), if any.
    pub public_ip: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            udp_port_min: 0,
            udp_port_max: 0,
            public_ip: None,
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_METRICS_PORT,
            path: DEFAULT_METRICS_PATH.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_signal_port_is_rejected() {
        let mut config = Config::default();
        config.signal.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_udp_range_is_rejected() {
        let mut config = Config::default();
        config.media.udp_port_min = 20000;
        config.media.udp_port_max = 10000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn metrics_path_must_be_absolute() {
        let mut config = Config::default();
        config.metrics.path = "metrics".into();
        assert!(config.validate().is_err());
    }
}
