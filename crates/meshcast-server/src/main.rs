//! Meshcast signaling server entrypoint.

use clap::Parser;
use tracing::info;

use meshcast_core::config::{
    self, ClassifierConfig, Config, CoordinatorConfig, DatabaseConfig, MediaConfig, MetricsConfig,
    SignalConfig,
};
use meshcast_core::tracing_init::init_tracing;
use meshcast_server::server::Server;

#[derive(Parser, Debug)]
#[command(name = "meshcast-server")]
#[command(
    version,
    about = "Peer-assisted delivery network - live stream signaling and coordination"
)]
struct Args {
    /// WebSocket listening port.
    #[arg(long, default_value_t = config::DEFAULT_SIGNAL_PORT, env = "MESHCAST_PORT")]
    port: u16,

    /// Create a channel on first authenticated ACTIVATE instead of
    /// requiring pre-registration.
    #[arg(long, env = "MESHCAST_AUTO_CREATE_CHANNELS")]
    auto_create_channels: bool,

    /// Seed the debug/test channel at startup.
    #[arg(long, env = "MESHCAST_SET_DEFAULT_CHANNEL")]
    set_default_channel: bool,

    /// Enable peer-assisted delivery (re-parent viewers onto forwarders).
    #[arg(long, env = "MESHCAST_SET_PEER_CONNECTION")]
    set_peer_connection: bool,

    /// Maximum fetchers a single forwarder may serve.
    #[arg(long, default_value_t = 1, env = "MESHCAST_MAX_FORWARDING_NUMBER")]
    max_forwarding_number: i64,

    /// Seconds between periodic classification sweeps.
    #[arg(long, default_value_t = 60, env = "MESHCAST_CLASSIFY_INTERVAL_SECS")]
    classify_interval_secs: u64,

    /// STUN server handed to WebRTC peer connections.
    #[arg(long, default_value = config::DEFAULT_STUN_SERVER, env = "MESHCAST_STUN_SERVER")]
    stun_server: String,

    /// Minimum ephemeral UDP port for ICE (0 leaves the OS default).
    #[arg(long, default_value_t = 0, env = "MESHCAST_UDP_PORT_MIN")]
    udp_port_min: u16,

    /// Maximum ephemeral UDP port for ICE (0 leaves the OS default).
    #[arg(long, default_value_t = 0, env = "MESHCAST_UDP_PORT_MAX")]
    udp_port_max: u16,

    /// Public IP advertised in ICE candidates (NAT 1:1).
    #[arg(long, env = "MESHCAST_PUBLIC_IP")]
    public_ip: Option<String>,

    /// Metrics listening port.
    #[arg(long, default_value_t = config::DEFAULT_METRICS_PORT, env = "MESHCAST_METRICS_PORT")]
    metrics_port: u16,

    /// Metrics endpoint path.
    #[arg(long, default_value = config::DEFAULT_METRICS_PATH, env = "MESHCAST_METRICS_PATH")]
    metrics_path: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "MESHCAST_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            signal: SignalConfig {
                port: self.port,
                auto_create_channels: self.auto_create_channels,
            },
            database: DatabaseConfig {
                set_default_channel: self.set_default_channel,
            },
            coordinator: CoordinatorConfig {
                max_forwarding_number: self.max_forwarding_number,
                set_peer_connection: self.set_peer_connection,
            },
            classifier: ClassifierConfig {
                interval_secs: self.classify_interval_secs,
            },
            media: MediaConfig {
                stun_server: self.stun_server,
                udp_port_min: self.udp_port_min,
                udp_port_max: self.udp_port_max,
                public_ip: self.public_ip,
            },
            metrics: MetricsConfig {
                port: self.metrics_port,
                path: self.metrics_path,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("meshcast=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "Starting meshcast-server"
    );

    let config = args.into_config();
    config.validate()?;

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
