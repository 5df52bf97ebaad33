//! Prometheus metrics for the signaling server.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Registered server metrics. Cheap to share behind an `Arc`.
pub struct Metrics {
    registry: Registry,
    websocket_connections: IntGauge,
    webrtc_connections: IntGauge,
    peer_connections: IntGauge,
    connection_attempts: IntCounter,
    connection_successes: IntCounter,
    connection_failures: IntCounter,
    balancing_occurs: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let websocket_connections = IntGauge::new(
            "websocket_connections_total",
            "Current number of WebSocket connections.",
        )?;
        let webrtc_connections = IntGauge::new(
            "webrtc_connections_total",
            "Current number of WebRTC connections.",
        )?;
        let peer_connections = IntGauge::new(
            "peer_connections_total",
            "Current number of client-to-client peer connections.",
        )?;
        let connection_attempts = IntCounter::new(
            "client_connection_attempts_total",
            "Client socket connection attempts.",
        )?;
        let connection_successes = IntCounter::new(
            "client_connection_successes_total",
            "Client sockets that passed activation.",
        )?;
        let connection_failures = IntCounter::new(
            "client_connection_failures_total",
            "Client sockets that failed before activation.",
        )?;
        let balancing_occurs = IntCounter::new(
            "balancing_occurs_total",
            "Fetchers re-parented onto a peer forwarder.",
        )?;

        registry.register(Box::new(websocket_connections.clone()))?;
        registry.register(Box::new(webrtc_connections.clone()))?;
        registry.register(Box::new(peer_connections.clone()))?;
        registry.register(Box::new(connection_attempts.clone()))?;
        registry.register(Box::new(connection_successes.clone()))?;
        registry.register(Box::new(connection_failures.clone()))?;
        registry.register(Box::new(balancing_occurs.clone()))?;

        Ok(Self {
            registry,
            websocket_connections,
            webrtc_connections,
            peer_connections,
            connection_attempts,
            connection_successes,
            connection_failures,
            balancing_occurs,
        })
    }

    pub fn inc_websocket_connections(&self) {
        self.websocket_connections.inc();
    }

    pub fn dec_websocket_connections(&self) {
        self.websocket_connections.dec();
    }

    /// Handle for the media façade, which tracks its own gauge movements.
    pub fn webrtc_connections_gauge(&self) -> IntGauge {
        self.webrtc_connections.clone()
    }

    pub fn inc_peer_connections(&self) {
        self.peer_connections.inc();
    }

    pub fn dec_peer_connections(&self) {
        self.peer_connections.dec();
    }

    pub fn inc_connection_attempts(&self) {
        self.connection_attempts.inc();
    }

    pub fn inc_connection_successes(&self) {
        self.connection_successes.inc();
    }

    pub fn inc_connection_failures(&self) {
        self.connection_failures.inc();
    }

    pub fn inc_balancing_occurs(&self) {
        self.balancing_occurs.inc();
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_move_both_ways() {
        let metrics = Metrics::new().unwrap();

        metrics.inc_websocket_connections();
        metrics.inc_websocket_connections();
        metrics.dec_websocket_connections();
        metrics.inc_peer_connections();
        metrics.inc_connection_attempts();
        metrics.inc_balancing_occurs();

        let rendered = metrics.render();
        assert!(rendered.contains("websocket_connections_total 1"));
        assert!(rendered.contains("peer_connections_total 1"));
        assert!(rendered.contains("client_connection_attempts_total 1"));
        assert!(rendered.contains("balancing_occurs_total 1"));
    }

    #[test]
    fn media_gauge_shares_the_registry() {
        let metrics = Metrics::new().unwrap();
        let gauge = metrics.webrtc_connections_gauge();
        gauge.inc();

        assert!(metrics.render().contains("webrtc_connections_total 1"));
    }
}
