//! Meshcast media façade.
//!
//! Owns the WebRTC peer connections between clients and the media server and
//! the per-stream RTP fan-out. Driven entirely through the broker: it reacts
//! to `Media/{UPSTREAM,DOWNSTREAM,CLEAR,CLOSE}` and publishes
//! `Media/CONNECTED` as connections come up. SDP answers travel back to the
//! requesting client through its `ClientSocket` detail.

pub mod peer;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::IntGauge;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use meshcast_core::broker::{Broker, Detail, Topic};
use meshcast_core::config::MediaConfig;
use meshcast_core::message::{Connected, Message};
use meshcast_core::wire::ServerFrame;

use stream::Stream;

/// Media façade errors.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("no stream registered for id: {0}")]
    StreamNotFound(String),

    #[error("upstream track not ready for stream: {0}")]
    TrackNotReady(String),

    #[error("local description unavailable after ICE gathering")]
    NoLocalDescription,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Arc<RTCPeerConnection>>,
    streams: HashMap<String, Arc<Stream>>,
}

/// The media façade. Share behind an `Arc` and call [`Media::run`] once.
pub struct Media {
    config: MediaConfig,
    broker: Arc<Broker>,
    webrtc_connections: IntGauge,
    registry: RwLock<Registry>,
}

impl Media {
    pub fn new(config: MediaConfig, broker: Arc<Broker>, webrtc_connections: IntGauge) -> Self {
        Self {
            config,
            broker,
            webrtc_connections,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Consume media commands until the broker closes the subscriptions.
    pub async fn run(self: Arc<Self>) {
        let mut upstream = self.broker.subscribe(Topic::Media, Detail::Upstream).await;
        let mut downstream = self.broker.subscribe(Topic::Media, Detail::Downstream).await;
        let mut clear = self.broker.subscribe(Topic::Media, Detail::Clear).await;
        let mut close = self.broker.subscribe(Topic::Media, Detail::Close).await;

        loop {
            tokio::select! {
                Some(msg) = upstream.recv() => {
                    let media = Arc::clone(&self);
                    tokio::spawn(async move { media.handle_upstream(msg).await });
                }
                Some(msg) = downstream.recv() => {
                    let media = Arc::clone(&self);
                    tokio::spawn(async move { media.handle_downstream(msg).await });
                }
                Some(msg) = clear.recv() => {
                    let media = Arc::clone(&self);
                    tokio::spawn(async move { media.handle_clear(msg).await });
                }
                Some(msg) = close.recv() => {
                    let media = Arc::clone(&self);
                    tokio::spawn(async move { media.handle_close(msg).await });
                }
                else => break,
            }
        }
    }

    async fn handle_upstream(&self, msg: Message) {
        let Message::Upstream(msg) = msg else {
            warn!("Unexpected message on Media/UPSTREAM");
            return;
        };
        match self.add_upstream(&msg.connection_id, &msg.sdp).await {
            Ok(answer) => self.send_answer(&msg.connection_id, &msg.key, answer).await,
            Err(e) => error!(
                connection_id = %msg.connection_id,
                error = %e,
                "Failed to add upstream"
            ),
        }
    }

    async fn handle_downstream(&self, msg: Message) {
        let Message::Downstream(msg) = msg else {
            warn!("Unexpected message on Media/DOWNSTREAM");
            return;
        };
        match self
            .add_downstream(&msg.connection_id, &msg.stream_id, &msg.sdp)
            .await
        {
            Ok(answer) => self.send_answer(&msg.connection_id, &msg.key, answer).await,
            Err(e) => error!(
                connection_id = %msg.connection_id,
                stream_id = %msg.stream_id,
                error = %e,
                "Failed to add downstream"
            ),
        }
    }

    async fn handle_clear(&self, msg: Message) {
        let Message::Clear(msg) = msg else {
            warn!("Unexpected message on Media/CLEAR");
            return;
        };
        self.clear_connection(&msg.connection_id).await;
    }

    async fn handle_close(&self, msg: Message) {
        let Message::Close(msg) = msg else {
            warn!("Unexpected message on Media/CLOSE");
            return;
        };
        self.clear_connection(&msg.connection_id).await;
        if let Some(stream) = self.registry.write().await.streams.remove(&msg.connection_id) {
            stream.close();
            info!(connection_id = %msg.connection_id, "Stream removed");
        }
    }

    /// Accept a publisher's offer: inbound peer connection wired to a new
    /// stream, non-trickle ICE, answer SDP returned.
    pub async fn add_upstream(
        &self,
        connection_id: &str,
        sdp: &str,
    ) -> Result<String, MediaError> {
        let pc = peer::new_inbound(&self.config).await?;

        let stream = Arc::new(Stream::new(connection_id));
        stream.set_upstream(&pc);
        self.attach_state_handler(&pc, connection_id);

        let answer = peer::start_ice(&pc, sdp).await?;

        let mut registry = self.registry.write().await;
        registry.connections.insert(connection_id.to_string(), pc);
        registry.streams.insert(connection_id.to_string(), stream);
        info!(connection_id = %connection_id, "Upstream connection added");

        Ok(answer)
    }

    /// Accept a viewer's offer: outbound peer connection fed by the named
    /// upstream's shared track.
    pub async fn add_downstream(
        &self,
        connection_id: &str,
        stream_id: &str,
        sdp: &str,
    ) -> Result<String, MediaError> {
        let stream = self
            .registry
            .read()
            .await
            .streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| MediaError::StreamNotFound(stream_id.to_string()))?;

        let pc = peer::new_outbound(&self.config).await?;
        stream.add_downstream(&pc).await?;
        self.attach_state_handler(&pc, connection_id);

        let answer = peer::start_ice(&pc, sdp).await?;

        self.registry
            .write()
            .await
            .connections
            .insert(connection_id.to_string(), pc);
        info!(connection_id = %connection_id, stream_id = %stream_id, "Downstream connection added");

        Ok(answer)
    }

    async fn clear_connection(&self, connection_id: &str) {
        let pc = self.registry.write().await.connections.remove(connection_id);
        match pc {
            Some(pc) => {
                if let Err(e) = pc.close().await {
                    warn!(connection_id = %connection_id, error = %e, "Error closing connection");
                }
                info!(connection_id = %connection_id, "Connection cleared");
            }
            None => {
                // Already gone; expected under concurrent teardown.
                warn!(connection_id = %connection_id, "Clear for unknown connection");
            }
        }
    }

    async fn send_answer(&self, connection_id: &str, key: &str, answer: String) {
        let frame = ServerFrame::Signal {
            connection_id: connection_id.to_string(),
            signal_type: "answer".to_string(),
            signal_data: answer,
        };
        if let Err(e) = self
            .broker
            .publish(
                Topic::ClientSocket,
                Detail::Socket(key.to_string()),
                Message::Frame(frame),
            )
            .await
        {
            error!(connection_id = %connection_id, error = %e, "Failed to deliver SDP answer");
        }
    }

    fn attach_state_handler(&self, pc: &Arc<RTCPeerConnection>, connection_id: &str) {
        let broker = Arc::clone(&self.broker);
        let gauge = self.webrtc_connections.clone();
        let connection_id = connection_id.to_string();

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let broker = Arc::clone(&broker);
            let gauge = gauge.clone();
            let connection_id = connection_id.clone();

            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        gauge.inc();
                        let msg = Message::Connected(Connected {
                            connection_id: connection_id.clone(),
                        });
                        if let Err(e) = broker.publish(Topic::Media, Detail::Connected, msg).await {
                            warn!(
                                connection_id = %connection_id,
                                error = %e,
                                "Failed to publish Media/CONNECTED"
                            );
                        }
                    }
                    RTCPeerConnectionState::Closed => {
                        gauge.dec();
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        warn!(connection_id = %connection_id, state = %state, "Connection degraded");
                    }
                    _ => {}
                }
            })
        }));
    }
}
