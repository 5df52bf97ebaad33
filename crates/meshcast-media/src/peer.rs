//! Peer connection factories and non-trickle ICE.

use std::sync::Arc;

use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use meshcast_core::config::MediaConfig;

use crate::MediaError;

/// New peer connection that will receive a publisher's stream.
pub async fn new_inbound(config: &MediaConfig) -> Result<Arc<RTCPeerConnection>, MediaError> {
    new_peer_connection(config).await
}

/// New peer connection that will send the shared track to a viewer.
pub async fn new_outbound(config: &MediaConfig) -> Result<Arc<RTCPeerConnection>, MediaError> {
    new_peer_connection(config).await
}

async fn new_peer_connection(config: &MediaConfig) -> Result<Arc<RTCPeerConnection>, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let setting_engine = build_setting_engine(config)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![config.stun_server.clone()],
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = api.new_peer_connection(rtc_config).await?;
    Ok(Arc::new(pc))
}

fn build_setting_engine(config: &MediaConfig) -> Result<SettingEngine, MediaError> {
    let mut setting_engine = SettingEngine::default();

    if config.udp_port_min > 0 && config.udp_port_max > 0 {
        let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
            .map_err(|e| MediaError::Webrtc(webrtc::Error::new(format!(
                "invalid UDP port range: {e}"
            ))))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        info!(
            min = config.udp_port_min,
            max = config.udp_port_max,
            "WebRTC UDP port range configured"
        );
    }

    // Rewrite host candidates with the advertised address so clients behind
    // the NAT boundary can reach us.
    if let Some(public_ip) = &config.public_ip {
        setting_engine.set_nat_1to1_ips(vec![public_ip.clone()], RTCIceCandidateType::Host);
    }

    Ok(setting_engine)
}

/// Run non-trickle ICE: apply the client's offer, produce an answer, and
/// block until candidate gathering completes so the answer is self-contained.
pub async fn start_ice(
    pc: &Arc<RTCPeerConnection>,
    offer_sdp: &str,
) -> Result<String, MediaError> {
    let offer = RTCSessionDescription::offer(offer_sdp.to_string())?;
    pc.set_remote_description(offer).await?;

    let answer = pc.create_answer(None).await?;

    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or(MediaError::NoLocalDescription)?;
    Ok(local.sdp)
}
