//! Per-channel RTP fan-out.
//!
//! One inbound track feeds a single local-static track; every downstream
//! connection shares that track as its source.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::MediaError;

/// How long a downstream attach waits for the publisher's first track.
const TRACK_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const TRACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Keyframe request cadence for the inbound stream.
const PLI_INTERVAL: Duration = Duration::from_secs(3);

pub struct Stream {
    id: String,
    track: Arc<RwLock<Option<Arc<TrackLocalStaticRTP>>>>,
    ssrc: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl Stream {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            track: Arc::new(RwLock::new(None)),
            ssrc: Arc::new(AtomicU32::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Wire the inbound connection into this stream: the first remote track
    /// creates the shared local track and starts the RTP copy loop. Also
    /// starts the periodic keyframe (PLI) requester.
    pub fn set_upstream(&self, pc: &Arc<RTCPeerConnection>) {
        let track_slot = Arc::clone(&self.track);
        let ssrc = Arc::clone(&self.ssrc);
        let cancel = self.cancel.clone();
        let stream_id = self.id.clone();

        pc.on_track(Box::new(move |remote_track, _receiver, _transceiver| {
            let track_slot = Arc::clone(&track_slot);
            let ssrc = Arc::clone(&ssrc);
            let cancel = cancel.clone();
            let stream_id = stream_id.clone();

            Box::pin(async move {
                let local = Arc::new(TrackLocalStaticRTP::new(
                    remote_track.codec().capability.clone(),
                    "video".to_string(),
                    stream_id.clone(),
                ));
                ssrc.store(remote_track.ssrc(), Ordering::Relaxed);
                *track_slot.write().await = Some(Arc::clone(&local));
                debug!(stream_id = %stream_id, "Upstream track attached");

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = remote_track.read_rtp() => match result {
                                Ok((packet, _)) => {
                                    if let Err(e) = local.write_rtp(&packet).await {
                                        warn!(stream_id = %stream_id, error = %e, "RTP write failed, stopping copy loop");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!(stream_id = %stream_id, error = %e, "RTP read ended");
                                    break;
                                }
                            }
                        }
                    }
                });
            })
        }));

        self.spawn_pli_task(pc);
    }

    /// Attach the shared track to an outbound connection and drain its RTCP.
    pub async fn add_downstream(&self, pc: &Arc<RTCPeerConnection>) -> Result<(), MediaError> {
        let track = self
            .wait_for_track()
            .await
            .ok_or_else(|| MediaError::TrackNotReady(self.id.clone()))?;

        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be read for the interceptors to run.
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = sender.read(&mut rtcp_buf) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// The shared track, waiting briefly for the publisher's first RTP if it
    /// has not arrived yet.
    pub async fn wait_for_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        let deadline = tokio::time::Instant::now() + TRACK_WAIT_TIMEOUT;
        loop {
            if let Some(track) = self.track.read().await.clone() {
                return Some(track);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(TRACK_POLL_INTERVAL).await;
        }
    }

    fn spawn_pli_task(&self, pc: &Arc<RTCPeerConnection>) {
        let pc = Arc::clone(pc);
        let ssrc = Arc::clone(&self.ssrc);
        let cancel = self.cancel.clone();
        let stream_id = self.id.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PLI_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let media_ssrc = ssrc.load(Ordering::Relaxed);
                        if media_ssrc == 0 {
                            continue;
                        }
                        let pli = PictureLossIndication {
                            sender_ssrc: 0,
                            media_ssrc,
                        };
                        if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                            debug!(stream_id = %stream_id, error = %e, "PLI send failed, stopping");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop the copy, RTCP, and PLI tasks.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_for_track_times_out_when_no_publisher() {
        let stream = Stream::new("c-pub");
        assert!(stream.wait_for_track().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let stream = Stream::new("c-pub");
        stream.close();
        stream.close();
    }
}
