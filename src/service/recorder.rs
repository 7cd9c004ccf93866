use std::sync::Arc;

use tracing::{debug, error};
use webrtc::api::API;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::error::AppError;
use crate::model::{self, FileDescriptor};
use crate::result::Result;
use crate::rtc::{CloseHook, RecordingSession, UploadVideoSession};
use crate::scratch::ScratchStore;
use crate::service::Transcoding;
use crate::store::SessionRegistry;

/// Orchestrates recording sessions: creates them on demand, tracks them in
/// the registry and turns every finished recording into a transcoding job.
pub struct WebRtcRecorder {
    api: API,
    registry: Arc<SessionRegistry>,
    scratch: ScratchStore,
    transcoding: Arc<Transcoding>,
}

impl WebRtcRecorder {
    pub fn new(
        api: API,
        registry: Arc<SessionRegistry>,
        scratch: ScratchStore,
        transcoding: Arc<Transcoding>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            registry,
            scratch,
            transcoding,
        })
    }

    /// Builds a receive-only peer connection for the offer and registers a
    /// new session. Returns the session id and the SDP answer.
    pub async fn upload_p2p_video(
        self: &Arc<Self>,
        sdp_offer: String,
        mut file: FileDescriptor,
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<(String, String)> {
        if file.name.is_empty() {
            file.name = model::new_id();
        }

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: Vec::new(),
            }),
        )
        .await?;

        let session = UploadVideoSession::new(pc, file, self.scratch.clone(), self.close_hook());
        if let Err(err) = session.negotiate_offer(sdp_offer).await {
            session.close().await;
            return Err(AppError::invalid_argument(format!(
                "negotiation failed: {}",
                err
            )));
        }

        let id = session.id();
        let answer = session.answer_sdp().await;
        self.registry.add(id.clone(), session);
        Ok((id, answer))
    }

    /// Re-runs the offer/answer cycle for an existing session.
    pub async fn renegotiate_p2p(&self, id: &str, sdp_offer: String) -> Result<String> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| AppError::resource_not_found(format!("p2p session {} not found", id)))?;
        if let Err(err) = session.negotiate(sdp_offer).await {
            session.close().await;
            return Err(AppError::invalid_argument(format!(
                "renegotiation failed: {}",
                err
            )));
        }
        Ok(session.answer_sdp().await)
    }

    pub async fn close_p2p(&self, id: &str) -> Result<()> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| AppError::resource_not_found(format!("p2p session {} not found", id)))?;
        session.close().await;
        Ok(())
    }

    fn close_hook(self: &Arc<Self>) -> CloseHook {
        let recorder = Arc::downgrade(self);
        Arc::new(move |id: String, file: FileDescriptor| {
            let recorder = recorder.clone();
            Box::pin(async move {
                if let Some(recorder) = recorder.upgrade() {
                    recorder.stop_video_session(id, file).await;
                }
            })
        })
    }

    /// Runs once per session: the registry removal is the token that makes
    /// the enqueue side effects exactly-once even with concurrent closers.
    async fn stop_video_session(&self, id: String, mut file: FileDescriptor) {
        if !self.registry.remove(&id) {
            debug!(session = %id, "session already stopped");
            return;
        }

        if file.start_time > 0 {
            file.end_time = model::now_millis();
        }
        if file.path.is_empty() {
            debug!(session = %id, "session produced no media, nothing to transcode");
            return;
        }

        if let Err(err) = self.transcoding.create_job(&file).await {
            error!(session = %id, "failed to enqueue transcoding job: {}", err);
            // Without a job nothing will ever collect the capture.
            if let Err(err) = self.scratch.delete(&file) {
                error!(session = %id, "failed to delete scratch file: {}", err);
            }
        }
    }
}
