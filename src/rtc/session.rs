use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::media::io::Writer;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::model::{self, FileDescriptor};
use crate::rtc::encoder::new_encoder;
use crate::rtc::reorder::ReorderBuffer;
use crate::rtc::RecordingSession;
use crate::scratch::ScratchStore;

const REORDER_DEPTH: usize = 45;

/// Invoked once per session after everything is torn down, with a snapshot
/// of the file descriptor.
pub type CloseHook =
    Arc<dyn Fn(String, FileDescriptor) -> BoxFuture<'static, ()> + Send + Sync>;

struct TrackSink {
    mime_type: String,
    encoder: Option<Box<dyn Writer + Send>>,
    packets: u64,
}

/// One recorded P2P call: owns the peer connection, demuxes inbound tracks
/// into scratch files and reports its own end of life through the close
/// hook.
pub struct UploadVideoSession {
    id: String,
    pc: Arc<RTCPeerConnection>,
    answer: tokio::sync::RwLock<Option<RTCSessionDescription>>,
    // Offer/answer cycles never overlap for one session.
    negotiate_lock: tokio::sync::Mutex<()>,
    file: Mutex<FileDescriptor>,
    tracks: Mutex<Vec<TrackSink>>,
    active_tracks: AtomicI32,
    cancel: CancellationToken,
    scratch: ScratchStore,
    on_closed: CloseHook,
}

impl UploadVideoSession {
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        file: FileDescriptor,
        scratch: ScratchStore,
        on_closed: CloseHook,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id: model::new_id(),
            pc: pc.clone(),
            answer: tokio::sync::RwLock::new(None),
            negotiate_lock: tokio::sync::Mutex::new(()),
            file: Mutex::new(file),
            tracks: Mutex::new(Vec::with_capacity(2)),
            active_tracks: AtomicI32::new(0),
            cancel: CancellationToken::new(),
            scratch,
            on_closed,
        });

        let weak = Arc::downgrade(&session);
        pc.on_track(Box::new(move |track, _, _| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    tokio::spawn(session.handle_track(track));
                }
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(&session);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                debug!(session = %session.id, "ice connection state changed to {}", state);
                if state == RTCIceConnectionState::Failed {
                    // Read loops are past saving; tear down regardless.
                    session.active_tracks.store(0, Ordering::SeqCst);
                    session.close_session().await;
                }
            })
        }));

        session
    }

    pub(crate) async fn negotiate_offer(&self, sdp_offer: String) -> anyhow::Result<()> {
        let _guard = self.negotiate_lock.lock().await;
        let offer = RTCSessionDescription::offer(sdp_offer)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;
        let _ = gather_complete.recv().await;
        let description = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description after candidate gathering"))?;
        *self.answer.write().await = Some(description);
        Ok(())
    }

    async fn handle_track(self: Arc<Self>, track: Arc<TrackRemote>) {
        let codec = track.codec();
        let mime_type = codec.capability.mime_type.clone();
        debug!(
            session = %self.id,
            "got {} track {}, codec {}",
            track.kind(),
            track.id(),
            mime_type
        );

        let writer = {
            let mut file = self.file.lock().unwrap();
            if file.start_time == 0 {
                file.start_time = model::now_millis();
            }
            let result = if file.path.is_empty() {
                file.mime_type = mime_type.clone();
                let writer = self.scratch.new_writer(&mut file, "raw");
                if writer.is_ok() {
                    let path = file.path.clone();
                    file.tracks.push(path);
                }
                writer
            } else {
                // Additional tracks get their own scratch file, tagged by
                // the track id.
                let mut track_file = file.clone();
                track_file.path = String::new();
                track_file.name = format!("{}-{}", file.name, track.id());
                track_file.mime_type = mime_type.clone();
                let writer = self.scratch.new_writer(&mut track_file, "raw");
                if writer.is_ok() {
                    file.tracks.push(track_file.path);
                }
                writer
            };
            match result {
                Ok(writer) => writer,
                Err(err) => {
                    error!(session = %self.id, "failed to open scratch writer: {}", err);
                    return;
                }
            }
        };

        let encoder = match new_encoder(&mime_type, writer) {
            Ok(Some(encoder)) => encoder,
            Ok(None) => {
                debug!(session = %self.id, "unsupported codec {}, ignoring track", mime_type);
                return;
            }
            Err(err) => {
                error!(session = %self.id, "failed to open container writer: {}", err);
                return;
            }
        };

        let index = {
            let mut tracks = self.tracks.lock().unwrap();
            tracks.push(TrackSink {
                mime_type,
                encoder: Some(encoder),
                packets: 0,
            });
            tracks.len() - 1
        };

        self.active_tracks.fetch_add(1, Ordering::SeqCst);
        self.read_loop(&track, index).await;
        self.active_tracks.fetch_sub(1, Ordering::SeqCst);
        debug!(session = %self.id, "track {} read loop finished", track.id());
        self.close_session().await;
    }

    async fn read_loop(&self, track: &Arc<TrackRemote>, index: usize) {
        let mut reorder = ReorderBuffer::new(REORDER_DEPTH);
        let mut last_seq: u16 = 0;
        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(session = %self.id, "session canceled, stopping rtp read loop");
                    return;
                }
                result = track.read(&mut buf) => {
                    let packet = match result {
                        Ok((packet, _)) => packet,
                        Err(err) => {
                            debug!(session = %self.id, "rtp read ended: {}", err);
                            return;
                        }
                    };
                    {
                        let mut tracks = self.tracks.lock().unwrap();
                        let sink = &mut tracks[index];
                        sink.packets += 1;
                        if sink.packets % 1000 == 0 {
                            debug!(
                                session = %self.id,
                                "track {} received {} packets",
                                track.id(),
                                sink.packets
                            );
                        }
                    }
                    for released in reorder.push(packet) {
                        let seq = released.header.sequence_number;
                        if last_seq != 0 && seq != last_seq.wrapping_add(1) {
                            warn!(
                                session = %self.id,
                                "lost packets: seq={}, last={}, count={}",
                                seq,
                                last_seq,
                                seq.wrapping_sub(last_seq.wrapping_add(1))
                            );
                        }
                        last_seq = seq;
                        let write = {
                            let mut tracks = self.tracks.lock().unwrap();
                            tracks[index]
                                .encoder
                                .as_mut()
                                .map(|encoder| encoder.write_rtp(&released))
                        };
                        if let Some(Err(err)) = write {
                            error!(session = %self.id, "failed to write rtp packet: {}", err);
                            self.cancel.cancel();
                        }
                    }
                }
            }
        }
    }

    /// Safe to call from the ICE callback, the HTTP handlers and every read
    /// loop exit. Does nothing while a track is still running; side effects
    /// beyond that are deduplicated by the registry removal in the hook.
    async fn close_session(&self) {
        debug!(session = %self.id, "close");
        if self.active_tracks.load(Ordering::SeqCst) != 0 {
            debug!(session = %self.id, "waiting for track loops to finish");
            return;
        }

        self.cancel.cancel();

        {
            let mut tracks = self.tracks.lock().unwrap();
            for sink in tracks.iter_mut() {
                if let Some(mut encoder) = sink.encoder.take() {
                    if let Err(err) = encoder.close() {
                        error!(
                            session = %self.id,
                            "closing {} encoder: {}",
                            sink.mime_type,
                            err
                        );
                    }
                }
            }
        }

        if let Err(err) = self.pc.close().await {
            error!(session = %self.id, "closing peer connection: {}", err);
        }

        let file = self.file.lock().unwrap().clone();
        (self.on_closed)(self.id.clone(), file).await;
    }
}

#[async_trait]
impl RecordingSession for UploadVideoSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn answer_sdp(&self) -> String {
        self.answer
            .read()
            .await
            .as_ref()
            .map(|description| description.sdp.clone())
            .unwrap_or_default()
    }

    async fn negotiate(&self, sdp_offer: String) -> anyhow::Result<()> {
        self.negotiate_offer(sdp_offer).await
    }

    async fn close(&self) {
        // A caller-initiated stop also winds down loops still blocked on
        // the peer; the last loop to exit finishes the teardown.
        self.cancel.cancel();
        self.close_session().await;
    }
}
