//! Media backend on top of the `webrtc` crate.
//!
//! Local media is a set of static-sample tracks (Opus audio, VP8 video) that the
//! host application feeds with encoded samples; callbox never touches the media
//! itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use callbox_proto::{DescriptionKind, IceCandidate, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::DEFAULT_STUN_SERVER;

use super::{
    MediaConstraints, MediaError, MediaEvent, MediaEvents, MediaPlatform, MediaSession,
    MediaStream, TrackKind,
};

fn session_error(err: impl fmt::Display) -> MediaError {
    MediaError::Session(err.to_string())
}

#[derive(Clone)]
enum StreamTracks {
    Local(Vec<(TrackKind, Arc<TrackLocalStaticSample>)>),
    Remote(Vec<(TrackKind, Arc<TrackRemote>)>),
}

/// Either the locally captured tracks or one track received from the peer.
#[derive(Clone)]
pub struct WebRtcStream {
    id: String,
    tracks: StreamTracks,
    stopped: Arc<AtomicBool>,
}

impl fmt::Debug for WebRtcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl WebRtcStream {
    /// Sample writers for local tracks; empty for remote streams.
    pub fn local_tracks(&self) -> Vec<(TrackKind, Arc<TrackLocalStaticSample>)> {
        match &self.tracks {
            StreamTracks::Local(tracks) => tracks.clone(),
            StreamTracks::Remote(_) => Vec::new(),
        }
    }

    pub fn remote_tracks(&self) -> Vec<(TrackKind, Arc<TrackRemote>)> {
        match &self.tracks {
            StreamTracks::Local(_) => Vec::new(),
            StreamTracks::Remote(tracks) => tracks.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaStream for WebRtcStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<TrackKind> {
        match &self.tracks {
            StreamTracks::Local(tracks) => tracks.iter().map(|(kind, _)| *kind).collect(),
            StreamTracks::Remote(tracks) => tracks.iter().map(|(kind, _)| *kind).collect(),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct WebRtcPlatform {
    api: Arc<API>,
    ice_servers: Vec<String>,
    next_stream: AtomicU64,
}

impl WebRtcPlatform {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(session_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(session_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            next_stream: AtomicU64::new(0),
        })
    }

    pub fn with_default_stun() -> Result<Self, MediaError> {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

#[async_trait]
impl MediaPlatform for WebRtcPlatform {
    type Stream = WebRtcStream;
    type Session = WebRtcSession;

    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<WebRtcStream, MediaError> {
        let requested = constraints.requested_tracks();
        if requested.is_empty() {
            return Err(MediaError::Unavailable("no tracks requested".into()));
        }
        let stream_id = format!(
            "callbox-{}",
            self.next_stream.fetch_add(1, Ordering::Relaxed) + 1
        );
        let tracks = requested
            .into_iter()
            .map(|kind| {
                let codec = match kind {
                    TrackKind::Audio => RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48_000,
                        channels: 2,
                        ..Default::default()
                    },
                    TrackKind::Video => RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90_000,
                        ..Default::default()
                    },
                };
                let track = Arc::new(TrackLocalStaticSample::new(
                    codec,
                    format!("{stream_id}-{kind}"),
                    stream_id.clone(),
                ));
                (kind, track)
            })
            .collect();
        Ok(WebRtcStream {
            id: stream_id,
            tracks: StreamTracks::Local(tracks),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn create_session(
        &self,
    ) -> Result<(WebRtcSession, MediaEvents<WebRtcStream>), MediaError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(session_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(MediaEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        warn!(target = "callbox::media", error = %err, "failed to serialize local candidate")
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        peer.on_track(Box::new(move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                debug!(target = "callbox::media", track_id = %track.id(), kind = %kind, "remote track received");
                let _ = tx.send(MediaEvent::RemoteStream(WebRtcStream {
                    id: track.stream_id(),
                    tracks: StreamTracks::Remote(vec![(kind, track)]),
                    stopped: Arc::new(AtomicBool::new(false)),
                }));
            })
        }));

        let tx = events_tx;
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(MediaEvent::ConnectionState(state.to_string()));
            })
        }));

        Ok((WebRtcSession { peer }, events_rx))
    }
}

pub struct WebRtcSession {
    peer: Arc<RTCPeerConnection>,
}

impl WebRtcSession {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match desc.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        DescriptionKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
    .map_err(session_error)
}

#[async_trait]
impl MediaSession for WebRtcSession {
    type Stream = WebRtcStream;

    async fn attach_local_stream(&self, stream: &WebRtcStream) -> Result<(), MediaError> {
        for (kind, track) in stream.local_tracks() {
            self.peer
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|err| MediaError::Session(format!("add {kind} track: {err}")))?;
        }
        Ok(())
    }

    async fn create_local_description(
        &self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, MediaError> {
        let desc = match kind {
            DescriptionKind::Offer => self.peer.create_offer(None).await,
            DescriptionKind::Answer => self.peer.create_answer(None).await,
        }
        .map_err(session_error)?;
        Ok(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }

    async fn apply_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        self.peer
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(session_error)
    }

    async fn apply_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.peer
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(session_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(|err| MediaError::InvalidCandidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.peer.close().await {
            warn!(target = "callbox::media", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_carries_requested_tracks() {
        let platform = WebRtcPlatform::new(Vec::new()).expect("platform");
        let stream = platform
            .acquire_local_media(&MediaConstraints::default())
            .await
            .expect("media");
        assert_eq!(stream.tracks(), vec![TrackKind::Audio, TrackKind::Video]);

        let (session, _events) = platform.create_session().await.expect("session");
        session.attach_local_stream(&stream).await.expect("attach");
        let offer = session
            .create_local_description(DescriptionKind::Offer)
            .await
            .expect("offer");
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        session.close().await;
    }
}
