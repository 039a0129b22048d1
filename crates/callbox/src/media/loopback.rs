//! In-memory media engine.
//!
//! Produces synthetic SDP, a single host candidate per session and a remote
//! stream as soon as a remote description carrying media is applied. Nothing
//! leaves the process, which makes it suitable for tests and offline demos.
//! Every operation is recorded so callers can inspect what the negotiator did.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use callbox_proto::{DescriptionKind, IceCandidate, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

use super::{
    MediaConstraints, MediaError, MediaEvent, MediaEvents, MediaPlatform, MediaSession,
    MediaStream, TrackKind,
};

#[derive(Debug, Clone)]
pub struct LoopbackStream {
    id: String,
    tracks: Vec<TrackKind>,
    stopped: Arc<AtomicBool>,
}

impl LoopbackStream {
    fn new(id: String, tracks: Vec<TrackKind>) -> Self {
        Self {
            id,
            tracks,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaStream for LoopbackStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<TrackKind> {
        self.tracks.clone()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            trace!(target = "callbox::media", stream = %self.id, "loopback stream stopped");
        }
    }
}

/// Counters shared by a platform and every session it created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackRecord {
    pub acquisitions: u32,
    pub denied: u32,
    pub sessions_created: u32,
    pub sessions_closed: u32,
}

#[derive(Clone, Default)]
pub struct LoopbackPlatform {
    shared: Arc<PlatformShared>,
}

#[derive(Default)]
struct PlatformShared {
    next_id: AtomicU64,
    deny: Mutex<Option<String>>,
    gate: Option<Semaphore>,
    record: Mutex<LoopbackRecord>,
    streams: Mutex<Vec<LoopbackStream>>,
    sessions: Mutex<Vec<LoopbackSession>>,
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquisitions block until [`LoopbackPlatform::release_acquisitions`]
    /// hands out permits.
    pub fn gated() -> Self {
        Self {
            shared: Arc::new(PlatformShared {
                gate: Some(Semaphore::new(0)),
                ..PlatformShared::default()
            }),
        }
    }

    pub fn release_acquisitions(&self, count: usize) {
        if let Some(gate) = &self.shared.gate {
            gate.add_permits(count);
        }
    }

    /// Every following acquisition fails as if the user refused access.
    pub fn deny_media(&self, reason: impl Into<String>) {
        *self.shared.deny.lock() = Some(reason.into());
    }

    pub fn allow_media(&self) {
        *self.shared.deny.lock() = None;
    }

    pub fn record(&self) -> LoopbackRecord {
        self.shared.record.lock().clone()
    }

    /// Streams handed out so far, in acquisition order.
    pub fn streams(&self) -> Vec<LoopbackStream> {
        self.shared.streams.lock().clone()
    }

    /// Sessions created so far, in creation order.
    pub fn sessions(&self) -> Vec<LoopbackSession> {
        self.shared.sessions.lock().clone()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl MediaPlatform for LoopbackPlatform {
    type Stream = LoopbackStream;
    type Session = LoopbackSession;

    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LoopbackStream, MediaError> {
        if let Some(gate) = &self.shared.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| MediaError::Unavailable("acquisition gate closed".into()))?;
            permit.forget();
        }
        let denied = self.shared.deny.lock().clone();
        if let Some(reason) = denied {
            self.shared.record.lock().denied += 1;
            return Err(MediaError::PermissionDenied(reason));
        }
        let tracks = constraints.requested_tracks();
        if tracks.is_empty() {
            return Err(MediaError::Unavailable("no tracks requested".into()));
        }
        let stream = LoopbackStream::new(format!("loopback-local-{}", self.next_id()), tracks);
        self.shared.record.lock().acquisitions += 1;
        self.shared.streams.lock().push(stream.clone());
        debug!(target = "callbox::media", stream = %stream.id, "loopback media acquired");
        Ok(stream)
    }

    async fn create_session(
        &self,
    ) -> Result<(LoopbackSession, MediaEvents<LoopbackStream>), MediaError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = LoopbackSession {
            id: self.next_id(),
            platform: Arc::downgrade(&self.shared),
            state: Arc::new(Mutex::new(SessionState::default())),
            events: events_tx,
        };
        self.shared.record.lock().sessions_created += 1;
        self.shared.sessions.lock().push(session.clone());
        Ok((session, events_rx))
    }
}

#[derive(Default)]
struct SessionState {
    local_tracks: Vec<TrackKind>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    gathered: Vec<IceCandidate>,
    candidate_sent: bool,
    remote_stream_sent: bool,
    connected: bool,
    closed: bool,
}

#[derive(Clone)]
pub struct LoopbackSession {
    id: u64,
    platform: Weak<PlatformShared>,
    state: Arc<Mutex<SessionState>>,
    events: mpsc::UnboundedSender<MediaEvent<LoopbackStream>>,
}

impl LoopbackSession {
    /// Remote candidates accepted by the engine, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Local candidates this session emitted.
    pub fn gathered_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().gathered.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn synthetic_sdp(&self, kind: DescriptionKind, tracks: &[TrackKind]) -> String {
        let version = self
            .platform
            .upgrade()
            .map_or(0, |platform| platform.next_id.load(Ordering::Relaxed));
        let mut sdp = format!(
            "v=0\r\no=callbox {} {} IN IP4 127.0.0.1\r\ns=loopback {:?}\r\nt=0 0\r\n",
            self.id, version, kind
        );
        for (mid, track) in tracks.iter().enumerate() {
            let payload = match track {
                TrackKind::Audio => 111,
                TrackKind::Video => 96,
            };
            sdp.push_str(&format!(
                "m={track} 9 UDP/TLS/RTP/SAVPF {payload}\r\na=mid:{mid}\r\na=sendrecv\r\n"
            ));
        }
        sdp
    }

    fn emit(&self, event: MediaEvent<LoopbackStream>) {
        let _ = self.events.send(event);
    }

    fn maybe_connected(&self, state: &mut SessionState) {
        if !state.connected && state.local.is_some() && state.remote.is_some() {
            state.connected = true;
            self.emit(MediaEvent::ConnectionState("connected".into()));
        }
    }
}

fn media_sections(sdp: &str) -> Vec<TrackKind> {
    sdp.lines()
        .filter_map(|line| {
            if line.starts_with("m=audio") {
                Some(TrackKind::Audio)
            } else if line.starts_with("m=video") {
                Some(TrackKind::Video)
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
impl MediaSession for LoopbackSession {
    type Stream = LoopbackStream;

    async fn attach_local_stream(&self, stream: &LoopbackStream) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        for track in stream.tracks() {
            if !state.local_tracks.contains(&track) {
                state.local_tracks.push(track);
            }
        }
        Ok(())
    }

    async fn create_local_description(
        &self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, MediaError> {
        let state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        if kind == DescriptionKind::Answer
            && state.remote.as_ref().map(|desc| desc.kind) != Some(DescriptionKind::Offer)
        {
            return Err(MediaError::Session(
                "cannot answer without a remote offer".into(),
            ));
        }
        let sdp = self.synthetic_sdp(kind, &state.local_tracks);
        Ok(SessionDescription { kind, sdp })
    }

    async fn apply_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.local = Some(desc.clone());
        if !state.candidate_sent {
            state.candidate_sent = true;
            let port = 40_000 + (self.id % 20_000);
            let mut candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host",
                self.id
            ));
            candidate.sdp_mid = Some("0".into());
            candidate.sdp_m_line_index = Some(0);
            state.gathered.push(candidate.clone());
            self.emit(MediaEvent::LocalCandidate(candidate));
        }
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn apply_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.remote = Some(desc.clone());
        let remote_tracks = media_sections(&desc.sdp);
        if !state.remote_stream_sent && !remote_tracks.is_empty() {
            state.remote_stream_sent = true;
            let stream = LoopbackStream::new(format!("loopback-remote-{}", self.id), remote_tracks);
            self.emit(MediaEvent::RemoteStream(stream));
        }
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        if state.remote.is_none() {
            return Err(MediaError::InvalidCandidate(
                "remote description not set".into(),
            ));
        }
        state.candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(platform) = self.platform.upgrade() {
            platform.record.lock().sessions_closed += 1;
        }
        self.emit(MediaEvent::ConnectionState("closed".into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn candidates_require_remote_description() {
        let platform = LoopbackPlatform::new();
        let (session, _events) = platform.create_session().await.expect("session");
        let candidate = IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host");

        assert!(matches!(
            session.add_ice_candidate(&candidate).await,
            Err(MediaError::InvalidCandidate(_))
        ));
        session
            .apply_remote_description(&SessionDescription::offer("v=0\r\nm=audio 9 X 111\r\n"))
            .await
            .expect("remote");
        session.add_ice_candidate(&candidate).await.expect("candidate");
        assert_eq!(session.applied_candidates(), vec![candidate]);
    }

    #[tokio::test]
    async fn local_description_emits_one_host_candidate() {
        let platform = LoopbackPlatform::new();
        let stream = platform
            .acquire_local_media(&MediaConstraints::audio_only())
            .await
            .expect("media");
        let (session, mut events) = platform.create_session().await.expect("session");
        session.attach_local_stream(&stream).await.expect("attach");

        let offer = session
            .create_local_description(DescriptionKind::Offer)
            .await
            .expect("offer");
        assert!(offer.sdp.contains("m=audio"));
        assert!(!offer.sdp.contains("m=video"));
        session.apply_local_description(&offer).await.expect("apply");
        session.apply_local_description(&offer).await.expect("apply again");

        let Ok(MediaEvent::LocalCandidate(emitted)) = events.try_recv() else {
            panic!("expected a local candidate");
        };
        assert!(events.try_recv().is_err());

        let sessions = platform.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].gathered_candidates(), vec![emitted]);
    }

    #[tokio::test]
    async fn gate_holds_acquisition_until_released() {
        let platform = LoopbackPlatform::gated();
        let pending = {
            let platform = platform.clone();
            tokio::spawn(async move {
                platform
                    .acquire_local_media(&MediaConstraints::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(platform.record().acquisitions, 0);

        platform.release_acquisitions(1);
        let stream = pending.await.expect("join").expect("media");
        assert_eq!(stream.tracks(), vec![TrackKind::Audio, TrackKind::Video]);
        assert_eq!(platform.record().acquisitions, 1);
    }

    #[tokio::test]
    async fn denied_media_is_reported() {
        let platform = LoopbackPlatform::new();
        platform.deny_media("blocked");
        assert_eq!(
            platform
                .acquire_local_media(&MediaConstraints::default())
                .await
                .unwrap_err(),
            MediaError::PermissionDenied("blocked".into())
        );
        assert_eq!(platform.record().denied, 1);
    }
}
