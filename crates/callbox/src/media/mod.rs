//! Media capability contract consumed by the negotiator and the phone facade.
//!
//! The engine behind these traits does all SDP and ICE work. Callbox only
//! decides when descriptions and candidates are created, sent and applied.

pub mod loopback;
#[cfg(feature = "webrtc-backend")]
pub mod webrtc;

use std::fmt;

use async_trait::async_trait;
use callbox_proto::{DescriptionKind, IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use loopback::{LoopbackPlatform, LoopbackSession, LoopbackStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn requested_tracks(&self) -> Vec<TrackKind> {
        let mut tracks = Vec::with_capacity(2);
        if self.audio {
            tracks.push(TrackKind::Audio);
        }
        if self.video {
            tracks.push(TrackKind::Video);
        }
        tracks
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media unavailable: {0}")]
    Unavailable(String),
    #[error("media session error: {0}")]
    Session(String),
    #[error("candidate rejected: {0}")]
    InvalidCandidate(String),
    #[error("media session closed")]
    Closed,
}

/// Notifications raised by a media session outside any request.
#[derive(Debug, Clone)]
pub enum MediaEvent<S> {
    LocalCandidate(IceCandidate),
    RemoteStream(S),
    ConnectionState(String),
}

pub type MediaEvents<S> = mpsc::UnboundedReceiver<MediaEvent<S>>;

pub trait MediaStream: Clone + fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn tracks(&self) -> Vec<TrackKind>;
    /// Release the capture devices behind the stream. Safe to call twice.
    fn stop(&self);
}

#[async_trait]
pub trait MediaSession: Send + Sync + 'static {
    type Stream: MediaStream;

    async fn attach_local_stream(&self, stream: &Self::Stream) -> Result<(), MediaError>;
    async fn create_local_description(
        &self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, MediaError>;
    async fn apply_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError>;
    async fn apply_remote_description(&self, desc: &SessionDescription)
        -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;
    async fn close(&self);
}

#[async_trait]
pub trait MediaPlatform: Send + Sync + 'static {
    type Stream: MediaStream;
    type Session: MediaSession<Stream = Self::Stream>;

    /// Backend name, also used as the adapter name.
    fn name(&self) -> &'static str;

    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Self::Stream, MediaError>;

    async fn create_session(
        &self,
    ) -> Result<(Self::Session, MediaEvents<Self::Stream>), MediaError>;
}
