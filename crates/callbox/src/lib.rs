//! Peer-to-peer call setup over a WebSocket signaling relay.
//!
//! - [`transport`]: reconnecting signaling socket with exponential backoff.
//! - [`negotiator`]: offer/answer state machine with candidate buffering.
//! - [`phone`]: actor facade tying the two to a [`media::MediaPlatform`].
//! - [`adapter`]: runtime backend selection from [`PhoneConfig`].

pub mod adapter;
pub mod config;
pub mod events;
pub mod media;
pub mod negotiator;
pub mod phone;
pub mod transport;

pub use adapter::{AdapterError, AdapterKind, AdapterSet, PhoneAdapter};
pub use callbox_proto::{IceCandidate, SessionDescription, SignalingMessage};
pub use config::PhoneConfig;
pub use events::{EventHub, Subscription};
pub use media::{MediaConstraints, MediaError, MediaPlatform, MediaSession, MediaStream};
pub use negotiator::{NegotiationError, NegotiationState, Negotiator};
pub use phone::{Phone, PhoneError, PhoneEvent};
pub use transport::{SignalingSocket, TransportConfig, TransportError, TransportEvent, TransportState};
