//! Signaling messages exchanged between callbox endpoints and the relay.
//! Kept in a dedicated crate so the relay and the client agree on the wire
//! shape without pulling in each other's runtime code.
//!
//! Every frame is a single JSON object tagged by `type`:
//!
//! ```json
//! {"type":"register","id":"alice"}
//! {"type":"offer","sdp":"v=0...","target":"bob","caller":"alice"}
//! {"type":"candidate","candidate":{"candidate":"candidate:1 1 udp ...","sdpMid":"0"},"target":"bob"}
//! ```
//!
//! The relay stamps `from` on everything it forwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Register {
        id: String,
    },
    Registered {
        id: String,
    },
    Offer {
        sdp: String,
        target: String,
        /// Display name of the caller, informational only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Answer {
        sdp: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Candidate {
        candidate: IceCandidate,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Error {
        error: String,
    },
}

/// Connectivity candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid signaling frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
}

impl SignalingMessage {
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_value(value: serde_json::Value) -> Result<Self, ProtoError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the variant, used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Register { .. } => "register",
            SignalingMessage::Registered { .. } => "registered",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Error { .. } => "error",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { target, .. }
            | SignalingMessage::Answer { target, .. }
            | SignalingMessage::Candidate { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::Candidate { from, .. } => from.as_deref(),
            _ => None,
        }
    }
}
