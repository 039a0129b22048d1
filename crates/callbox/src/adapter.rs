//! Runtime selection of media backends.
//!
//! Each configured [`AdapterKind`] becomes one [`Phone`] behind the
//! [`PhoneAdapter`] trait, so a host can pick a backend by name without
//! knowing its concrete platform type.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::PhoneConfig;
use crate::media::{LoopbackPlatform, MediaError, MediaPlatform};
use crate::negotiator::NegotiationState;
use crate::phone::{Phone, PhoneError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    #[serde(rename = "webrtc")]
    WebRtc,
    #[serde(rename = "loopback")]
    Loopback,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::WebRtc => "webrtc",
            AdapterKind::Loopback => "loopback",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webrtc" => Ok(AdapterKind::WebRtc),
            "loopback" => Ok(AdapterKind::Loopback),
            other => Err(AdapterError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown adapter {0:?}")]
    Unknown(String),
    #[error("adapter {0} configured more than once")]
    Duplicate(AdapterKind),
    #[error("adapter {kind} unavailable: {reason}")]
    Unavailable { kind: AdapterKind, reason: String },
    #[error("no adapters configured")]
    Empty,
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[async_trait]
pub trait PhoneAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> NegotiationState;
    async fn connect(&self) -> Result<(), PhoneError>;
    async fn call(&self, target: &str) -> Result<(), PhoneError>;
    async fn hangup(&self) -> Result<(), PhoneError>;
}

#[async_trait]
impl<P: MediaPlatform> PhoneAdapter for Phone<P> {
    fn name(&self) -> &str {
        Phone::name(self)
    }

    fn state(&self) -> NegotiationState {
        Phone::state(self)
    }

    async fn connect(&self) -> Result<(), PhoneError> {
        Phone::connect(self).await
    }

    async fn call(&self, target: &str) -> Result<(), PhoneError> {
        Phone::call(self, target).await
    }

    async fn hangup(&self) -> Result<(), PhoneError> {
        Phone::hangup(self).await
    }
}

pub struct AdapterSet {
    adapters: Vec<(AdapterKind, Box<dyn PhoneAdapter>)>,
}

impl AdapterSet {
    /// Build one phone per configured adapter kind. Every adapter gets the
    /// same config. Must be called from within a Tokio runtime.
    pub fn from_config(config: &PhoneConfig) -> Result<Self, AdapterError> {
        if config.adapters.is_empty() {
            return Err(AdapterError::Empty);
        }
        let mut adapters: Vec<(AdapterKind, Box<dyn PhoneAdapter>)> = Vec::new();
        for kind in &config.adapters {
            if adapters.iter().any(|(existing, _)| existing == kind) {
                return Err(AdapterError::Duplicate(*kind));
            }
            adapters.push((*kind, build_adapter(*kind, config)?));
            info!(target = "callbox::adapter", adapter = %kind, client_id = %config.client_id, "adapter ready");
        }
        Ok(Self { adapters })
    }

    pub fn get(&self, name: &str) -> Option<&dyn PhoneAdapter> {
        let kind = name.parse::<AdapterKind>().ok()?;
        self.adapters
            .iter()
            .find(|(existing, _)| *existing == kind)
            .map(|(_, adapter)| adapter.as_ref())
    }

    /// The first configured adapter.
    pub fn primary(&self) -> Option<&dyn PhoneAdapter> {
        self.adapters.first().map(|(_, adapter)| adapter.as_ref())
    }

    pub fn kinds(&self) -> Vec<AdapterKind> {
        self.adapters.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

fn build_adapter(
    kind: AdapterKind,
    config: &PhoneConfig,
) -> Result<Box<dyn PhoneAdapter>, AdapterError> {
    match kind {
        AdapterKind::Loopback => Ok(Box::new(Phone::new(
            config.clone(),
            LoopbackPlatform::new(),
        ))),
        #[cfg(feature = "webrtc-backend")]
        AdapterKind::WebRtc => {
            let platform = crate::media::webrtc::WebRtcPlatform::new(config.ice_servers.clone())?;
            Ok(Box::new(Phone::new(config.clone(), platform)))
        }
        #[cfg(not(feature = "webrtc-backend"))]
        AdapterKind::WebRtc => Err(AdapterError::Unavailable {
            kind,
            reason: "built without the webrtc-backend feature".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(adapters: Vec<AdapterKind>) -> PhoneConfig {
        PhoneConfig::new("alice", "ws://127.0.0.1:9").with_adapters(adapters)
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("WebRTC".parse::<AdapterKind>().ok(), Some(AdapterKind::WebRtc));
        assert_eq!(" loopback ".parse::<AdapterKind>().ok(), Some(AdapterKind::Loopback));
        assert!(matches!(
            "sip".parse::<AdapterKind>(),
            Err(AdapterError::Unknown(name)) if name == "sip"
        ));
    }

    #[tokio::test]
    async fn duplicate_kinds_are_rejected() {
        let result =
            AdapterSet::from_config(&config(vec![AdapterKind::Loopback, AdapterKind::Loopback]));
        assert!(matches!(
            result,
            Err(AdapterError::Duplicate(AdapterKind::Loopback))
        ));
        assert!(matches!(
            AdapterSet::from_config(&config(Vec::new())),
            Err(AdapterError::Empty)
        ));
    }

    #[tokio::test]
    async fn looks_adapters_up_by_name() {
        let set = AdapterSet::from_config(&config(vec![AdapterKind::Loopback])).expect("set");
        assert_eq!(set.len(), 1);
        assert_eq!(set.kinds(), vec![AdapterKind::Loopback]);

        let adapter = set.get("loopback").expect("loopback adapter");
        assert_eq!(adapter.name(), "loopback");
        assert_eq!(adapter.state(), NegotiationState::Idle);
        assert!(matches!(
            adapter.call("bob").await,
            Err(PhoneError::NotConnected)
        ));
        assert!(set.get("webrtc").is_none());
        assert_eq!(set.primary().map(|a| a.name()), Some("loopback"));
    }
}
