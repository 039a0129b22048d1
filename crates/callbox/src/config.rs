use std::env;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::AdapterKind;
use crate::media::MediaConstraints;
use crate::transport::TransportConfig;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Identity registered with the relay. Fixed for the lifetime of a phone.
    pub client_id: String,
    pub signaling_url: String,
    pub transport: TransportConfig,
    /// Media requested when placing a call.
    pub media_constraints: MediaConstraints,
    /// Media requested when answering.
    pub answer_constraints: MediaConstraints,
    pub adapters: Vec<AdapterKind>,
    pub ice_servers: Vec<String>,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            client_id: generated_client_id(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            transport: TransportConfig::default(),
            media_constraints: MediaConstraints::default(),
            answer_constraints: MediaConstraints::default(),
            adapters: vec![AdapterKind::WebRtc],
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl PhoneConfig {
    pub fn new(client_id: impl Into<String>, signaling_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            signaling_url: signaling_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CALLBOX_*` environment variables. Unknown
    /// adapter names are skipped.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let adapters = env::var("CALLBOX_ADAPTERS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .filter_map(|name| name.trim().parse::<AdapterKind>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|kinds| !kinds.is_empty())
            .unwrap_or(defaults.adapters);
        let ice_servers = env::var("CALLBOX_ICE_SERVERS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.ice_servers);
        Self {
            client_id: env::var("CALLBOX_CLIENT_ID").unwrap_or(defaults.client_id),
            signaling_url: env::var("CALLBOX_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            transport: TransportConfig::from_env(),
            media_constraints: defaults.media_constraints,
            answer_constraints: defaults.answer_constraints,
            adapters,
            ice_servers,
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_adapters(mut self, adapters: Vec<AdapterKind>) -> Self {
        self.adapters = adapters;
        self
    }
}

fn generated_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("user-{}", &id[..8])
}
