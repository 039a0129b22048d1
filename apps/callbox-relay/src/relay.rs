//! Client table and per-frame routing.
//!
//! Independent of the WebSocket layer: a connection is just an id plus an
//! outbound channel of JSON text, which keeps the routing rules unit-testable.

use std::sync::Arc;

use callbox_proto::SignalingMessage;
use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid JSON")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Invalid JSON")]
    InvalidUtf8,
    #[error("Invalid message: {0}")]
    InvalidMessage(#[source] callbox_proto::ProtoError),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Registered { id: String },
    Forwarded { target: String },
    /// Target not registered (or gone); nothing sent anywhere.
    Dropped { target: String },
    /// Frame refused; the sender got one error reply.
    Rejected { reason: String },
    /// Valid message with nothing to route.
    Ignored,
}

/// One live WebSocket as seen by the relay.
pub struct Connection {
    id: Uuid,
    client_id: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Connection {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: None,
            outbound,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn reply(&self, message: &SignalingMessage) {
        match message.encode() {
            Ok(text) => {
                let _ = self.outbound.send(text);
            }
            Err(err) => warn!(connection_id = %self.id, error = %err, "failed to encode reply"),
        }
    }
}

#[derive(Clone)]
struct ClientHandle {
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<String>,
}

#[derive(Clone, Default)]
pub struct RelayState {
    clients: Arc<DashMap<String, ClientHandle>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn handle_text(&self, conn: &mut Connection, text: &str) -> FrameOutcome {
        let outcome = match self.route(conn, text) {
            Ok(outcome) => outcome,
            Err(err) => self.reject(conn, err),
        };
        record_outcome(&outcome);
        outcome
    }

    /// Binary frames are accepted when they carry UTF-8 JSON.
    pub fn handle_binary(&self, conn: &mut Connection, data: Vec<u8>) -> FrameOutcome {
        match String::from_utf8(data) {
            Ok(text) => self.handle_text(conn, &text),
            Err(_) => {
                let outcome = self.reject(conn, RelayError::InvalidUtf8);
                record_outcome(&outcome);
                outcome
            }
        }
    }

    fn reject(&self, conn: &Connection, err: RelayError) -> FrameOutcome {
        let reason = err.to_string();
        warn!(connection_id = %conn.id, error = %reason, "rejecting signaling frame");
        conn.reply(&SignalingMessage::Error {
            error: reason.clone(),
        });
        FrameOutcome::Rejected { reason }
    }

    fn route(&self, conn: &mut Connection, text: &str) -> Result<FrameOutcome, RelayError> {
        let value: Value = serde_json::from_str(text).map_err(RelayError::InvalidJson)?;
        let message =
            SignalingMessage::decode_value(value.clone()).map_err(RelayError::InvalidMessage)?;

        if let SignalingMessage::Register { id } = message {
            self.register(conn, id.clone());
            conn.reply(&SignalingMessage::Registered { id: id.clone() });
            return Ok(FrameOutcome::Registered { id });
        }

        let Some(target) = message.target().map(str::to_string) else {
            debug!(connection_id = %conn.id, kind = message.kind(), "ignoring untargeted frame");
            return Ok(FrameOutcome::Ignored);
        };
        let Some(handle) = self.clients.get(&target).map(|entry| entry.value().clone()) else {
            debug!(connection_id = %conn.id, target = %target, kind = message.kind(), "target not registered, dropping");
            return Ok(FrameOutcome::Dropped { target });
        };

        let forwarded = stamp_sender(value, conn.client_id.as_deref());
        let text = serde_json::to_string(&forwarded).map_err(RelayError::Encode)?;
        if handle.outbound.send(text).is_err() {
            debug!(target = %target, "target connection closing, dropping");
            return Ok(FrameOutcome::Dropped { target });
        }
        debug!(
            connection_id = %conn.id,
            from = ?conn.client_id,
            target = %target,
            kind = message.kind(),
            "forwarded signaling message"
        );
        Ok(FrameOutcome::Forwarded { target })
    }

    /// Last registration wins. A connection that switches ids gives up the
    /// old one.
    fn register(&self, conn: &mut Connection, id: String) {
        if let Some(previous) = conn.client_id.take() {
            if previous != id {
                self.release(&previous, conn.id);
            }
        }
        let replaced = self.clients.insert(
            id.clone(),
            ClientHandle {
                connection_id: conn.id,
                outbound: conn.outbound.clone(),
            },
        );
        if replaced.is_some_and(|old| old.connection_id != conn.id) {
            info!(client_id = %id, connection_id = %conn.id, "registration replaced an existing client");
        } else {
            info!(client_id = %id, connection_id = %conn.id, "client registered");
        }
        conn.client_id = Some(id);
    }

    fn release(&self, id: &str, connection_id: Uuid) -> bool {
        self.clients
            .remove_if(id, |_, handle| handle.connection_id == connection_id)
            .is_some()
    }

    /// Forget the connection's registration unless another connection has
    /// since taken the id over.
    pub fn disconnect(&self, conn: &Connection) {
        let Some(id) = conn.client_id.as_deref() else {
            return;
        };
        if self.release(id, conn.id) {
            info!(client_id = %id, connection_id = %conn.id, "client unregistered");
        }
    }
}

fn stamp_sender(mut value: Value, sender: Option<&str>) -> Value {
    if let Value::Object(fields) = &mut value {
        let from = sender
            .map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null);
        fields.insert("from".to_string(), from);
    }
    value
}

fn record_outcome(outcome: &FrameOutcome) {
    match outcome {
        FrameOutcome::Registered { .. } => counter!("callbox_relay_registrations_total", 1),
        FrameOutcome::Forwarded { .. } => counter!("callbox_relay_frames_total", 1, "outcome" => "forwarded"),
        FrameOutcome::Dropped { .. } => counter!("callbox_relay_frames_total", 1, "outcome" => "dropped"),
        FrameOutcome::Rejected { .. } => counter!("callbox_relay_frames_total", 1, "outcome" => "rejected"),
        FrameOutcome::Ignored => counter!("callbox_relay_frames_total", 1, "outcome" => "ignored"),
    }
}
