//! Outbound frames
//!
//! [`OutboundHandle`] wraps the per-connection sender half: handlers and the
//! HTTP send route queue frames onto an unbounded channel drained by the
//! socket's send pump.

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Result status of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SendStatus {
    Success,
    Failed,
}

/// Outcome of [`crate::connection::ConnectionService::send`].
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub status: SendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SendOutcome {
    pub fn success() -> Self {
        Self {
            status: SendStatus::Success,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            reason: Some(reason.into()),
        }
    }
}

/// Cloneable handle for queueing outbound frames to one socket.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl OutboundHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Whether the send pump is still draining this channel.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a text frame. Returns `false` when the socket is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Message::Text(text)).is_ok()
    }

    /// Queue a JSON value as a text frame.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Queue a WebSocket ping.
    pub fn ping(&self) -> bool {
        self.tx.send(Message::Ping(Vec::new())).is_ok()
    }

    /// Queue a close frame.
    pub fn close(&self) -> bool {
        self.tx.send(Message::Close(None)).is_ok()
    }
}

/// Serialize an outbound message: strings go out untouched, everything else
/// is JSON-encoded.
pub fn serialize_outbound(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
