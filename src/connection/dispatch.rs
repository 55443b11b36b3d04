//! Inbound message dispatch
//!
//! Every inbound text frame is an envelope: a JSON object whose `type` field
//! splits at the first dot into a provider tag and a message tag. The router
//! resolves the pair in a two-level map and invokes the handler; anything
//! that fails validation is logged and dropped, and a handler error never
//! tears down the connection.

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::{debug, warn};

use super::record::ConnectionRecord;
use super::registry::Registry;
use super::sender::OutboundHandle;

// Provider tags carry no dot; message tags may.
static ENVELOPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_-]+)\.([A-Za-z0-9._-]+)$").expect("envelope regex is valid")
});

/// A validated inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub provider: String,
    pub message: String,
    pub body: Value,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no string 'type' field")]
    MissingType,

    #[error("message type '{0}' does not match provider.message")]
    BadType(String),
}

impl Envelope {
    /// Parse and validate a raw text frame.
    pub fn parse(raw: &str) -> Result<Envelope, EnvelopeError> {
        Self::parse_value(serde_json::from_str(raw)?)
    }

    /// Validate an already-parsed JSON value.
    pub fn parse_value(body: Value) -> Result<Envelope, EnvelopeError> {
        let message_type = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?;
        let captures = ENVELOPE_RE
            .captures(message_type)
            .ok_or_else(|| EnvelopeError::BadType(message_type.to_string()))?;
        Ok(Envelope {
            provider: captures[1].to_string(),
            message: captures[2].to_string(),
            body,
        })
    }
}

/// Error surfaced by a message handler; logged and swallowed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Shared environment handed to every message handler.
#[derive(Clone)]
pub struct ProviderEnv {
    pub server_id: String,
    pub registry: Arc<Registry>,
}

/// A registered message handler. Invoked synchronously, one frame at a time
/// per connection, in wire order.
pub type MessageHandler = Arc<
    dyn Fn(&Envelope, &OutboundHandle, &ConnectionRecord, &ProviderEnv) -> Result<(), HandlerError>
        + Send
        + Sync,
>;

/// Two-level handler lookup: provider tag, then message tag.
#[derive(Default)]
pub struct MessageRouter {
    providers: RwLock<HashMap<String, HashMap<String, MessageHandler>>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers = self.providers.read();
        f.debug_struct("MessageRouter")
            .field("providers", &providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `provider.message`.
    pub fn register(&self, provider: &str, message: &str, handler: MessageHandler) {
        self.providers
            .write()
            .entry(provider.to_string())
            .or_default()
            .insert(message.to_string(), handler);
    }

    pub fn resolve(&self, provider: &str, message: &str) -> Option<MessageHandler> {
        self.providers
            .read()
            .get(provider)
            .and_then(|messages| messages.get(message))
            .cloned()
    }

    /// Validate, route, and invoke. The connection survives every failure.
    pub fn dispatch(
        &self,
        raw: &str,
        socket: &OutboundHandle,
        record: &ConnectionRecord,
        env: &ProviderEnv,
    ) {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(conn_id = %record.id, error = %err, "dropping inbound frame");
                return;
            }
        };
        let Some(handler) = self.resolve(&envelope.provider, &envelope.message) else {
            debug!(
                conn_id = %record.id,
                provider = %envelope.provider,
                message = %envelope.message,
                "no handler registered, dropping message"
            );
            return;
        };
        if let Err(err) = handler(&envelope, socket, record, env) {
            warn!(
                conn_id = %record.id,
                message = %envelope.message,
                error = %err,
                "message handler failed"
            );
        }
    }
}
