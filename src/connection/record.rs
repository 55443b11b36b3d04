//! Connection records
//!
//! A [`ConnectionRecord`] is the single source of truth for a session. The
//! wire form keeps compatibility with the persisted collections: camelCase
//! field names, and `connected` serialized as `false` until the upgrade and
//! as an ISO-8601 instant afterwards.

use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Either not yet connected (`false` on the wire) or the upgrade instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectedAt {
    #[default]
    NotConnected,
    At(DateTime<Utc>),
}

impl ConnectedAt {
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            ConnectedAt::NotConnected => None,
            ConnectedAt::At(instant) => Some(*instant),
        }
    }
}

impl Serialize for ConnectedAt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConnectedAt::NotConnected => serializer.serialize_bool(false),
            ConnectedAt::At(instant) => instant.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ConnectedAt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            At(DateTime<Utc>),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(ConnectedAt::NotConnected),
            Raw::Flag(true) => Err(D::Error::custom("connected must be false or an instant")),
            Raw::At(instant) => Ok(ConnectedAt::At(instant)),
        }
    }
}

/// Persisted state of one connection, from issuance to close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    pub report_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connected: ConnectedAt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected: Option<DateTime<Utc>>,
    pub alive: bool,
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// A freshly issued record: token minted, no socket yet.
    pub fn issued(
        id: Uuid,
        client_id: impl Into<String>,
        token_id: impl Into<String>,
        report_url: impl Into<String>,
        client_address: Option<String>,
        timeout: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            server_id: None,
            token_id: Some(token_id.into()),
            client_address,
            report_url: report_url.into(),
            timeout: Some(timeout),
            connected: ConnectedAt::NotConnected,
            disconnected: None,
            alive: false,
            open: true,
            last_heartbeat: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connected, ConnectedAt::At(_))
    }

    /// Whether this record still claims the client's single session slot:
    /// open, and either connected or inside its issuance window.
    pub fn blocks_reissue(&self, now: DateTime<Utc>) -> bool {
        self.open && (self.is_connected() || self.timeout.map(|t| t >= now).unwrap_or(false))
    }
}
