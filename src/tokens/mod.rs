//! Connection-token broker
//!
//! Mints and verifies the short-lived HS256 tokens that authorize exactly one
//! WebSocket upgrade. The token subject is the connection record id and the
//! payload carries the report URL (the upgrade endpoint). Issued tokens are
//! recorded in the `morrigan.connections.tokens` collection; deleting the
//! record revokes the token before it expires.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use crate::store::{DocumentStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

/// Collection holding issued-token records.
pub const TOKENS_COLLECTION: &str = "morrigan.connections.tokens";

/// Connection tokens expire 60 seconds after issuance.
pub const TOKEN_TTL_SECONDS: i64 = 60;

/// Record of an issued connection token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub id: String,
    pub subject: Uuid,
    pub expires: DateTime<Utc>,
}

/// A freshly minted token, handed back to the admission path.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: String,
    pub expires: DateTime<Utc>,
}

/// Outcome of token verification. Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct TokenVerification {
    pub ok: bool,
    pub subject: Option<Uuid>,
    pub reason: Option<String>,
}

impl TokenVerification {
    fn failure(reason: &str) -> Self {
        Self {
            ok: false,
            subject: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Facade over connection-token issuance and verification.
pub struct ConnectionTokenBroker {
    secret: Vec<u8>,
    store: Arc<DocumentStore>,
}

impl std::fmt::Debug for ConnectionTokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTokenBroker").finish_non_exhaustive()
    }
}

impl ConnectionTokenBroker {
    pub fn new(secret: impl Into<Vec<u8>>, store: Arc<DocumentStore>) -> Self {
        Self {
            secret: secret.into(),
            store,
        }
    }

    /// Mint a token for the given connection record id.
    pub fn issue(&self, subject: Uuid, report_url: &str) -> Result<IssuedToken, StoreError> {
        let token_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires = now + Duration::seconds(TOKEN_TTL_SECONDS);
        let token = self.sign(&json!({
            "sub": subject,
            "jti": token_id,
            "iat": now.timestamp(),
            "exp": expires.timestamp(),
            "reportUrl": report_url,
        }));
        let record = TokenRecord {
            id: token_id.clone(),
            subject,
            expires,
        };
        self.store
            .put(TOKENS_COLLECTION, &token_id, serde_json::to_value(&record)?)?;
        Ok(IssuedToken {
            token,
            token_id,
            expires,
        })
    }

    fn sign(&self, payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        let signing_input = format!("{header}.{body}");
        format!("{signing_input}.{}", self.mac(signing_input.as_bytes()))
    }

    fn mac(&self, input: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC-SHA256 accepts any key length");
        mac.update(input);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Verify a token: signature, expiry, and the backing token record.
    pub fn verify(&self, token: &str) -> TokenVerification {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return TokenVerification::failure("malformed token");
        }
        let signing_input = format!("{}.{}", segments[0], segments[1]);
        let expected = self.mac(signing_input.as_bytes());
        if !crate::identity::timing_safe_eq(&expected, segments[2]) {
            return TokenVerification::failure("bad signature");
        }
        let payload = match decode_segment(segments[1]) {
            Some(payload) => payload,
            None => return TokenVerification::failure("malformed token payload"),
        };
        let expires = payload.get("exp").and_then(Value::as_i64).unwrap_or(0);
        if expires <= Utc::now().timestamp() {
            return TokenVerification::failure("token expired");
        }
        let token_id = match payload.get("jti").and_then(Value::as_str) {
            Some(token_id) => token_id,
            None => return TokenVerification::failure("malformed token payload"),
        };
        if self.store.get(TOKENS_COLLECTION, token_id).is_none() {
            return TokenVerification::failure("token revoked or unknown");
        }
        let subject = payload
            .get("sub")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        match subject {
            Some(subject) => TokenVerification {
                ok: true,
                subject: Some(subject),
                reason: None,
            },
            None => TokenVerification::failure("malformed token subject"),
        }
    }

    /// Delete the record of an issued token, revoking it.
    pub fn delete(&self, token_id: &str) -> Result<(), StoreError> {
        self.store.remove(TOKENS_COLLECTION, token_id)?;
        Ok(())
    }
}

/// Decode a base64url JWT segment, tolerating missing padding.
pub fn decode_segment(segment: &str) -> Option<Value> {
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker() -> ConnectionTokenBroker {
        ConnectionTokenBroker::new("test-secret", Arc::new(DocumentStore::in_memory()))
    }

    #[test]
    fn test_issue_then_verify() {
        let broker = broker();
        let subject = Uuid::new_v4();
        let issued = broker.issue(subject, "ws://localhost/api/connection/connect").unwrap();

        let verification = broker.verify(&issued.token);
        assert!(verification.ok, "reason: {:?}", verification.reason);
        assert_eq!(verification.subject, Some(subject));
    }

    #[test]
    fn test_payload_carries_report_url() {
        let broker = broker();
        let issued = broker.issue(Uuid::new_v4(), "ws://example/api/connection/connect").unwrap();

        let payload = decode_segment(issued.token.split('.').nth(1).unwrap()).unwrap();
        assert_eq!(
            payload["reportUrl"].as_str(),
            Some("ws://example/api/connection/connect")
        );
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let broker = broker();
        assert!(!broker.verify("nonsense").ok);
        assert!(!broker.verify("a.b.c").ok);
        assert!(!broker.verify("").ok);
    }

    #[test]
    fn test_verify_rejects_tampered_signature() {
        let broker = broker();
        let issued = broker.issue(Uuid::new_v4(), "ws://x/connect").unwrap();
        let mut tampered = issued.token.clone();
        tampered.push('x');
        assert_eq!(broker.verify(&tampered).reason.as_deref(), Some("bad signature"));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let store = Arc::new(DocumentStore::in_memory());
        let minting = ConnectionTokenBroker::new("secret-a", store.clone());
        let verifying = ConnectionTokenBroker::new("secret-b", store);
        let issued = minting.issue(Uuid::new_v4(), "ws://x/connect").unwrap();
        assert!(!verifying.verify(&issued.token).ok);
    }

    #[test]
    fn test_deleted_token_is_revoked() {
        let broker = broker();
        let issued = broker.issue(Uuid::new_v4(), "ws://x/connect").unwrap();
        broker.delete(&issued.token_id).unwrap();

        let verification = broker.verify(&issued.token);
        assert!(!verification.ok);
        assert_eq!(verification.reason.as_deref(), Some("token revoked or unknown"));
    }

    #[test]
    fn test_decode_segment_tolerates_padding() {
        let encoded = URL_SAFE_NO_PAD.encode(br#"{"a":1}"#);
        let padded = format!("{encoded}==");
        assert_eq!(decode_segment(&padded), Some(json!({"a": 1})));
    }
}
