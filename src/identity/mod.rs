//! Client identity interface
//!
//! The identity provider is an external collaborator: it verifies identity
//! tokens and resolves client descriptors. This module defines the seam and
//! a config-backed token-table implementation used by the binary and tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Descriptor of a known client principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Outcome of identity-token verification.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityVerification {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IdentityVerification {
    pub fn success(client_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            client_id: Some(client_id.into()),
            state: "success".to_string(),
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            client_id: None,
            state: "authenticationError".to_string(),
            reason: Some(reason.into()),
        }
    }
}

/// External identity provider contract.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify an identity token and resolve the client it belongs to.
    async fn verify_identity(&self, token: &str) -> IdentityVerification;

    /// Look up a client descriptor by id.
    async fn get_client(&self, client_id: &str) -> Option<ClientDescriptor>;

    /// Advisory client-state update; the identity provider owns persistence
    /// of the `state` field.
    async fn update_client_state(&self, client_id: &str, state: &str);
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Token-table identity provider backed by configuration.
///
/// Maps identity tokens to client ids from the `identity.clients` config
/// section so the server runs end-to-end without an external provider.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    tokens: RwLock<HashMap<String, String>>,
    clients: RwLock<HashMap<String, ClientDescriptor>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the token table from the `identity.clients` config section,
    /// which maps identity tokens to client ids.
    pub fn from_config(config: &Value) -> Self {
        let provider = Self::new();
        if let Some(clients) = config
            .get("identity")
            .and_then(|i| i.get("clients"))
            .and_then(|c| c.as_object())
        {
            for (token, client_id) in clients {
                if let Some(client_id) = client_id.as_str() {
                    provider.insert_token(token, client_id);
                }
            }
        }
        provider
    }

    /// Register an identity token for a client id.
    pub fn insert_token(&self, token: &str, client_id: &str) {
        self.tokens
            .write()
            .insert(token.to_string(), client_id.to_string());
        self.clients
            .write()
            .entry(client_id.to_string())
            .or_insert_with(|| ClientDescriptor {
                id: client_id.to_string(),
                state: None,
            });
    }

    /// Current state of a client, if known.
    pub fn client_state(&self, client_id: &str) -> Option<String> {
        self.clients
            .read()
            .get(client_id)
            .and_then(|c| c.state.clone())
    }

    /// Set a client state directly (test hook).
    pub fn set_client_state(&self, client_id: &str, state: &str) {
        if let Some(client) = self.clients.write().get_mut(client_id) {
            client.state = Some(state.to_string());
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify_identity(&self, token: &str) -> IdentityVerification {
        let tokens = self.tokens.read();
        let matched = tokens
            .iter()
            .find(|(known, _)| timing_safe_eq(known, token))
            .map(|(_, client_id)| client_id.clone());
        match matched {
            Some(client_id) => IdentityVerification::success(client_id),
            None => IdentityVerification::failure("Invalid identity token."),
        }
    }

    async fn get_client(&self, client_id: &str) -> Option<ClientDescriptor> {
        self.clients.read().get(client_id).cloned()
    }

    async fn update_client_state(&self, client_id: &str, state: &str) {
        if let Some(client) = self.clients.write().get_mut(client_id) {
            client.state = Some(state.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq("abc", "abc"));
        assert!(!timing_safe_eq("abc", "abd"));
        assert!(!timing_safe_eq("abc", "ab"));
        assert!(timing_safe_eq("", ""));
    }

    #[tokio::test]
    async fn test_verify_known_token() {
        let provider = StaticIdentityProvider::new();
        provider.insert_token("tok-1", "cliX");

        let verification = provider.verify_identity("tok-1").await;
        assert!(verification.ok);
        assert_eq!(verification.client_id.as_deref(), Some("cliX"));
        assert_eq!(verification.state, "success");
    }

    #[tokio::test]
    async fn test_verify_unknown_token() {
        let provider = StaticIdentityProvider::new();
        let verification = provider.verify_identity("nope").await;
        assert!(!verification.ok);
        assert_eq!(verification.state, "authenticationError");
        assert!(verification.reason.is_some());
    }

    #[tokio::test]
    async fn test_from_config_builds_token_table() {
        let provider = StaticIdentityProvider::from_config(&json!({
            "identity": { "clients": { "tok-1": "cliX" } }
        }));
        assert!(provider.verify_identity("tok-1").await.ok);
        assert!(provider.get_client("cliX").await.is_some());
    }

    #[tokio::test]
    async fn test_update_client_state() {
        let provider = StaticIdentityProvider::new();
        provider.insert_token("tok-1", "cliX");
        provider.update_client_state("cliX", "unknown").await;
        assert_eq!(
            provider.get_client("cliX").await.unwrap().state.as_deref(),
            Some("unknown")
        );
    }
}
