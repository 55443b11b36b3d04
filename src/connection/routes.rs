//! HTTP and WebSocket surface
//!
//! The provider mounts five routes:
//! - `POST /` exchanges an identity token for a connection token
//! - `GET /connect` upgrades to WebSocket, gated by the connection token
//!   carried in the `Origin` header
//! - `GET /` and `GET /:connectionId` are operator-facing reads
//! - `POST /:connectionId/send` delivers an outbound message, gated by the
//!   `connection.send` capability

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::identity::timing_safe_eq;

use super::service::{ConnectionService, IssueOutcome};

/// Capability identifiers exposed by this provider.
pub const CAP_API: &str = "api";
pub const CAP_CONNECTION: &str = "connection";
pub const CAP_CONNECTION_SEND: &str = "connection.send";

/// The caller's resolved capability set, placed in request extensions by
/// [`capability_middleware`].
#[derive(Debug, Clone, Default)]
pub struct Authenticated {
    pub functions: Vec<String>,
}

impl Authenticated {
    pub fn can(&self, function: &str) -> bool {
        self.functions.iter().any(|f| f == function)
    }
}

/// Configuration for the capability middleware.
#[derive(Debug, Clone, Default)]
pub struct CapabilityConfig {
    /// Bearer token granting the full capability set.
    pub api_token: Option<String>,
}

/// Resolve the caller's capabilities from the `Authorization` header and
/// attach them to the request. Routes that need no capability ignore it.
pub async fn capability_middleware(
    State(config): State<CapabilityConfig>,
    mut request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let functions = match (config.api_token.as_deref(), provided) {
        (Some(expected), Some(token)) if timing_safe_eq(expected, token) => vec![
            CAP_API.to_string(),
            CAP_CONNECTION.to_string(),
            CAP_CONNECTION_SEND.to_string(),
        ],
        _ => Vec::new(),
    };
    request.extensions_mut().insert(Authenticated { functions });
    next.run(request).await
}

/// Build the provider's router, mounted by the server under
/// `/api/connection`.
pub fn provider_router(service: Arc<ConnectionService>) -> Router {
    Router::new()
        .route("/", post(issue_token).get(list_connections))
        .route("/connect", get(ws_connect))
        .route("/:connection_id", get(get_connection))
        .route("/:connection_id/send", post(send_to_connection))
        .with_state(service)
}

fn request_error(reason: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"state": "requestError", "reason": reason.into()})),
    )
        .into_response()
}

async fn issue_token(
    State(service): State<Arc<ConnectionService>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let identity_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let remote_address = remote.ip().to_string();
    match service
        .issue_token(identity_token, Some(&remote_address))
        .await
    {
        IssueOutcome::Success { token } => (
            StatusCode::OK,
            Json(json!({"state": "success", "token": token})),
        )
            .into_response(),
        IssueOutcome::RequestError { reason } => request_error(reason),
        IssueOutcome::AuthenticationError { state, reason } => {
            // the verifier's {state, reason}, passed on verbatim
            let mut body = Map::new();
            body.insert("state".to_string(), Value::String(state));
            if let Some(reason) = reason {
                body.insert("reason".to_string(), Value::String(reason));
            }
            (StatusCode::FORBIDDEN, Json(Value::Object(body))).into_response()
        }
        IssueOutcome::Failed { reason } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"state": "failed", "reason": reason})),
        )
            .into_response(),
    }
}

async fn ws_connect(
    State(service): State<Arc<ConnectionService>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| service.handle_socket(socket, remote, origin))
}

async fn list_connections(State(service): State<Arc<ConnectionService>>) -> Response {
    Json(service.registry().find_all()).into_response()
}

async fn get_connection(
    State(service): State<Arc<ConnectionService>>,
    Path(connection_id): Path<String>,
) -> Response {
    // an unparseable id matches no record
    let Ok(id) = Uuid::parse_str(&connection_id) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match service.registry().find_by_id(&id) {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn send_to_connection(
    State(service): State<Arc<ConnectionService>>,
    Path(connection_id): Path<String>,
    authenticated: Option<Extension<Authenticated>>,
    body: Option<Json<Value>>,
) -> Response {
    let authenticated = authenticated.map(|Extension(a)| a).unwrap_or_default();
    if !authenticated.can(CAP_CONNECTION_SEND) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "state": "authorizationError",
                "reason": "'connection.send' capability required."
            })),
        )
            .into_response();
    }
    let Ok(id) = Uuid::parse_str(&connection_id) else {
        return request_error("Invalid connection id.");
    };
    let Some(Json(message)) = body else {
        return request_error("No message provided.");
    };
    if message.get("type").and_then(Value::as_str).is_none() {
        return request_error("Message has no 'type' field.");
    }
    Json(service.send(&id, &message)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticated_capability_check() {
        let authenticated = Authenticated {
            functions: vec![CAP_API.to_string(), CAP_CONNECTION_SEND.to_string()],
        };
        assert!(authenticated.can(CAP_CONNECTION_SEND));
        assert!(!authenticated.can(CAP_CONNECTION));
        assert!(!Authenticated::default().can(CAP_CONNECTION_SEND));
    }
}
