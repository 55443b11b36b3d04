//! Connection lifecycle service
//!
//! [`ConnectionService`] owns the whole lifecycle of a session: token
//! issuance, the WebSocket upgrade, heartbeat wiring, inbound dispatch,
//! outbound sends, cleanup, and shutdown. It is assembled once at startup
//! through [`ConnectionServiceBuilder`] and handed to every handler; there
//! is no module-scope state.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::identity::IdentityProvider;
use crate::store::DocumentStore;
use crate::tokens::ConnectionTokenBroker;

use super::dispatch::{HandlerError, MessageHandler, MessageRouter, ProviderEnv};
use super::events::{EventBus, EventChannel, Subscriber};
use super::heartbeat;
use super::record::{ConnectedAt, ConnectionRecord};
use super::registry::Registry;
use super::sender::{serialize_outbound, OutboundHandle, SendOutcome};

/// Namespace this provider registers under; the first dot-segment of the
/// report URL path and of its own message types.
pub const PROVIDER_NAME: &str = "connection";

/// Outcome of a token-issuance request, mapped onto HTTP by the routes.
#[derive(Debug)]
pub enum IssueOutcome {
    /// 200 with the minted token.
    Success { token: String },
    /// 400: malformed request or the client already holds the session slot.
    RequestError { reason: String },
    /// 403: the identity verifier's `{state, reason}`, passed on verbatim.
    AuthenticationError {
        state: String,
        reason: Option<String>,
    },
    /// 500: the store let us down.
    Failed { reason: String },
}

pub struct ConnectionService {
    server_id: String,
    endpoint_base: RwLock<String>,
    registry: Arc<Registry>,
    broker: ConnectionTokenBroker,
    identity: Arc<dyn IdentityProvider>,
    router: MessageRouter,
    events: EventBus,
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("server_id", &self.server_id)
            .field("endpoint_base", &*self.endpoint_base.read())
            .finish_non_exhaustive()
    }
}

impl ConnectionService {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn endpoint_base(&self) -> String {
        self.endpoint_base.read().clone()
    }

    /// Set the base URL embedded in report URLs. Called once at startup,
    /// after the bind address is known.
    pub fn set_endpoint_base(&self, base: &str) {
        *self.endpoint_base.write() = base.trim_end_matches('/').to_string();
    }

    fn report_url(&self) -> String {
        format!("{}/{}/connect", self.endpoint_base(), PROVIDER_NAME)
    }

    fn provider_env(&self) -> ProviderEnv {
        ProviderEnv {
            server_id: self.server_id.clone(),
            registry: self.registry.clone(),
        }
    }

    // === Admission: token issuance ===

    /// Exchange an identity token for a connection token, enforcing the
    /// one-session-per-client rule against the registry.
    pub async fn issue_token(
        &self,
        identity_token: Option<&str>,
        remote_address: Option<&str>,
    ) -> IssueOutcome {
        let Some(identity_token) = identity_token else {
            return IssueOutcome::RequestError {
                reason: "No token provided.".to_string(),
            };
        };

        let verification = self.identity.verify_identity(identity_token).await;
        if !verification.ok {
            warn!(
                remote = remote_address.unwrap_or("unknown"),
                "identity verification failed"
            );
            debug!(token = %identity_token, "rejected identity token");
            return IssueOutcome::AuthenticationError {
                state: verification.state,
                reason: verification.reason,
            };
        }
        let Some(client_id) = verification.client_id else {
            return IssueOutcome::Failed {
                reason: "Identity verifier returned no client id.".to_string(),
            };
        };

        // one issuance at a time per client: the duplicate check and the
        // insert below must be a single span
        let _guard = self.registry.lock_key(&client_id).await;

        let now = Utc::now();
        if let Some(existing) = self.registry.find_by_client_id(&client_id) {
            if existing.blocks_reissue(now) {
                return IssueOutcome::RequestError {
                    reason: format!(
                        "client '{}' already has an open connection ('{}')",
                        client_id, existing.id
                    ),
                };
            }
            // stale or closed leftover: drop it and its token before reissuing
            if let Some(token_id) = existing.token_id.as_deref() {
                if let Err(err) = self.broker.delete(token_id) {
                    return IssueOutcome::Failed {
                        reason: err.to_string(),
                    };
                }
            }
            if let Err(err) = self.registry.delete_by_id(&existing.id) {
                return IssueOutcome::Failed {
                    reason: err.to_string(),
                };
            }
            info!(
                conn_id = %existing.id,
                client_id = %client_id,
                "replaced stale connection record"
            );
        }

        let id = Uuid::new_v4();
        let report_url = self.report_url();
        let issued = match self.broker.issue(id, &report_url) {
            Ok(issued) => issued,
            Err(err) => {
                return IssueOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        let record = ConnectionRecord::issued(
            id,
            &client_id,
            &issued.token_id,
            &report_url,
            remote_address.map(str::to_string),
            issued.expires,
        );
        if let Err(err) = self.registry.upsert(&record) {
            return IssueOutcome::Failed {
                reason: err.to_string(),
            };
        }

        info!(conn_id = %id, client_id = %client_id, "connection token issued");
        IssueOutcome::Success {
            token: issued.token,
        }
    }

    // === Admission: WebSocket upgrade ===

    /// Drive one upgraded socket from admission to cleanup. Dropping the
    /// socket without a reply is the rejection path: no record is mutated.
    pub(crate) async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        remote_address: SocketAddr,
        origin: Option<String>,
    ) {
        let Some(origin) = origin else {
            warn!(remote = %remote_address, "upgrade request carried no connection token");
            return;
        };
        let verification = self.broker.verify(&origin);
        if !verification.ok {
            warn!(
                remote = %remote_address,
                reason = verification.reason.as_deref().unwrap_or("unknown"),
                "connection token rejected"
            );
            debug!(token = %origin, "rejected connection token");
            return;
        }
        let Some(id) = verification.subject else {
            return;
        };

        // serialize the whole admission span per connection id, so a
        // replayed token cannot race past the single-upgrade guard
        let admission_guard = self.registry.lock_key(&id.to_string()).await;
        let Some(mut record) = self.registry.find_by_id(&id) else {
            warn!(conn_id = %id, "verified token has no connection record");
            return;
        };
        // a connection token authorizes exactly one upgrade
        if record.is_connected() || !record.open {
            warn!(conn_id = %id, "connection record is not awaiting an upgrade");
            return;
        }

        record.alive = true;
        record.connected = ConnectedAt::At(Utc::now());
        record.server_id = Some(self.server_id.clone());
        record.client_address = Some(remote_address.ip().to_string());
        record.timeout = None;
        if let Err(err) = self.registry.upsert(&record) {
            error!(conn_id = %id, error = %err, "failed to persist upgraded record");
            return;
        }

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let send_pump = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });
        let handle = OutboundHandle::new(tx);
        self.registry.register_socket(id, handle.clone());

        // the upgrade write above is the only persisted mutation on this
        // path; authenticate subscribers see the in-process copy
        self.events
            .emit(EventChannel::Authenticate, &mut record, Some(&handle));

        self.registry
            .register_heartbeat(id, heartbeat::spawn_heartbeat(self.clone(), id));

        // the client learns it was admitted before connect subscribers run
        handle.send_json(&json!({"type": "connection.state", "state": "accepted"}));
        self.events
            .emit(EventChannel::Connect, &mut record, Some(&handle));

        info!(
            conn_id = %id,
            client_id = %record.client_id,
            remote = %remote_address,
            "connection established"
        );
        drop(admission_guard);

        let env = self.provider_env();
        while let Some(next) = stream.next().await {
            let message = match next {
                Ok(message) => message,
                Err(_) => break,
            };
            match message {
                Message::Text(text) => {
                    // the handler sees the current persisted state, not the
                    // copy from upgrade time
                    let Some(current) = self.registry.find_by_id(&id) else {
                        break;
                    };
                    self.router.dispatch(&text, &handle, &current, &env);
                }
                Message::Pong(_) => self.handle_pong(&id),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Binary(_) => {}
            }
        }

        drop(handle);
        self.cleanup(&id).await;
        let _ = send_pump.await;
    }

    // === Heartbeat ===

    /// One heartbeat tick. Returns `false` when the prober should stop.
    pub(crate) fn heartbeat_tick(&self, id: &Uuid) -> bool {
        let Some(mut record) = self.registry.find_by_id(id) else {
            return false;
        };
        if !record.open {
            return false;
        }
        if !record.alive {
            warn!(
                conn_id = %id,
                client_id = %record.client_id,
                "heartbeat missed"
            );
        }
        record.alive = false;
        if let Err(err) = self.registry.upsert(&record) {
            error!(conn_id = %id, error = %err, "failed to persist heartbeat state");
        }
        match self.registry.socket(id) {
            Some(handle) => handle.ping(),
            None => false,
        }
    }

    /// Pong receipt: the connection answered the last probe.
    pub(crate) fn handle_pong(&self, id: &Uuid) {
        let Some(mut record) = self.registry.find_by_id(id) else {
            return;
        };
        record.last_heartbeat = Some(Utc::now());
        record.alive = true;
        if let Err(err) = self.registry.upsert(&record) {
            error!(conn_id = %id, error = %err, "failed to persist heartbeat state");
        }
    }

    // === Sender ===

    /// Send a message to a connection owned by this server.
    pub fn send(&self, id: &Uuid, message: &Value) -> SendOutcome {
        let Some(record) = self.registry.find_by_id(id) else {
            return SendOutcome::failed("No such connection.");
        };
        if !record.alive || !record.open {
            return SendOutcome::failed("Connection closed or client not live.");
        }
        if record.server_id.as_deref() != Some(self.server_id.as_str()) {
            return SendOutcome::failed(format!(
                "Connection '{}' does not belong to this server ('{}').",
                id, self.server_id
            ));
        }
        let Some(handle) = self.registry.socket(id) else {
            return SendOutcome::failed("Connection closed or client not live.");
        };
        if handle.send_text(serialize_outbound(message)) {
            SendOutcome::success()
        } else {
            SendOutcome::failed("Connection closed or client not live.")
        }
    }

    // === Cleanup & shutdown ===

    /// Tear down a connection: close the socket, stop the heartbeat, close
    /// the record, revoke the token, and fan out `disconnect`. Idempotent,
    /// and tolerates a record that is already gone.
    pub async fn cleanup(&self, id: &Uuid) {
        let _guard = self.registry.lock_key(&id.to_string()).await;
        let socket = self.registry.unregister_socket(id);
        let had_socket = socket.is_some();
        if let Some(handle) = socket {
            if handle.is_open() {
                handle.close();
            }
        }
        if let Some(task) = self.registry.take_heartbeat(id) {
            task.abort();
        }

        let Some(mut record) = self.registry.find_by_id(id) else {
            return;
        };
        record.alive = false;
        record.open = false;
        if had_socket && record.disconnected.is_none() {
            record.disconnected = Some(Utc::now());
        }
        if let Some(token_id) = record.token_id.take() {
            if let Err(err) = self.broker.delete(&token_id) {
                warn!(conn_id = %id, error = %err, "failed to delete connection token record");
            }
        }
        if let Err(err) = self.registry.upsert(&record) {
            error!(conn_id = %id, error = %err, "failed to persist cleanup");
        }

        if had_socket {
            info!(conn_id = %id, client_id = %record.client_id, "connection closed");
            self.events.emit(EventChannel::Disconnect, &mut record, None);
            if let Some(descriptor) = self.identity.get_client(&record.client_id).await {
                let stopped = descriptor
                    .state
                    .as_deref()
                    .map(|state| state.starts_with("stopped"))
                    .unwrap_or(false);
                if !stopped {
                    self.identity
                        .update_client_state(&record.client_id, "unknown")
                        .await;
                }
            }
        }
    }

    /// Close every live session. Called once from the shutdown path.
    pub async fn shutdown(&self) {
        let mut ids = self.registry.socket_ids();
        ids.sort();
        if !ids.is_empty() {
            info!(count = ids.len(), "closing live connections");
        }
        for id in ids {
            self.cleanup(&id).await;
        }
    }
}

/// The built-in handler for `client.state` reports.
fn client_state_handler() -> MessageHandler {
    Arc::new(|envelope, socket, record, _env| {
        let state = envelope
            .body
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError("client.state carries no state".to_string()))?;
        if state == "accepted" {
            socket.send_json(&json!({"type": "client.state", "state": "ready"}));
        } else if state == "rejected" {
            warn!(conn_id = %record.id, "client rejected the connection, closing");
            socket.close();
        } else {
            debug!(conn_id = %record.id, state = %state, "client state report");
        }
        Ok(())
    })
}

/// Assembles a [`ConnectionService`]. Subscribers and provider handlers are
/// registered here, before the service starts accepting sockets.
pub struct ConnectionServiceBuilder {
    server_id: String,
    endpoint_base: String,
    store: Arc<DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    token_secret: Vec<u8>,
    subscribers: Vec<(EventChannel, Subscriber)>,
    handlers: Vec<(String, String, MessageHandler)>,
}

impl ConnectionServiceBuilder {
    pub fn new(
        server_id: impl Into<String>,
        store: Arc<DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint_base: String::new(),
            store,
            identity,
            token_secret: Uuid::new_v4().as_bytes().to_vec(),
            subscribers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn endpoint_base(mut self, base: impl Into<String>) -> Self {
        self.endpoint_base = base.into();
        self
    }

    /// Secret used to sign connection tokens. Defaults to a process-local
    /// random value, which is sufficient because a connection can only be
    /// used from the server that issued it.
    pub fn token_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.token_secret = secret.into();
        self
    }

    pub fn on(mut self, channel: EventChannel, subscriber: Subscriber) -> Self {
        self.subscribers.push((channel, subscriber));
        self
    }

    pub fn message_handler(
        mut self,
        provider: impl Into<String>,
        message: impl Into<String>,
        handler: MessageHandler,
    ) -> Self {
        self.handlers.push((provider.into(), message.into(), handler));
        self
    }

    pub fn build(self) -> Arc<ConnectionService> {
        let service = Arc::new(ConnectionService {
            server_id: self.server_id,
            endpoint_base: RwLock::new(self.endpoint_base.trim_end_matches('/').to_string()),
            registry: Arc::new(Registry::new(self.store.clone())),
            broker: ConnectionTokenBroker::new(self.token_secret, self.store),
            identity: self.identity,
            router: MessageRouter::new(),
            events: EventBus::new(),
        });
        service
            .router
            .register("client", "state", client_state_handler());
        for (provider, message, handler) in self.handlers {
            service.router.register(&provider, &message, handler);
        }
        for (channel, subscriber) in self.subscribers {
            service.events.on(channel, subscriber);
        }
        service
    }
}
