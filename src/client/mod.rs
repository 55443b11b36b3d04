//! Client connector
//!
//! Maintains a single WebSocket session with the control server: exchanges
//! the identity token for a connection token, recovers the upgrade endpoint
//! from the token payload, opens the socket with the token as the `Origin`
//! header, fans out `connect`/`message`/`disconnect` events, and optionally
//! reconnects after a drop.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::Envelope;

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_INTERVAL_SECONDS: u64 = 30;

/// Connector errors. The token request is never retried automatically;
/// reconnection only follows an established session's close.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("token request failed: {0}")]
    TokenRequest(String),

    #[error("connection token undecodable: {0}")]
    TokenDecode(String),

    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    #[error("no socket")]
    NoSocket,

    #[error("socket is not open")]
    SocketClosed,

    #[error("message has no string 'type' field")]
    MissingType,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Fired with the live socket handle when the session opens.
pub type ConnectSubscriber = Arc<dyn Fn(&ClientHandle) + Send + Sync>;
/// Fired for every validated inbound envelope.
pub type MessageSubscriber = Arc<dyn Fn(&Envelope) + Send + Sync>;
/// Fired when the session ends.
pub type DisconnectSubscriber = Arc<dyn Fn() + Send + Sync>;

/// Cloneable handle for queueing outbound frames on the client socket.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientHandle {
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Message::Text(text)).is_ok()
    }

    fn pong(&self, payload: Vec<u8>) -> bool {
        self.tx.send(Message::Pong(payload)).is_ok()
    }

    pub fn close(&self) -> bool {
        self.tx.send(Message::Close(None)).is_ok()
    }
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Long-lived identity token presented to the token endpoint.
    pub identity_token: String,
    /// The token endpoint (POST), e.g. `http://host:port/api/connection`.
    pub report_url: String,
    /// Reconnect after a dropped session.
    pub always_reconnect: bool,
    /// Delay before a reconnect attempt.
    pub reconnect_interval: Duration,
}

impl ConnectorConfig {
    pub fn new(identity_token: impl Into<String>, report_url: impl Into<String>) -> Self {
        Self {
            identity_token: identity_token.into(),
            report_url: report_url.into(),
            always_reconnect: false,
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECONDS),
        }
    }

    pub fn with_reconnect(mut self) -> Self {
        self.always_reconnect = true;
        self
    }
}

pub struct Connector {
    config: ConnectorConfig,
    http: reqwest::Client,
    always_reconnect: AtomicBool,
    locally_closed: AtomicBool,
    socket: Mutex<Option<ClientHandle>>,
    on_connect: RwLock<Vec<ConnectSubscriber>>,
    on_message: RwLock<Vec<MessageSubscriber>>,
    on_disconnect: RwLock<Vec<DisconnectSubscriber>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("report_url", &self.config.report_url)
            .field("connected", &self.socket.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Arc<Self> {
        let always_reconnect = config.always_reconnect;
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            always_reconnect: AtomicBool::new(always_reconnect),
            locally_closed: AtomicBool::new(false),
            socket: Mutex::new(None),
            on_connect: RwLock::new(Vec::new()),
            on_message: RwLock::new(Vec::new()),
            on_disconnect: RwLock::new(Vec::new()),
        })
    }

    pub fn on_connect(&self, subscriber: ConnectSubscriber) {
        self.on_connect.write().push(subscriber);
    }

    pub fn on_message(&self, subscriber: MessageSubscriber) {
        self.on_message.write().push(subscriber);
    }

    pub fn on_disconnect(&self, subscriber: DisconnectSubscriber) {
        self.on_disconnect.write().push(subscriber);
    }

    /// Obtain a connection token and open the WebSocket session. Returns
    /// once the session is established; the read loop runs in the
    /// background. Failures are terminal for this attempt.
    pub fn connect(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            let trace_id = Uuid::new_v4();
            let response = self
                .http
                .post(&self.config.report_url)
                .header(reqwest::header::AUTHORIZATION, &self.config.identity_token)
                .json(&json!({"idtoken": self.config.identity_token, "traceId": trace_id}))
                .send()
                .await?;
            let status = response.status();
            if status != reqwest::StatusCode::OK {
                error!(trace_id = %trace_id, status = %status, "connection token request rejected");
                return Err(ConnectorError::TokenRequest(format!("status {status}")));
            }
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(err) => {
                    error!(trace_id = %trace_id, error = %err, "token response body unparseable");
                    return Err(ConnectorError::Http(err));
                }
            };
            let Some(token) = body.get("token").and_then(Value::as_str) else {
                error!(trace_id = %trace_id, "token response carries no token");
                return Err(ConnectorError::TokenRequest(
                    "no token in response body".to_string(),
                ));
            };

            let ws_url = decode_report_url(token).map_err(|err| {
                error!(trace_id = %trace_id, error = %err, "connection token payload undecodable");
                err
            })?;

            let mut request = ws_url
                .clone()
                .into_client_request()
                .map_err(|err| ConnectorError::Connect(err.to_string()))?;
            let origin = HeaderValue::from_str(token)
                .map_err(|err| ConnectorError::Connect(err.to_string()))?;
            request.headers_mut().insert("origin", origin);

            let (stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|err| ConnectorError::Connect(err.to_string()))?;
            info!(trace_id = %trace_id, endpoint = %ws_url, "session established");

            let (mut sink, mut source) = stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
            let send_pump = tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
            });

            let handle = ClientHandle { tx };
            *self.socket.lock() = Some(handle.clone());
            self.locally_closed.store(false, Ordering::SeqCst);

            for subscriber in self.on_connect.read().clone() {
                subscriber(&handle);
            }

            let connector = self.clone();
            tokio::spawn(async move {
                while let Some(next) = source.next().await {
                    let message = match next {
                        Ok(message) => message,
                        Err(_) => break,
                    };
                    match message {
                        Message::Text(text) => connector.dispatch_inbound(&text),
                        Message::Ping(payload) => {
                            handle.pong(payload);
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                drop(handle);
                connector.socket.lock().take();
                let _ = send_pump.await;
                connector.session_closed().await;
            });

            Ok(())
        })
    }

    fn dispatch_inbound(&self, raw: &str) {
        match Envelope::parse(raw) {
            Ok(envelope) => {
                for subscriber in self.on_message.read().clone() {
                    subscriber(&envelope);
                }
            }
            Err(err) => debug!(error = %err, "dropping inbound frame"),
        }
    }

    /// The read loop ended. Fans out `disconnect` (unless an explicit
    /// `disconnect()` already did) and schedules a reconnect attempt.
    async fn session_closed(self: &Arc<Self>) {
        if self.locally_closed.swap(false, Ordering::SeqCst) {
            return;
        }
        for subscriber in self.on_disconnect.read().clone() {
            subscriber();
        }
        if self.always_reconnect.load(Ordering::SeqCst) {
            let interval = self.config.reconnect_interval;
            let connector = self.clone();
            info!(delay_s = interval.as_secs(), "scheduling reconnect");
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                if !connector.always_reconnect.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(err) = connector.connect().await {
                    warn!(error = %err, "reconnect attempt failed");
                }
            });
        }
    }

    /// Send a message over the established session.
    pub fn send(&self, message: &Value) -> Result<(), ConnectorError> {
        let socket = self.socket.lock();
        let Some(handle) = socket.as_ref() else {
            return Err(ConnectorError::NoSocket);
        };
        if !handle.is_open() {
            return Err(ConnectorError::SocketClosed);
        }
        if message.get("type").and_then(Value::as_str).is_none() {
            return Err(ConnectorError::MissingType);
        }
        if handle.send_text(message.to_string()) {
            Ok(())
        } else {
            Err(ConnectorError::SocketClosed)
        }
    }

    /// Stop the session for good: no reconnect. When the socket is still
    /// open, a final `client.state: stopped.<reason>` frame goes out, the
    /// socket closes, and `disconnect` subscribers fire synchronously (the
    /// close event is not delivered to the closing side in every runtime).
    /// Without an open socket this only clears the reconnect flag.
    pub fn disconnect(&self, reason: &str) {
        self.always_reconnect.store(false, Ordering::SeqCst);
        let Some(handle) = self.socket.lock().take() else {
            return;
        };
        if !handle.is_open() {
            // the read loop owns the close that is already under way
            return;
        }
        self.locally_closed.store(true, Ordering::SeqCst);
        handle.send_text(
            json!({"type": "client.state", "state": format!("stopped.{reason}")}).to_string(),
        );
        handle.close();
        for subscriber in self.on_disconnect.read().clone() {
            subscriber();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket
            .lock()
            .as_ref()
            .map(ClientHandle::is_open)
            .unwrap_or(false)
    }
}

/// Recover the WebSocket endpoint from the middle segment of the connection
/// token, tolerating missing base64 padding.
fn decode_report_url(token: &str) -> Result<String, ConnectorError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ConnectorError::TokenDecode("not a three-segment token".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| ConnectorError::TokenDecode(err.to_string()))?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|err| ConnectorError::TokenDecode(err.to_string()))?;
    payload
        .get("reportUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ConnectorError::TokenDecode("payload carries no reportUrl".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn token_with_payload(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn test_decode_report_url() {
        let token = token_with_payload(&json!({"reportUrl": "ws://host:1234/api/connection/connect"}));
        assert_eq!(
            decode_report_url(&token).unwrap(),
            "ws://host:1234/api/connection/connect"
        );
    }

    #[test]
    fn test_decode_report_url_tolerates_padding() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let body = format!(
            "{}==",
            URL_SAFE_NO_PAD.encode(json!({"reportUrl": "ws://x/connect"}).to_string())
        );
        let token = format!("{header}.{body}.sig");
        assert_eq!(decode_report_url(&token).unwrap(), "ws://x/connect");
    }

    #[test]
    fn test_decode_report_url_rejects_malformed_tokens() {
        assert!(decode_report_url("onesegment").is_err());
        assert!(decode_report_url("a.!!!.c").is_err());
        let token = token_with_payload(&json!({"other": 1}));
        assert!(decode_report_url(&token).is_err());
    }

    #[tokio::test]
    async fn test_send_without_socket_fails() {
        let connector = Connector::new(ConnectorConfig::new("tok", "http://localhost/api/connection"));
        assert!(matches!(
            connector.send(&json!({"type": "demo.ping"})),
            Err(ConnectorError::NoSocket)
        ));
    }

    #[tokio::test]
    async fn test_send_requires_string_type() {
        let connector = Connector::new(ConnectorConfig::new("tok", "http://localhost/api/connection"));
        let (tx, _rx) = mpsc::unbounded_channel();
        *connector.socket.lock() = Some(ClientHandle { tx });
        assert!(matches!(
            connector.send(&json!({"no": "type"})),
            Err(ConnectorError::MissingType)
        ));
        assert!(matches!(
            connector.send(&json!({"type": 7})),
            Err(ConnectorError::MissingType)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_sends_farewell_and_fans_out() {
        let connector = Connector::new(ConnectorConfig::new("tok", "http://localhost/api/connection"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        *connector.socket.lock() = Some(ClientHandle { tx });

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        connector.on_disconnect(Arc::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        }));

        connector.disconnect("shutdown");
        assert!(fired.load(Ordering::SeqCst), "disconnect fan-out is synchronous");
        assert!(!connector.is_connected());

        match rx.try_recv() {
            Ok(Message::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "client.state");
                assert_eq!(value["state"], "stopped.shutdown");
            }
            other => panic!("expected farewell frame, got {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_socket_fires_no_subscribers() {
        let connector = Connector::new(ConnectorConfig::new("tok", "http://localhost/api/connection"));
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        connector.on_disconnect(Arc::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        }));

        connector.disconnect("shutdown");
        assert!(!fired.load(Ordering::SeqCst), "no session, no disconnect fan-out");
    }

    #[tokio::test]
    async fn test_disconnect_twice_fires_subscribers_once() {
        let connector = Connector::new(ConnectorConfig::new("tok", "http://localhost/api/connection"));
        let (tx, _rx) = mpsc::unbounded_channel();
        *connector.socket.lock() = Some(ClientHandle { tx });

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        connector.on_disconnect(Arc::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        connector.disconnect("shutdown");
        connector.disconnect("shutdown");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_on_dead_socket_leaves_fanout_to_read_loop() {
        let connector = Connector::new(ConnectorConfig::new("tok", "http://localhost/api/connection"));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx); // send pump already gone
        *connector.socket.lock() = Some(ClientHandle { tx });

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        connector.on_disconnect(Arc::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        }));

        connector.disconnect("shutdown");
        assert!(!fired.load(Ordering::SeqCst));
        // the in-flight close still reaches subscribers through the read loop
        assert!(!connector.locally_closed.load(Ordering::SeqCst));
    }
}
