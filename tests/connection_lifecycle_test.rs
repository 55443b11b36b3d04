//! Integration tests for the connection lifecycle.
//!
//! Each test spins up a real server on an ephemeral port via
//! [`run_server_with_config`], walks the two-phase admission protocol with
//! reqwest + tokio-tungstenite, and shuts the server down cleanly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use morrigan::connection::{ConnectedAt, ConnectionServiceBuilder};
use morrigan::identity::StaticIdentityProvider;
use morrigan::server::{run_server_with_config, ServerConfig, ServerHandle};
use morrigan::store::DocumentStore;

const API_TOKEN: &str = "api-token";
const IDENTITY_TOKEN: &str = "idtoken-cliX";

/// Spin up a test server with one known client identity.
async fn start_test_server() -> (ServerHandle, Arc<StaticIdentityProvider>) {
    let identity = Arc::new(StaticIdentityProvider::new());
    identity.insert_token(IDENTITY_TOKEN, "cliX");
    let service = ConnectionServiceBuilder::new(
        "srvA",
        Arc::new(DocumentStore::in_memory()),
        identity.clone(),
    )
    .token_secret("test-secret")
    .build();

    let mut config = ServerConfig::for_testing(service);
    config.api_token = Some(API_TOKEN.to_string());
    let handle = run_server_with_config(config).await.unwrap();
    (handle, identity)
}

fn provider_url(handle: &ServerHandle) -> String {
    format!("{}/api/connection", handle.base_url())
}

/// POST the identity token and return the minted connection token.
async fn issue_token(handle: &ServerHandle) -> String {
    let resp = reqwest::Client::new()
        .post(provider_url(handle))
        .header(reqwest::header::AUTHORIZATION, IDENTITY_TOKEN)
        .send()
        .await
        .expect("POST / failed");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "success");
    body["token"].as_str().expect("token in body").to_string()
}

/// Open the WebSocket upgrade with the connection token as Origin.
async fn connect_ws(
    handle: &ServerHandle,
    token: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://{}/api/connection/connect", handle.local_addr());
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", token.parse().unwrap());
    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .expect("upgrade failed");
    assert_eq!(response.status(), 101);
    stream
}

/// Poll until the predicate holds against GET /:connectionId.
async fn wait_for_record(
    handle: &ServerHandle,
    id: &str,
    predicate: impl Fn(&Value) -> bool,
) -> Value {
    let url = format!("{}/{}", provider_url(handle), id);
    for _ in 0..120 {
        let resp = reqwest::get(&url).await.unwrap();
        if resp.status() == 200 {
            let record: Value = resp.json().await.unwrap();
            if predicate(&record) {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("record {id} never reached the expected state");
}

async fn list_records(handle: &ServerHandle) -> Vec<Value> {
    reqwest::get(provider_url(handle))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// 1. Token issuance creates an issued record
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_issue_token_creates_issued_record() {
    let (handle, _) = start_test_server().await;

    let token = issue_token(&handle).await;
    assert_eq!(token.split('.').count(), 3, "connection token is a JWT");

    let records = list_records(&handle).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["clientId"], "cliX");
    assert_eq!(records[0]["open"], json!(true));
    assert_eq!(records[0]["alive"], json!(false));
    assert_eq!(records[0]["connected"], json!(false));
    assert!(records[0]["tokenId"].is_string());

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Missing Authorization header is a request error
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_issue_token_requires_authorization() {
    let (handle, _) = start_test_server().await;

    let resp = reqwest::Client::new()
        .post(provider_url(&handle))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "requestError");
    assert_eq!(body["reason"], "No token provided.");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Unknown identity token is an authorization error
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_issue_token_rejects_unknown_identity() {
    let (handle, _) = start_test_server().await;

    let resp = reqwest::Client::new()
        .post(provider_url(&handle))
        .header(reqwest::header::AUTHORIZATION, "who-is-this")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "authenticationError");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Happy path: upgrade promotes the record and sends the promotion frame
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upgrade_promotes_record_and_sends_accepted_frame() {
    let (handle, _) = start_test_server().await;
    let token = issue_token(&handle).await;
    let id = list_records(&handle).await[0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let mut stream = connect_ws(&handle, &token).await;

    // promotion frame arrives before anything else
    let frame = stream.next().await.unwrap().unwrap();
    let text = match frame {
        Message::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value, json!({"type": "connection.state", "state": "accepted"}));

    let record = wait_for_record(&handle, &id, |r| r["alive"] == json!(true)).await;
    assert_eq!(record["serverId"], "srvA");
    assert!(record["connected"].is_string(), "connected is an instant now");
    assert!(record.get("timeout").is_none(), "timeout cleared at upgrade");

    // client closes; the record ends closed with a disconnect instant
    drop(stream);
    let record = wait_for_record(&handle, &id, |r| r["open"] == json!(false)).await;
    assert_eq!(record["alive"], json!(false));
    assert!(record["disconnected"].is_string());
    assert!(record.get("tokenId").is_none(), "token record deleted at cleanup");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. A second issuance for a connected client is rejected
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_active_client_rejected() {
    let (handle, _) = start_test_server().await;
    let token = issue_token(&handle).await;
    let id = list_records(&handle).await[0]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let mut stream = connect_ws(&handle, &token).await;
    let _ = stream.next().await; // promotion frame

    let resp = reqwest::Client::new()
        .post(provider_url(&handle))
        .header(reqwest::header::AUTHORIZATION, IDENTITY_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "requestError");
    assert_eq!(
        body["reason"],
        format!("client 'cliX' already has an open connection ('{id}')")
    );

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. A stale issuance is replaced by a fresh one
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_issuance_replaced() {
    let (handle, _) = start_test_server().await;
    issue_token(&handle).await;

    // age the issuance past its window
    let registry = handle.service().registry().clone();
    let mut stale = registry.find_by_client_id("cliX").unwrap();
    stale.timeout = Some(chrono::Utc::now() - chrono::Duration::seconds(120));
    registry.upsert(&stale).unwrap();

    issue_token(&handle).await;
    let records = list_records(&handle).await;
    assert_eq!(records.len(), 1, "stale record was deleted");
    assert_ne!(records[0]["id"].as_str().unwrap(), stale.id.to_string());

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. An invalid connection token closes the socket without any frame
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_connection_token_closes_socket() {
    let (handle, _) = start_test_server().await;

    let mut stream = connect_ws(&handle, "not-a-real-token").await;
    loop {
        match stream.next().await {
            None => break,
            Some(Err(_)) => break,
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    }
    assert!(list_records(&handle).await.is_empty(), "no record mutated");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7b. A connection token authorizes exactly one upgrade, even when raced
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upgrades_admit_single_session() {
    let (handle, _) = start_test_server().await;
    let token = issue_token(&handle).await;

    let mut attempts = Vec::new();
    for _ in 0..2 {
        let url = format!("ws://{}/api/connection/connect", handle.local_addr());
        let token = token.clone();
        attempts.push(tokio::spawn(async move {
            let mut request = url.into_client_request().unwrap();
            request
                .headers_mut()
                .insert("origin", token.parse().unwrap());
            let Ok((mut stream, _)) = tokio_tungstenite::connect_async(request).await else {
                return false;
            };
            // the winner receives the promotion frame; the loser's socket
            // closes without one
            matches!(stream.next().await, Some(Ok(Message::Text(_))))
        }));
    }

    let mut admitted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1, "exactly one upgrade wins the token");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. The send route enforces the connection.send capability
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_route_requires_capability() {
    let (handle, _) = start_test_server().await;
    let url = format!("{}/{}/send", provider_url(&handle), uuid::Uuid::new_v4());

    // no Authorization header at all
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&json!({"type": "demo.ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // wrong token
    let resp = reqwest::Client::new()
        .post(&url)
        .header(reqwest::header::AUTHORIZATION, "wrong")
        .json(&json!({"type": "demo.ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 9. The send route validates its inputs
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_route_validates_request() {
    let (handle, _) = start_test_server().await;
    let client = reqwest::Client::new();

    // bad connection id
    let resp = client
        .post(format!("{}/not-a-uuid/send", provider_url(&handle)))
        .header(reqwest::header::AUTHORIZATION, API_TOKEN)
        .json(&json!({"type": "demo.ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "Invalid connection id.");

    // missing body
    let resp = client
        .post(format!("{}/{}/send", provider_url(&handle), uuid::Uuid::new_v4()))
        .header(reqwest::header::AUTHORIZATION, API_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "No message provided.");

    // body without a type
    let resp = client
        .post(format!("{}/{}/send", provider_url(&handle), uuid::Uuid::new_v4()))
        .header(reqwest::header::AUTHORIZATION, API_TOKEN)
        .json(&json!({"payload": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "Message has no 'type' field.");

    // well-formed but unknown connection: reported, not an HTTP error
    let resp = client
        .post(format!("{}/{}/send", provider_url(&handle), uuid::Uuid::new_v4()))
        .header(reqwest::header::AUTHORIZATION, API_TOKEN)
        .json(&json!({"type": "demo.ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["reason"], "No such connection.");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 10. The send route delivers a frame to the connected client
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_route_delivers_frame() {
    let (handle, _) = start_test_server().await;
    let token = issue_token(&handle).await;
    let id = list_records(&handle).await[0]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let mut stream = connect_ws(&handle, &token).await;
    let _ = stream.next().await; // promotion frame

    let resp = reqwest::Client::new()
        .post(format!("{}/{}/send", provider_url(&handle), id))
        .header(reqwest::header::AUTHORIZATION, API_TOKEN)
        .json(&json!({"type": "demo.ping", "n": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "success");

    let frame = stream.next().await.unwrap().unwrap();
    match frame {
        Message::Text(text) => {
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value, json!({"type": "demo.ping", "n": 1}));
        }
        other => panic!("expected text frame, got {other:?}"),
    }

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 11. Read endpoints: GET / lists records, GET /:id is 204 when absent
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_endpoints() {
    let (handle, _) = start_test_server().await;
    assert!(list_records(&handle).await.is_empty());

    let resp = reqwest::get(format!("{}/{}", provider_url(&handle), uuid::Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    issue_token(&handle).await;
    let records = list_records(&handle).await;
    assert_eq!(records.len(), 1);

    let id = records[0]["id"].as_str().unwrap();
    let resp = reqwest::get(format!("{}/{id}", provider_url(&handle)))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let record: Value = resp.json().await.unwrap();
    assert_eq!(record["id"], records[0]["id"]);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 12. Shutdown closes every live session
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_live_sessions() {
    let (handle, _) = start_test_server().await;
    let token = issue_token(&handle).await;
    let id = list_records(&handle).await[0]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let mut stream = connect_ws(&handle, &token).await;
    let _ = stream.next().await; // promotion frame

    let registry = handle.service().registry().clone();
    handle.shutdown().await;

    // the client observes the close
    loop {
        match stream.next().await {
            None => break,
            Some(Err(_)) => break,
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {}
        }
    }

    let record = registry
        .find_by_id(&id.parse().unwrap())
        .expect("record survives shutdown");
    assert!(!record.open);
    assert!(!record.alive);
    assert_ne!(record.connected, ConnectedAt::NotConnected);
    assert!(record.disconnected.is_some());
}
