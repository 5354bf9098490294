//! End-to-end tests against a live server.
//!
//! Each test binds a server on a random port, signs users in over HTTP and
//! talks to the hubs through real WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use argon2::Params;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lobby_server::config::Config;
use lobby_server::credentials::CredentialStore;
use lobby_server::hub::chat::ChatHubConfig;
use lobby_server::hub::{BoardHub, ChatHub};
use lobby_server::password::Argon2Scheme;
use lobby_server::routes::{create_router, AppState};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a client waits for an expected frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client waits before concluding nothing more is coming.
const QUIET_PERIOD: Duration = Duration::from_millis(200);

// ============================================================================
// Test Helpers
// ============================================================================

async fn test_state() -> AppState {
    let cheap = Params::new(8, 1, 1, None).unwrap();
    AppState::with_components(
        Config::default(),
        CredentialStore::in_memory(),
        ChatHub::spawn(None, ChatHubConfig::default()).await,
        BoardHub::spawn(),
        Arc::new(Argon2Scheme::with_params(cheap)),
    )
}

/// Spawns a server on a random port.
async fn spawn_server() -> (SocketAddr, AppState) {
    let state = test_state().await;
    let app = create_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, state)
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .unwrap()
}

/// Registers `username` through the ticket flow and returns the session token.
async fn register(addr: SocketAddr, username: &str) -> String {
    let client = http_client();

    let page = client
        .get(format!("http://{addr}/register"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let marker = r#"name="reg_token" value=""#;
    let start = page.find(marker).unwrap() + marker.len();
    let ticket = &page[start..start + page[start..].find('"').unwrap()];

    let response = client
        .post(format!("http://{addr}/register"))
        .form(&[
            ("username", username),
            ("password", "secret1"),
            ("reg_token", ticket),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
    cookie
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("session="))
        .unwrap()
        .to_string()
}

async fn connect(addr: SocketAddr, path: &str, token: &str) -> Ws {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(COOKIE, format!("session={token}").parse().unwrap());
    let (ws, _) = assert_ok!(connect_async(request).await);
    ws
}

/// Next text frame as JSON.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(FRAME_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Asserts no text frame arrives within the quiet period.
async fn assert_quiet(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(QUIET_PERIOD, ws.next()).await {
        panic!("unexpected frame: {text}");
    }
}

async fn say(ws: &mut Ws, text: &str) {
    let frame = json!({ "message": text }).to_string();
    assert_ok!(ws.send(Message::Text(frame.into())).await);
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn late_joiner_gets_history_then_live_messages() {
    let (addr, _state) = spawn_server().await;
    let alice_token = register(addr, "alice").await;
    let bob_token = register(addr, "bob").await;

    let mut alice = connect(addr, "/ws/chat", &alice_token).await;
    say(&mut alice, "M1").await;
    say(&mut alice, "M2").await;
    assert_eq!(next_json(&mut alice).await["message"], "M1");
    assert_eq!(next_json(&mut alice).await["message"], "M2");

    let mut bob = connect(addr, "/ws/chat", &bob_token).await;
    let first = next_json(&mut bob).await;
    let second = next_json(&mut bob).await;
    assert_eq!(first["message"], "M1");
    assert_eq!(second["message"], "M2");
    assert_eq!(first["username"], "alice");

    say(&mut bob, "M3").await;
    for ws in [&mut alice, &mut bob] {
        let m3 = next_json(ws).await;
        assert_eq!(m3["message"], "M3");
        assert_eq!(m3["username"], "bob");
        assert!(m3.get("account_token").is_none());
        assert!(!m3.to_string().contains(&bob_token));
    }

    assert_quiet(&mut alice).await;
}

#[tokio::test]
async fn client_supplied_username_is_overridden() {
    let (addr, _state) = spawn_server().await;
    let token = register(addr, "alice").await;
    let mut ws = connect(addr, "/ws/chat", &token).await;

    let forged = json!({ "username": "admin", "message": "hi" }).to_string();
    assert_ok!(ws.send(Message::Text(forged.into())).await);

    let received = next_json(&mut ws).await;
    assert_eq!(received["username"], "alice");
    assert_eq!(received["message"], "hi");
}

#[tokio::test]
async fn malformed_frame_gets_error_reply_and_empty_is_ignored() {
    let (addr, _state) = spawn_server().await;
    let alice_token = register(addr, "alice").await;
    let bob_token = register(addr, "bob").await;
    let mut alice = connect(addr, "/ws/chat", &alice_token).await;
    let mut bob = connect(addr, "/ws/chat", &bob_token).await;

    assert_ok!(alice.send(Message::Text("not json".into())).await);
    assert_eq!(
        next_json(&mut alice).await,
        json!({"error": "malformed chat message"})
    );

    say(&mut alice, "   ").await;
    say(&mut alice, "real").await;

    assert_eq!(next_json(&mut alice).await["message"], "real");
    assert_eq!(next_json(&mut bob).await["message"], "real");
    assert_quiet(&mut alice).await;
    assert_quiet(&mut bob).await;
}

#[tokio::test]
async fn websocket_requires_session() {
    let (addr, _state) = spawn_server().await;

    let err = connect_async(format!("ws://{addr}/ws/chat"))
        .await
        .expect_err("upgrade should be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn disconnect_unregisters_connection() {
    let (addr, state) = spawn_server().await;
    let token = register(addr, "alice").await;

    let mut ws = connect(addr, "/ws/chat", &token).await;
    say(&mut ws, "ping").await;
    next_json(&mut ws).await;
    assert_eq!(state.chat.connection_count().await.unwrap(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let mut count = 1;
    for _ in 0..50 {
        count = state.chat.connection_count().await.unwrap();
        if count == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(count, 0);
}

#[tokio::test]
async fn history_endpoint_matches_replay() {
    let (addr, _state) = spawn_server().await;
    let token = register(addr, "alice").await;
    let mut ws = connect(addr, "/ws/chat", &token).await;
    say(&mut ws, "one").await;
    say(&mut ws, "two").await;
    next_json(&mut ws).await;
    next_json(&mut ws).await;

    let history: Value = http_client()
        .get(format!("http://{addr}/chat/history"))
        .header(COOKIE, format!("session={token}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let texts: Vec<_> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["one", "two"]);
}

// ============================================================================
// Board
// ============================================================================

#[tokio::test]
async fn moves_are_broadcast_to_board_viewers() {
    let (addr, _state) = spawn_server().await;
    let alice_token = register(addr, "alice").await;
    let bob_token = register(addr, "bob").await;

    let mut alice = connect(addr, "/ws/board", &alice_token).await;
    let mut bob = connect(addr, "/ws/board", &bob_token).await;

    for ws in [&mut alice, &mut bob] {
        let initial = next_json(ws).await;
        assert_eq!(initial["turn"], "black");
        assert_eq!(initial["board"][3][3], "white");
        assert_eq!(initial["board"][3][4], "black");
    }

    let response = http_client()
        .post(format!("http://{addr}/move"))
        .header(COOKIE, format!("session={alice_token}"))
        .json(&json!({ "row": 2, "col": 3, "player": "black" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    for ws in [&mut alice, &mut bob] {
        let update = next_json(ws).await;
        assert_eq!(update["turn"], "white");
        assert_eq!(update["board"][2][3], "black");
    }
}

#[tokio::test]
async fn rejected_move_is_not_broadcast() {
    let (addr, _state) = spawn_server().await;
    let token = register(addr, "alice").await;
    let mut viewer = connect(addr, "/ws/board", &token).await;
    next_json(&mut viewer).await;

    let response = http_client()
        .post(format!("http://{addr}/move"))
        .header(COOKIE, format!("session={token}"))
        .json(&json!({ "row": 8, "col": 0, "player": "black" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_quiet(&mut viewer).await;
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn health_counts_live_sockets() {
    let (addr, _state) = spawn_server().await;
    let token = register(addr, "alice").await;
    let mut chat = connect(addr, "/ws/chat", &token).await;
    let mut board = connect(addr, "/ws/board", &token).await;
    next_json(&mut board).await;
    say(&mut chat, "hello").await;
    next_json(&mut chat).await;

    let health: Value = http_client()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 2);
}
