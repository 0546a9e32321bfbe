//! Integration-Tests für den HttpSignalClient gegen einen lokalen
//! Relay-Server (axum): Subscribe, Send, Leave, Reconnect, ICE-Config.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use room_call::{HttpSignalClient, SignalEnvelope, SignalKind, SignalTransport, SignalingError};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

// ============================================================================
// TEST SERVER
// ============================================================================

#[derive(Clone)]
struct ServerState {
    events: broadcast::Sender<SignalEnvelope>,
    received: Arc<Mutex<Vec<SignalEnvelope>>>,
    leaves: Arc<AtomicUsize>,
}

impl ServerState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events,
            received: Arc::new(Mutex::new(Vec::new())),
            leaves: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wartet, bis mindestens ein SSE-Abonnent verbunden ist
    async fn wait_for_subscriber(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.events.receiver_count() > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }
}

async fn subscribe_handler(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|envelope| {
        envelope.ok().map(|envelope| {
            Ok(Event::default()
                .event("signal")
                .json_data(&envelope)
                .expect("serialize envelope"))
        })
    });
    Sse::new(stream)
}

async fn signal_handler(
    State(state): State<ServerState>,
    Json(envelope): Json<SignalEnvelope>,
) -> StatusCode {
    state.received.lock().push(envelope);
    StatusCode::OK
}

async fn leave_handler(State(state): State<ServerState>) -> StatusCode {
    state.leaves.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn ice_config_handler() -> Json<serde_json::Value> {
    Json(json!({
        "data": {
            "iceServers": [
                { "urls": ["stun:stun.test:3478"] },
                { "urls": "turn:turn.test", "username": "u", "credential": "c" }
            ]
        }
    }))
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/rtc/signal/subscribe", get(subscribe_handler))
        .route("/rtc/signal", post(signal_handler))
        .route("/rtc/signal/leave", delete(leave_handler))
        .route("/rtc/ice-config", get(ice_config_handler))
        .with_state(state)
}

async fn spawn_server(state: ServerState, port: u16) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind test server");
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.expect("serve");
    });
}

fn test_client(port: u16) -> HttpSignalClient {
    HttpSignalClient::new(
        format!("http://127.0.0.1:{}/rtc", port),
        "room1",
        "p1",
        Some("tkn".to_string()),
    )
    .expect("client")
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn subscribe_receives_pushed_signals() {
    let state = ServerState::new();
    let port = portpicker::pick_unused_port().expect("no free port");
    spawn_server(state.clone(), port).await;

    let client = test_client(port);
    let mut rx = client.subscribe().await.expect("subscribe");

    assert!(state.wait_for_subscriber(Duration::from_secs(5)).await);
    state
        .events
        .send(SignalEnvelope::new(
            SignalKind::Presence,
            "room1",
            "p2",
            None,
            json!({"action": "join"}),
        ))
        .expect("push");

    let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("stream ended");
    assert_eq!(envelope.kind, SignalKind::Presence);
    assert_eq!(envelope.sender_id, "p2");
}

#[tokio::test]
async fn send_posts_envelope_to_server() {
    let state = ServerState::new();
    let port = portpicker::pick_unused_port().expect("no free port");
    spawn_server(state.clone(), port).await;

    let client = test_client(port);
    client
        .send(SignalEnvelope::new(
            SignalKind::Candidate,
            "room1",
            "p1",
            Some("p2".to_string()),
            json!({"candidate": "cand", "sdpMid": "0"}),
        ))
        .await
        .expect("send");

    let received = state.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, SignalKind::Candidate);
    assert_eq!(received[0].room_id, "room1");
    assert_eq!(received[0].target_id.as_deref(), Some("p2"));
}

#[tokio::test]
async fn leave_notifies_server_and_closes_transport() {
    let state = ServerState::new();
    let port = portpicker::pick_unused_port().expect("no free port");
    spawn_server(state.clone(), port).await;

    let client = test_client(port);
    client.leave().await.expect("leave");
    assert_eq!(state.leaves.load(Ordering::SeqCst), 1);

    // Nach leave ist der Transport zu
    let result = client
        .send(SignalEnvelope::new(
            SignalKind::Leave,
            "room1",
            "p1",
            None,
            json!({}),
        ))
        .await;
    assert!(matches!(result, Err(SignalingError::Closed)));
    assert!(matches!(
        client.subscribe().await,
        Err(SignalingError::Closed)
    ));
}

#[tokio::test]
async fn subscribe_reconnects_when_server_comes_up() {
    // Client abonniert, bevor der Server überhaupt läuft; der erste
    // Versuch schlägt fehl und die Backoff-Schleife verbindet später
    let state = ServerState::new();
    let port = portpicker::pick_unused_port().expect("no free port");

    let client = test_client(port);
    let mut rx = client.subscribe().await.expect("subscribe");

    tokio::time::sleep(Duration::from_millis(200)).await;
    spawn_server(state.clone(), port).await;

    // Erster Retry nach 1s, danach verdoppelnd
    assert!(
        state.wait_for_subscriber(Duration::from_secs(10)).await,
        "stream never reconnected"
    );
    state
        .events
        .send(SignalEnvelope::new(
            SignalKind::Presence,
            "room1",
            "p2",
            None,
            json!({"action": "join"}),
        ))
        .expect("push");

    let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("stream ended");
    assert_eq!(envelope.sender_id, "p2");
}

#[tokio::test]
async fn fetch_ice_config_parses_server_response() {
    let state = ServerState::new();
    let port = portpicker::pick_unused_port().expect("no free port");
    spawn_server(state, port).await;

    let client = test_client(port);
    let servers = client.fetch_ice_config().await.expect("ice config");

    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].urls, vec!["stun:stun.test:3478"]);
    assert_eq!(servers[1].urls, vec!["turn:turn.test"]);
    assert_eq!(servers[1].username, "u");
    assert_eq!(servers[1].credential, "c");
}
