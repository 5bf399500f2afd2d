//! Integration tests: drive the full resolve → verify → history → connect
//! sequence against a fake dispatch backend (HTTP + WebSocket on a free port).

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use lib::config::Config;
use lib::host::{NoticeKind, Notifier};
use lib::identity::LaunchContextSource;
use lib::session::{Session, SessionDeps, SessionError, SessionPhase};
use lib::supervisor::{ConnectionState, SupervisorEvent};
use lib::timeline::{parse_server_time, Sender};
use lib::transport::WsTransportFactory;
use lib::verify::VerifyError;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const USER_ID: i64 = 777;

#[derive(Clone)]
struct Backend {
    verify_status: StatusCode,
    history_status: StatusCode,
    history_body: String,
    verify_calls: Arc<AtomicU32>,
    history_calls: Arc<AtomicU32>,
    ws_connects: Arc<AtomicU32>,
    /// Frames received from the client, as raw JSON values.
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl Backend {
    fn new() -> Self {
        Self {
            verify_status: StatusCode::OK,
            history_status: StatusCode::OK,
            history_body: r#"{"messages":[]}"#.to_string(),
            verify_calls: Arc::new(AtomicU32::new(0)),
            history_calls: Arc::new(AtomicU32::new(0)),
            ws_connects: Arc::new(AtomicU32::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn received_of_type(&self, typ: &str) -> Vec<serde_json::Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.get("type").and_then(|t| t.as_str()) == Some(typ))
            .cloned()
            .collect()
    }
}

async fn verify_handler(State(backend): State<Backend>) -> StatusCode {
    backend.verify_calls.fetch_add(1, Ordering::SeqCst);
    backend.verify_status
}

async fn messages_handler(State(backend): State<Backend>) -> (StatusCode, String) {
    backend.history_calls.fetch_add(1, Ordering::SeqCst);
    (backend.history_status, backend.history_body.clone())
}

async fn ws_handler(State(backend): State<Backend>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, backend))
}

/// Fake realtime server: records client frames, pushes one reply right after
/// registration, and acks every chat message.
async fn handle_socket(mut socket: WebSocket, backend: Backend) {
    backend.ws_connects.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        backend.received.lock().unwrap().push(frame.clone());
        match frame.get("type").and_then(|t| t.as_str()) {
            Some("register") => {
                let push = serde_json::json!({
                    "type": "reply",
                    "reply": "C",
                    "currentTime": "2024-01-01 10:00:10"
                });
                let _ = socket.send(WsMessage::Text(push.to_string())).await;
            }
            Some("chat_message") => {
                let content = frame
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default();
                let ack = serde_json::json!({
                    "type": "ack",
                    "success": true,
                    "request": content,
                    "timestamp": "2024-01-01 10:00:20"
                });
                let _ = socket.send(WsMessage::Text(ack.to_string())).await;
            }
            _ => {}
        }
    }
}

/// Bind the fake backend on a free port and return its base URL.
async fn spawn_backend(backend: Backend) -> String {
    let app = Router::new()
        .route("/verify", post(verify_handler))
        .route("/messages", get(messages_handler))
        .route("/ws", get(ws_handler))
        .with_state(backend);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

struct RecordingNotifier {
    notices: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            notices: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _kind: NoticeKind, message: &str) {
        self.notices.lock().unwrap().push(message.to_string());
    }

    async fn close_app(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn deps(base_url: &str, notifier: Arc<RecordingNotifier>) -> SessionDeps {
    let mut config = Config::default();
    config.backend.base_url = base_url.to_string();
    // Keep failing tests fast.
    config.connection.connect_timeout_secs = 2;
    config.connection.backoff_initial_ms = 10;
    config.connection.backoff_cap_ms = 50;
    config.connection.server_drop_delay_ms = 10;
    let context = format!(r#"{{"user":{{"id":{},"username":"bigrig"}}}}"#, USER_ID);
    SessionDeps {
        config,
        identity: Arc::new(LaunchContextSource::new(Some(context))),
        transports: Arc::new(WsTransportFactory),
        notifier,
    }
}

/// Wait until the fake backend has recorded at least `count` frames of `typ`.
/// Frames are recorded by the backend task asynchronously after the client
/// flips to Connected, so this bridges that scheduling gap without relaxing the
/// caller's exact-count assertion (a frame that is never sent still times out).
async fn wait_for_frames(backend: &Backend, typ: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.received_of_type(typ).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backend never recorded expected frames");
}

async fn wait_connected(session: &Session) {
    let mut rx = session.connection().expect("supervisor running");
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("never connected")
    .expect("state channel closed");
}

#[tokio::test]
async fn full_session_flow_merges_history_and_push() {
    let mut backend = Backend::new();
    backend.history_body = r#"{"messages":[{
        "content": "A",
        "created_at": "2024-01-01 10:00:00",
        "replies": [{"reply_content": "B", "reply_at": "2024-01-01 10:00:05"}]
    }]}"#
        .to_string();
    let base_url = spawn_backend(backend.clone()).await;

    let notifier = Arc::new(RecordingNotifier::new());
    let mut session = Session::new(deps(&base_url, notifier)).expect("identity resolves");
    session.start().await.expect("start succeeds");
    assert!(session.degraded().is_empty());
    wait_connected(&session).await;

    let mut events = session.take_events().expect("event stream");
    // The fake backend pushes "C" right after registration.
    let pushed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(SupervisorEvent::ReplyPushed(m)) => break m,
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
    })
    .await
    .expect("no pushed reply");
    assert_eq!(pushed.text, "C");

    // History (driver A, dispatcher B) and the push (C) interleave by time.
    let snapshot = session.snapshot().await;
    let view: Vec<(&str, Sender)> = snapshot
        .messages()
        .iter()
        .map(|m| (m.text.as_str(), m.sender))
        .collect();
    assert_eq!(
        view,
        [
            ("A", Sender::Driver),
            ("B", Sender::Dispatcher),
            ("C", Sender::Dispatcher),
        ]
    );
    assert_eq!(
        snapshot.messages()[0].timestamp,
        parse_server_time("2024-01-01 10:00:00").unwrap()
    );
    assert_eq!(
        snapshot.messages()[1].timestamp,
        parse_server_time("2024-01-01 10:00:05").unwrap()
    );

    // Sending while online appends the optimistic message and reaches the
    // backend, which acks it.
    let sent = session.send_message("On my way").await.expect("send works");
    assert_eq!(sent.sender, Sender::Driver);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(SupervisorEvent::SendAcked { success: true, .. }) => break,
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
    })
    .await
    .expect("no ack");
    let chats = backend.received_of_type("chat_message");
    assert_eq!(chats.len(), 1);
    assert_eq!(
        chats[0].get("content").and_then(|c| c.as_str()),
        Some("On my way")
    );
    assert_eq!(
        chats[0].get("userId").and_then(|u| u.as_i64()),
        Some(USER_ID)
    );
    // Exactly one registration for the single successful connect.
    assert_eq!(backend.received_of_type("register").len(), 1);
    assert_eq!(session.snapshot().await.len(), 4);

    session.shutdown().await;
}

#[tokio::test]
async fn unauthorized_verification_is_fatal_and_short_circuits() {
    let mut backend = Backend::new();
    backend.verify_status = StatusCode::FORBIDDEN;
    let base_url = spawn_backend(backend.clone()).await;

    let notifier = Arc::new(RecordingNotifier::new());
    let closed = notifier.closed.clone();
    let mut session = Session::new(deps(&base_url, notifier)).expect("identity resolves");
    let err = session.start().await.err().expect("start must fail");
    assert!(matches!(
        err,
        SessionError::Verification(VerifyError::Unauthorized(_))
    ));

    // Never proceeds to history load or connect; the host is told to close.
    assert_eq!(backend.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.history_calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.ws_connects.load(Ordering::SeqCst), 0);
    assert!(closed.load(Ordering::SeqCst));
    assert!(matches!(
        *session.phase().borrow(),
        SessionPhase::Fatal(_)
    ));
    assert!(session.connection().is_none());
}

#[tokio::test]
async fn history_failure_degrades_but_still_connects() {
    let mut backend = Backend::new();
    backend.history_status = StatusCode::INTERNAL_SERVER_ERROR;
    let base_url = spawn_backend(backend.clone()).await;

    let notifier = Arc::new(RecordingNotifier::new());
    let notices = notifier.notices.clone();
    let mut session = Session::new(deps(&base_url, notifier)).expect("identity resolves");
    session.start().await.expect("history failure is not fatal");

    // Degraded, user-visible, empty history; the connection still comes up.
    assert!(!session.degraded().is_empty());
    assert!(!notices.lock().unwrap().is_empty());
    wait_connected(&session).await;
    assert!(session.snapshot().await.is_empty());

    session.shutdown().await;
}

#[tokio::test]
async fn explicit_retry_reruns_verification_and_reconnects() {
    let backend = Backend::new();
    let base_url = spawn_backend(backend.clone()).await;

    let notifier = Arc::new(RecordingNotifier::new());
    let mut session = Session::new(deps(&base_url, notifier)).expect("identity resolves");
    session.start().await.expect("start succeeds");
    wait_connected(&session).await;
    assert_eq!(backend.verify_calls.load(Ordering::SeqCst), 1);

    session.retry().await.expect("retry succeeds");
    wait_connected(&session).await;
    // Retry re-runs every step after identity resolution.
    assert_eq!(backend.verify_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backend.ws_connects.load(Ordering::SeqCst), 2);
    wait_for_frames(&backend, "register", 2).await;
    assert_eq!(backend.received_of_type("register").len(), 2);

    session.shutdown().await;
}
