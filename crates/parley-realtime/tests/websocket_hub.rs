//! End-to-end tests against an in-process WebSocket hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use parley_core::events::{HubEvent, PresenceChanged};
use parley_core::ids::UserId;
use parley_core::presence::PresenceStatus;
use parley_realtime::connection::{AuthFailure, ConnectionError, ConnectionState};
use parley_realtime::testing::{FakeApi, StaticTokenProvider};
use parley_realtime::{ParleyError, RealtimeSession};
use parley_settings::{ParleySettings, TransportKind};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Test hub ──

/// Accepts WebSocket upgrades carrying `Bearer <valid_token>` and hands each
/// accepted connection to the test.
struct TestHub {
    url: String,
    connections: mpsc::UnboundedReceiver<HubConnection>,
    rejected: Arc<AtomicUsize>,
}

struct HubConnection {
    ws: WebSocketStream<TcpStream>,
}

impl TestHub {
    async fn start(valid_token: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        let rejected = Arc::new(AtomicUsize::new(0));
        let rejected_count = Arc::clone(&rejected);

        let _accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let rejected = Arc::clone(&rejected_count);
                let _conn = tokio::spawn(async move {
                    let check = |request: &Request, response: Response| {
                        let expected = format!("Bearer {valid_token}");
                        let authorized = request
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .is_some_and(|v| v == expected);
                        if authorized {
                            Ok(response)
                        } else {
                            let mut denied = ErrorResponse::new(Some("unauthorized".into()));
                            *denied.status_mut() = StatusCode::UNAUTHORIZED;
                            Err(denied)
                        }
                    };
                    match accept_hdr_async(stream, check).await {
                        Ok(ws) => {
                            let _ = tx.send(HubConnection { ws });
                        }
                        Err(_) => {
                            let _ = rejected.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}/hub"),
            connections,
            rejected,
        }
    }

    async fn next_connection(&mut self) -> HubConnection {
        timeout(TIMEOUT, self.connections.recv())
            .await
            .expect("no client connected in time")
            .expect("hub stopped")
    }

    fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

impl HubConnection {
    async fn push(&mut self, event: &HubEvent) {
        let frame = event.to_frame().unwrap();
        self.ws.send(Message::Text(frame.into())).await.unwrap();
    }

    async fn next_frame(&mut self) -> Value {
        loop {
            match timeout(TIMEOUT, self.ws.next()).await.expect("no frame in time") {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => {}
                other => panic!("hub connection ended: {other:?}"),
            }
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn settings(hub: &TestHub) -> ParleySettings {
    let mut settings = ParleySettings::default();
    settings.hub.url.clone_from(&hub.url);
    settings.hub.transports = vec![TransportKind::WebSocket];
    settings.reconnect.base_delay_ms = 10;
    settings.reconnect.max_delay_ms = 50;
    settings.reconnect.jitter_factor = 0.0;
    settings.presence.coalesce_window_ms = 5;
    settings
}

fn session(hub: &TestHub, api: &Arc<FakeApi>, token: &str) -> RealtimeSession {
    RealtimeSession::builder(settings(hub), api.clone(), Arc::new(StaticTokenProvider::new(token)))
        .with_local_user("me")
        .build()
}

// ── Tests ──

#[tokio::test]
async fn events_flow_both_ways() {
    let mut hub = TestHub::start("good").await;
    let api = FakeApi::new();
    let session = session(&hub, &api, "good");

    timeout(TIMEOUT, session.start()).await.unwrap().unwrap();
    let mut conn = hub.next_connection().await;

    let mut alice = session.presence().subscribe(&UserId::new("alice"));
    assert_eq!(
        conn.next_frame().await,
        json!({"event": "subscribe-to-presence", "data": {"userIds": ["alice"]}})
    );

    conn.push(&HubEvent::PresenceChanged(PresenceChanged {
        user_id: UserId::new("alice"),
        status: PresenceStatus::Online,
        at: None,
    }))
    .await;
    timeout(TIMEOUT, alice.wait_for(|s| *s == PresenceStatus::Online))
        .await
        .unwrap()
        .unwrap();

    session.shutdown().await;
}

#[tokio::test]
async fn rejected_token_fails_without_retrying_it() {
    let hub = TestHub::start("good").await;
    let api = FakeApi::new();
    let session = session(&hub, &api, "stale");

    let err = timeout(TIMEOUT, session.start()).await.unwrap().unwrap_err();
    assert_matches!(
        err,
        ParleyError::Connection(ConnectionError::Auth(AuthFailure::TokenNotRefreshed))
    );
    assert_eq!(session.connection().state(), ConnectionState::Failed);

    // The hub counts the rejection after writing the 401.
    timeout(TIMEOUT, async {
        while hub.rejected() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(hub.rejected(), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn hub_drop_reconnects_and_resyncs() {
    let mut hub = TestHub::start("good").await;
    let api = FakeApi::new();
    let session = session(&hub, &api, "good");
    let mut reports = session.subscribe_resync();

    timeout(TIMEOUT, session.start()).await.unwrap().unwrap();
    let first = hub.next_connection().await;
    first.close().await;

    let _second = hub.next_connection().await;
    let report = timeout(TIMEOUT, reports.recv()).await.unwrap().unwrap();
    assert_eq!(report.epoch, 2);
    assert!(report.is_complete());
    assert_eq!(session.connection().info().epoch, 2);

    session.shutdown().await;
}
