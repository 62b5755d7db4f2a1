//! Connection loop.
//!
//! One [`ConnectionManager`] owns at most one running loop. The loop fetches
//! a token, negotiates a transport, pumps frames into the
//! [`EventRouter`], and on failure backs off and tries again until it is
//! cancelled or credentials are exhausted.
//!
//! All state writes from the loop happen under the `conn` lock after
//! checking the loop's cancellation token, and `disconnect` cancels under the
//! same lock, so a stopped loop can never overwrite a newer state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use parley_api::{AuthToken, TokenProvider};
use parley_core::events::{EventKind, OutboundEvent};
use parley_core::ids::ConnectionId;
use parley_core::retry::Backoff;
use parley_settings::{HubSettings, ReconnectSettings, TransportKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HubSender;
use super::long_polling::LongPollingTransport;
use super::state::{AuthFailure, ConnectionError, ConnectionInfo, ConnectionState, StateTransition};
use super::transport::{Link, Transport, TransportError};
use super::websocket::WebSocketTransport;
use crate::router::{EventHandler, EventRouter, HandlerId};

const STATE_CHANNEL_CAPACITY: usize = 64;

/// Latest outcome of a loop: `None` until the first attempt resolves, then
/// `Ok` while a link is open and the last error while it is not.
type Outcome = Option<Result<(), ConnectionError>>;

/// Build the configured transports, in preference order.
#[must_use]
pub fn transports_for(hub: &HubSettings) -> Vec<Arc<dyn Transport>> {
    hub.transports
        .iter()
        .map(|kind| -> Arc<dyn Transport> {
            match kind {
                TransportKind::WebSocket => Arc::new(WebSocketTransport::new(hub)),
                TransportKind::LongPolling => Arc::new(LongPollingTransport::new(hub)),
            }
        })
        .collect()
}

/// Owns the hub connection for one session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    reconnect: ReconnectSettings,
    transports: Vec<Arc<dyn Transport>>,
    router: Arc<EventRouter>,
    conn: Mutex<Conn>,
    transitions: broadcast::Sender<StateTransition>,
    foreground: watch::Sender<bool>,
}

#[derive(Default)]
struct Conn {
    state: ConnectionState,
    transport: Option<TransportKind>,
    connection_id: Option<ConnectionId>,
    last_connected_at: Option<DateTime<Utc>>,
    attempts: u32,
    degraded: bool,
    epoch: u64,
    last_error: Option<ConnectionError>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    running: Option<RunningLoop>,
}

struct RunningLoop {
    cancel: CancellationToken,
    outcome: watch::Receiver<Outcome>,
}

impl ConnectionManager {
    /// Manager using the transports configured in `hub`.
    #[must_use]
    pub fn new(hub: &HubSettings, reconnect: &ReconnectSettings, router: Arc<EventRouter>) -> Self {
        Self::with_transports(reconnect, router, transports_for(hub))
    }

    /// Manager with explicit transports, tried in order.
    #[must_use]
    pub fn with_transports(
        reconnect: &ReconnectSettings,
        router: Arc<EventRouter>,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (foreground, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                reconnect: reconnect.clone(),
                transports,
                router,
                conn: Mutex::new(Conn::default()),
                transitions,
                foreground,
            }),
        }
    }

    /// Start the connection loop, or join the one already running.
    ///
    /// A new loop resolves with its first attempt: `Ok` once connected, the
    /// transport error if that attempt failed (the loop keeps retrying in the
    /// background), or [`ConnectionError::Auth`] if credentials were
    /// exhausted. Joining a running loop resolves with its current outcome,
    /// so a caller that joins after a recovery sees `Ok`.
    pub async fn connect(&self, tokens: Arc<dyn TokenProvider>) -> Result<(), ConnectionError> {
        let mut outcome = self.start_or_join(tokens);
        outcome
            .wait_for(Option::is_some)
            .await
            .map(|current| current.clone())
            .ok()
            .flatten()
            .unwrap_or(Err(ConnectionError::Stopped))
    }

    fn start_or_join(&self, tokens: Arc<dyn TokenProvider>) -> watch::Receiver<Outcome> {
        let mut conn = self.inner.conn.lock();
        if conn.state.is_active() {
            if let Some(running) = &conn.running {
                debug!(state = %conn.state, "joining running connection loop");
                return running.outcome.clone();
            }
        }

        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        conn.running = Some(RunningLoop {
            cancel: cancel.clone(),
            outcome: outcome_rx.clone(),
        });
        conn.last_error = None;
        conn.attempts = 0;
        conn.degraded = false;
        self.inner.set_state(&mut conn, ConnectionState::Connecting);
        drop(conn);

        let _ = tokio::spawn(run_loop(Arc::clone(&self.inner), tokens, cancel, outcome_tx));
        outcome_rx
    }

    /// Stop the loop and close the link. Takes effect before returning.
    pub fn disconnect(&self) {
        let mut conn = self.inner.conn.lock();
        if let Some(running) = conn.running.take() {
            running.cancel.cancel();
        }
        conn.outbound = None;
        conn.transport = None;
        conn.connection_id = None;
        if conn.state != ConnectionState::Disconnected {
            info!("disconnecting from hub");
            gauge!("hub_connected").set(0.0);
            self.inner.set_state(&mut conn, ConnectionState::Disconnected);
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.conn.lock().state
    }

    /// Snapshot for UIs and diagnostics.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        let conn = self.inner.conn.lock();
        ConnectionInfo {
            state: conn.state,
            transport: conn.transport,
            connection_id: conn.connection_id.clone(),
            last_connected_at: conn.last_connected_at,
            attempts: conn.attempts,
            degraded: conn.degraded,
            epoch: conn.epoch,
            foreground: *self.inner.foreground.borrow(),
        }
    }

    /// Error that last moved the loop out of `Connected`/`Connecting`, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.conn.lock().last_error.clone()
    }

    /// Stream of state transitions from now on.
    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.transitions.subscribe()
    }

    /// Queue an outbound frame on the open link.
    pub fn send(&self, event: OutboundEvent) -> Result<(), ConnectionError> {
        let frame = event
            .to_frame()
            .map_err(|e| ConnectionError::Encode(e.to_string()))?;
        let conn = self.inner.conn.lock();
        let outbound = conn.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(frame)
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Register a handler for inbound events of `kind`.
    pub fn on_event(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.inner.router.register(kind, handler)
    }

    /// The router inbound frames are handed to.
    #[must_use]
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }

    /// Tell the loop whether the client is in the foreground. Reconnect
    /// attempts are parked while backgrounded; an open link is kept.
    pub fn set_foreground(&self, foreground: bool) {
        let previous = self.inner.foreground.send_replace(foreground);
        if previous != foreground {
            debug!(foreground, "foreground changed");
        }
    }
}

impl HubSender for ConnectionManager {
    fn send(&self, event: OutboundEvent) -> Result<(), ConnectionError> {
        ConnectionManager::send(self, event)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("info", &self.info())
            .field("transports", &self.inner.transports.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop-side state updates
// ─────────────────────────────────────────────────────────────────────────────

impl Inner {
    fn set_state(&self, conn: &mut Conn, to: ConnectionState) {
        let from = conn.state;
        if from == to {
            return;
        }
        conn.state = to;
        debug!(%from, %to, epoch = conn.epoch, "connection state changed");
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            at: Utc::now(),
            epoch: conn.epoch,
        });
    }

    /// Run `f` under the lock unless the loop owning `cancel` was stopped.
    fn with_live<R>(&self, cancel: &CancellationToken, f: impl FnOnce(&mut Conn) -> R) -> Option<R> {
        let mut conn = self.conn.lock();
        if cancel.is_cancelled() {
            return None;
        }
        Some(f(&mut conn))
    }

    fn mark_connected(
        &self,
        cancel: &CancellationToken,
        kind: TransportKind,
    ) -> Option<mpsc::UnboundedReceiver<String>> {
        self.with_live(cancel, |conn| {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = ConnectionId::generate();
            conn.epoch += 1;
            info!(transport = %kind, connection_id = %id, epoch = conn.epoch, "connected to hub");
            conn.outbound = Some(tx);
            conn.transport = Some(kind);
            conn.connection_id = Some(id);
            conn.last_connected_at = Some(Utc::now());
            conn.attempts = 0;
            conn.degraded = false;
            conn.last_error = None;
            gauge!("hub_connected").set(1.0);
            self.set_state(conn, ConnectionState::Connected);
            rx
        })
    }

    fn mark_lost(&self, cancel: &CancellationToken, error: TransportError) -> bool {
        self.with_live(cancel, |conn| {
            conn.outbound = None;
            conn.transport = None;
            conn.connection_id = None;
            conn.last_error = Some(ConnectionError::Transport(error));
            gauge!("hub_connected").set(0.0);
            self.set_state(conn, ConnectionState::Reconnecting);
        })
        .is_some()
    }

    /// Record a failed attempt. Returns the consecutive failure count.
    fn mark_attempt_failed(&self, cancel: &CancellationToken, error: TransportError) -> Option<u32> {
        self.with_live(cancel, |conn| {
            conn.attempts = conn.attempts.saturating_add(1);
            if conn.attempts >= self.reconnect.degraded_after_attempts && !conn.degraded {
                warn!(attempts = conn.attempts, "hub connection degraded");
                conn.degraded = true;
            }
            conn.last_error = Some(ConnectionError::Transport(error));
            counter!("hub_reconnect_attempts_total").increment(1);
            self.set_state(conn, ConnectionState::Reconnecting);
            conn.attempts
        })
    }

    fn fail(&self, cancel: &CancellationToken, outcome: &watch::Sender<Outcome>, failure: AuthFailure) {
        let error = ConnectionError::Auth(failure);
        let live = self.with_live(cancel, |conn| {
            warn!(%error, "hub connection failed");
            conn.outbound = None;
            conn.transport = None;
            conn.connection_id = None;
            conn.last_error = Some(error.clone());
            conn.running = None;
            gauge!("hub_connected").set(0.0);
            self.set_state(conn, ConnectionState::Failed);
        });
        if live.is_some() {
            publish(outcome, Err(error));
        }
    }

    /// Try each transport in order. Auth rejection stops negotiation.
    async fn negotiate(
        &self,
        token: &AuthToken,
    ) -> Result<(Box<dyn Link>, TransportKind), TransportError> {
        let mut last = TransportError::Connect("no transports configured".into());
        for transport in &self.transports {
            let kind = transport.kind();
            match transport.open(token).await {
                Ok(link) => return Ok((link, kind)),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    debug!(transport = %kind, error = %e, "transport failed, trying next");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

fn publish(outcome: &watch::Sender<Outcome>, result: Result<(), ConnectionError>) {
    let _ = outcome.send_replace(Some(result));
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_loop(
    inner: Arc<Inner>,
    tokens: Arc<dyn TokenProvider>,
    cancel: CancellationToken,
    outcome: watch::Sender<Outcome>,
) {
    let mut backoff = Backoff::new(inner.reconnect.backoff());
    let mut foreground = inner.foreground.subscribe();
    // Token the hub rejected on the previous attempt.
    let mut rejected: Option<AuthToken> = None;

    loop {
        if !*foreground.borrow_and_update() {
            debug!("client in background, parking connection loop");
            let resumed = tokio::select! {
                () = cancel.cancelled() => return,
                woke = foreground.wait_for(|fg| *fg) => woke.is_ok(),
            };
            if !resumed {
                return;
            }
        }

        let fetched = tokio::select! {
            () = cancel.cancelled() => return,
            fetched = tokens.token(rejected.is_some()) => fetched,
        };
        let token = match fetched {
            Ok(token) if rejected.as_ref() == Some(&token) => {
                inner.fail(&cancel, &outcome, AuthFailure::TokenNotRefreshed);
                return;
            }
            Ok(token) => token,
            Err(e) => {
                inner.fail(&cancel, &outcome, AuthFailure::Provider(e));
                return;
            }
        };

        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            opened = inner.negotiate(&token) => opened,
        };

        match opened {
            Ok((mut link, kind)) => {
                backoff.reset();
                rejected = None;
                let Some(outbound) = inner.mark_connected(&cancel, kind) else {
                    link.close().await;
                    return;
                };
                publish(&outcome, Ok(()));

                match pump(&inner.router, link, outbound, &cancel).await {
                    LinkEnd::Cancelled => return,
                    LinkEnd::AuthRejected(e) => {
                        warn!(error = %e, "hub revoked credentials, refreshing token");
                        rejected = Some(token);
                        if !inner.mark_lost(&cancel, e.clone()) {
                            return;
                        }
                        publish(&outcome, Err(ConnectionError::Transport(e)));
                        continue;
                    }
                    LinkEnd::Lost(e) => {
                        warn!(error = %e, "hub link lost");
                        if !inner.mark_lost(&cancel, e.clone()) {
                            return;
                        }
                        publish(&outcome, Err(ConnectionError::Transport(e)));
                    }
                }
            }
            Err(e) if e.is_auth() => {
                if rejected.is_some() {
                    inner.fail(&cancel, &outcome, AuthFailure::RefreshedTokenRejected);
                    return;
                }
                warn!(error = %e, "hub rejected token, refreshing");
                rejected = Some(token);
                continue;
            }
            Err(e) => {
                let Some(attempt) = inner.mark_attempt_failed(&cancel, e.clone()) else {
                    return;
                };
                warn!(attempt, error = %e, label = e.label(), "hub connection attempt failed");
                publish(&outcome, Err(ConnectionError::Transport(e)));
            }
        }

        let delay = backoff.next_delay();
        debug!(?delay, attempt = backoff.attempt(), "waiting before reconnect");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

enum LinkEnd {
    Cancelled,
    AuthRejected(TransportError),
    Lost(TransportError),
}

impl From<TransportError> for LinkEnd {
    fn from(e: TransportError) -> Self {
        if e.is_auth() {
            Self::AuthRejected(e)
        } else {
            Self::Lost(e)
        }
    }
}

/// Single read path: inbound frames go to the router in arrival order.
async fn pump(
    router: &EventRouter,
    mut link: Box<dyn Link>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> LinkEnd {
    let end = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break LinkEnd::Cancelled,

            Some(frame) = outbound.recv() => {
                if let Err(e) = link.send(frame).await {
                    break LinkEnd::from(e);
                }
            }

            received = link.recv() => match received {
                Ok(Some(text)) => {
                    let _ = router.dispatch_frame(&text);
                }
                Ok(None) => {
                    break LinkEnd::Lost(TransportError::Closed {
                        code: None,
                        reason: "link closed".into(),
                    });
                }
                Err(e) => break LinkEnd::from(e),
            }
        }
    };
    link.close().await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, SequenceTokenProvider, wait_for_state};
    use assert_matches::assert_matches;
    use parley_api::{AuthError, StaticTokenProvider};
    use parley_core::events::HubEvent;
    use parley_core::ids::UserId;
    use serde_json::json;
    use std::time::Duration;

    fn reconnect() -> ReconnectSettings {
        ReconnectSettings {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
            degraded_after_attempts: 3,
        }
    }

    fn manager(transports: &[&Arc<ScriptedTransport>]) -> ConnectionManager {
        let transports = transports
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn Transport>)
            .collect();
        ConnectionManager::with_transports(&reconnect(), Arc::new(EventRouter::new()), transports)
    }

    fn static_tokens() -> Arc<dyn TokenProvider> {
        Arc::new(StaticTokenProvider::new("tok"))
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_routes_frames() {
        let ws = ScriptedTransport::websocket();
        let link = ws.accept();
        let manager = manager(&[&ws]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = manager.on_event(
            EventKind::PresenceChanged,
            Arc::new(move |e: &HubEvent| sink.lock().push(e.clone())),
        );

        manager.connect(static_tokens()).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        let info = manager.info();
        assert_eq!(info.transport, Some(TransportKind::WebSocket));
        assert_eq!(info.epoch, 1);
        assert!(info.connection_id.is_some());

        link.push_frame(json!({"event": "presence-changed", "data": {"userId": "u1", "status": "busy"}}));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(ws.tokens_seen(), vec!["tok".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_joins_running_loop() {
        let ws = ScriptedTransport::websocket();
        let _link = ws.accept();
        let manager = manager(&[&ws]);

        let (a, b) = tokio::join!(manager.connect(static_tokens()), manager.connect(static_tokens()));
        a.unwrap();
        b.unwrap();
        manager.connect(static_tokens()).await.unwrap();
        assert_eq!(ws.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_next_transport() {
        let ws = ScriptedTransport::websocket();
        ws.fail(TransportError::Http { status: 502 });
        let lp = ScriptedTransport::long_polling();
        let _link = lp.accept();
        let manager = manager(&[&ws, &lp]);

        manager.connect(static_tokens()).await.unwrap();
        assert_eq!(manager.info().transport, Some(TransportKind::LongPolling));
        assert_eq!(ws.open_count(), 1);
        assert_eq!(lp.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_stops_negotiation_and_forces_refresh() {
        let ws = ScriptedTransport::websocket();
        ws.fail(TransportError::AuthRejected { status: 401 });
        let _link = ws.accept();
        let lp = ScriptedTransport::long_polling();
        let tokens = Arc::new(SequenceTokenProvider::new(["old", "new"]));
        let manager = manager(&[&ws, &lp]);

        manager.connect(tokens.clone()).await.unwrap();
        assert_eq!(lp.open_count(), 0);
        assert_eq!(tokens.force_flags(), vec![false, true]);
        assert_eq!(ws.tokens_seen(), vec!["old".to_string(), "new".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_token_after_rejection_fails() {
        let ws = ScriptedTransport::websocket();
        ws.fail(TransportError::AuthRejected { status: 401 });
        let manager = manager(&[&ws]);

        let result = manager.connect(static_tokens()).await;
        assert_matches!(result, Err(ConnectionError::Auth(AuthFailure::TokenNotRefreshed)));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(ws.open_count(), 1);
        assert_matches!(manager.last_error(), Some(ConnectionError::Auth(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_token_rejected_fails() {
        let ws = ScriptedTransport::websocket();
        ws.fail(TransportError::AuthRejected { status: 401 });
        ws.fail(TransportError::AuthRejected { status: 403 });
        let manager = manager(&[&ws]);

        let result = manager
            .connect(Arc::new(SequenceTokenProvider::new(["a", "b"])))
            .await;
        assert_matches!(result, Err(ConnectionError::Auth(AuthFailure::RefreshedTokenRejected)));
        assert_eq!(ws.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_fails() {
        let manager = manager(&[&ScriptedTransport::websocket()]);
        let result = manager
            .connect(Arc::new(StaticTokenProvider::signed_out()))
            .await;
        assert_matches!(
            result,
            Err(ConnectionError::Auth(AuthFailure::Provider(AuthError::Unavailable)))
        );
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_loop_can_be_restarted() {
        let ws = ScriptedTransport::websocket();
        ws.fail(TransportError::AuthRejected { status: 401 });
        let _link = ws.accept();
        let manager = manager(&[&ws]);
        let tokens = Arc::new(StaticTokenProvider::new("a"));

        assert!(manager.connect(tokens.clone()).await.is_err());
        tokens.set(Some(AuthToken::new("b")));
        manager.connect(tokens).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_and_degrade() {
        let ws = ScriptedTransport::websocket();
        for _ in 0..4 {
            ws.fail(TransportError::Connect("refused".into()));
        }
        let _link = ws.accept();
        let manager = manager(&[&ws]);
        let mut states = manager.subscribe_state();

        let first = manager.connect(static_tokens()).await;
        assert_matches!(first, Err(ConnectionError::Transport(TransportError::Connect(_))));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(ws.open_count(), 5);
        let info = manager.info();
        assert_eq!(info.attempts, 0);
        assert!(!info.degraded);

        let mut saw_reconnecting = false;
        while let Ok(t) = states.try_recv() {
            saw_reconnecting |= t.to == ConnectionState::Reconnecting;
        }
        assert!(saw_reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn joining_after_recovery_reports_connected() {
        let ws = ScriptedTransport::websocket();
        ws.fail(TransportError::Connect("refused".into()));
        let _link = ws.accept();
        let manager = manager(&[&ws]);
        let mut states = manager.subscribe_state();

        let first = manager.connect(static_tokens()).await;
        assert_matches!(first, Err(ConnectionError::Transport(TransportError::Connect(_))));
        wait_for_state(&manager, ConnectionState::Connected).await;

        manager.connect(static_tokens()).await.unwrap();
        assert_eq!(ws.open_count(), 2);

        // First connected epoch, but reached through a failed attempt.
        let connected = loop {
            let t = states.recv().await.unwrap();
            if t.to == ConnectionState::Connected {
                break t;
            }
        };
        assert_eq!(connected.epoch, 1);
        assert!(connected.is_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn joining_while_reconnecting_reports_the_loss() {
        let ws = ScriptedTransport::websocket();
        let first = ws.accept();
        for _ in 0..10 {
            ws.fail(TransportError::Connect("refused".into()));
        }
        let manager = manager(&[&ws]);

        manager.connect(static_tokens()).await.unwrap();
        first.fail(TransportError::PongTimeout(Duration::from_secs(30)));
        wait_for_state(&manager, ConnectionState::Reconnecting).await;

        assert_matches!(
            manager.connect(static_tokens()).await,
            Err(ConnectionError::Transport(_))
        );
        manager.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_flag_raised_after_threshold() {
        let ws = ScriptedTransport::websocket();
        for _ in 0..10 {
            ws.fail(TransportError::Connect("refused".into()));
        }
        let manager = manager(&[&ws]);
        let _ = manager.connect(static_tokens()).await;
        assert!(!manager.info().degraded);

        // 100 + 200 + 400 ms of backoff covers attempts two through four.
        tokio::time::sleep(Duration::from_millis(750)).await;
        let info = manager.info();
        assert!(info.attempts >= 3);
        assert!(info.degraded);
        manager.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_reconnects_with_new_epoch() {
        let ws = ScriptedTransport::websocket();
        let first = ws.accept();
        let _second = ws.accept();
        let manager = manager(&[&ws]);
        let mut states = manager.subscribe_state();

        manager.connect(static_tokens()).await.unwrap();
        let first_id = manager.info().connection_id;
        first.fail(TransportError::PongTimeout(Duration::from_secs(30)));

        loop {
            let t = states.recv().await.unwrap();
            if t.is_reconnect() {
                assert_eq!(t.epoch, 2);
                break;
            }
        }
        assert_ne!(manager.info().connection_id, first_id);
        assert!(first.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_credentials_on_open_link_refresh_token() {
        let ws = ScriptedTransport::websocket();
        let first = ws.accept();
        let _second = ws.accept();
        let tokens = Arc::new(SequenceTokenProvider::new(["a", "b"]));
        let manager = manager(&[&ws]);

        manager.connect(tokens.clone()).await.unwrap();
        first.fail(TransportError::AuthRejected { status: 4401 });
        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(tokens.force_flags(), vec![false, true]);
        assert_eq!(manager.info().epoch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_open_link() {
        let ws = ScriptedTransport::websocket();
        let link = ws.accept();
        let manager = manager(&[&ws]);
        let event = OutboundEvent::SubscribeToPresence {
            user_ids: vec![UserId::new("u1")],
        };

        assert_matches!(manager.send(event.clone()), Err(ConnectionError::NotConnected));
        manager.connect(static_tokens()).await.unwrap();
        manager.send(event).unwrap();
        link.wait_for_sent(1).await;
        assert!(link.sent()[0].contains("subscribe-to-presence"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_loop() {
        let ws = ScriptedTransport::websocket();
        for _ in 0..10 {
            ws.fail(TransportError::Connect("refused".into()));
        }
        let manager = manager(&[&ws]);
        let _ = manager.connect(static_tokens()).await;

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let opens = ws.open_count();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ws.open_count(), opens);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_open_link() {
        let ws = ScriptedTransport::websocket();
        let link = ws.accept();
        let manager = manager(&[&ws]);
        manager.connect(static_tokens()).await.unwrap();

        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(link.is_closed());
        assert_matches!(
            manager.send(OutboundEvent::SubscribeToPresence { user_ids: vec![] }),
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn background_parks_until_foreground() {
        let ws = ScriptedTransport::websocket();
        let _link = ws.accept();
        let manager = manager(&[&ws]);
        manager.set_foreground(false);

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(static_tokens()).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ws.open_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.set_foreground(true);
        connecting.await.unwrap().unwrap();
        assert_eq!(ws.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_before_outcome_reports_stopped() {
        let manager = manager(&[&ScriptedTransport::websocket()]);
        manager.set_foreground(false);

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(static_tokens()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.disconnect();
        assert_matches!(connecting.await.unwrap(), Err(ConnectionError::Stopped));
    }
}
