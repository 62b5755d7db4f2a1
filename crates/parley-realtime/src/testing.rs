//! Test doubles for the realtime core.
//!
//! Built for this crate's unit tests, and behind the `testing` feature for
//! integration tests and downstream clients that want to drive a session
//! without a hub or an HTTP server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_api::{
    ApiError, ApiResult, AuthError, AuthToken, DeviceRegistration, PushRegistrar, RealtimeApi,
    TokenProvider,
};
use parley_core::calls::{CallStart, CallSummary, MediaParams};
use parley_core::events::{HubEvent, OutboundEvent};
use parley_core::ids::{CallId, ConversationId, DeviceId, NotificationId, UserId};
use parley_core::notifications::{NotificationPage, PageCursor};
use parley_core::presence::PresenceStatus;
use parley_settings::TransportKind;
use tokio::sync::{broadcast, mpsc, watch};

use crate::connection::{
    ConnectionError, ConnectionManager, ConnectionState, HubSender, Link, Transport,
    TransportError,
};

pub use parley_api::StaticTokenProvider;

// ─────────────────────────────────────────────────────────────────────────────
// Scripted transport
// ─────────────────────────────────────────────────────────────────────────────

enum Step {
    Accept(ScriptedLink),
    Fail(TransportError),
}

/// Transport whose `open` results are queued up front.
///
/// Once the script runs out every `open` fails with a connect error.
pub struct ScriptedTransport {
    kind: TransportKind,
    steps: Mutex<VecDeque<Step>>,
    tokens: Mutex<Vec<String>>,
    opens: AtomicUsize,
}

impl ScriptedTransport {
    /// Scripted transport reporting `kind`.
    #[must_use]
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            steps: Mutex::new(VecDeque::new()),
            tokens: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
        })
    }

    /// Scripted WebSocket transport.
    #[must_use]
    pub fn websocket() -> Arc<Self> {
        Self::new(TransportKind::WebSocket)
    }

    /// Scripted long-polling transport.
    #[must_use]
    pub fn long_polling() -> Arc<Self> {
        Self::new(TransportKind::LongPolling)
    }

    /// Queue a successful open. The handle drives the resulting link.
    pub fn accept(&self) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (sent_count, _) = watch::channel(0);
        let handle = LinkHandle {
            input: tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            sent_count,
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.steps.lock().push_back(Step::Accept(ScriptedLink {
            input: rx,
            sent: Arc::clone(&handle.sent),
            sent_count: handle.sent_count.clone(),
            closed: Arc::clone(&handle.closed),
        }));
        handle
    }

    /// Queue a failed open.
    pub fn fail(&self, error: TransportError) {
        self.steps.lock().push_back(Step::Fail(error));
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Tokens presented to `open`, in order.
    #[must_use]
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, token: &AuthToken) -> Result<Box<dyn Link>, TransportError> {
        let _ = self.opens.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(token.expose().to_string());
        match self.steps.lock().pop_front() {
            Some(Step::Accept(link)) => Ok(Box::new(link)),
            Some(Step::Fail(error)) => Err(error),
            None => Err(TransportError::Connect("script exhausted".into())),
        }
    }
}

enum LinkInput {
    Frame(String),
    End(Result<(), TransportError>),
}

struct ScriptedLink {
    input: mpsc::UnboundedReceiver<LinkInput>,
    sent: Arc<Mutex<Vec<String>>>,
    sent_count: watch::Sender<usize>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Link for ScriptedLink {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.input.recv().await {
            Some(LinkInput::Frame(frame)) => Ok(Some(frame)),
            Some(LinkInput::End(Ok(()))) => Ok(None),
            Some(LinkInput::End(Err(e))) => Err(e),
            // Handle dropped: the link simply stays quiet.
            None => std::future::pending().await,
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let mut sent = self.sent.lock();
        sent.push(frame);
        let _ = self.sent_count.send_replace(sent.len());
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Drives one scripted link from the hub's side.
pub struct LinkHandle {
    input: mpsc::UnboundedSender<LinkInput>,
    sent: Arc<Mutex<Vec<String>>>,
    sent_count: watch::Sender<usize>,
    closed: Arc<AtomicBool>,
}

impl LinkHandle {
    /// Deliver a raw frame (a JSON value or a string) to the client.
    pub fn push_frame(&self, frame: impl Into<FrameText>) {
        let _ = self.input.send(LinkInput::Frame(frame.into().0));
    }

    /// Deliver a typed event.
    pub fn push_event(&self, event: &HubEvent) {
        if let Ok(frame) = event.to_frame() {
            let _ = self.input.send(LinkInput::Frame(frame));
        }
    }

    /// Close the link cleanly from the hub's side.
    pub fn close(&self) {
        let _ = self.input.send(LinkInput::End(Ok(())));
    }

    /// Break the link with `error`.
    pub fn fail(&self, error: TransportError) {
        let _ = self.input.send(LinkInput::End(Err(error)));
    }

    /// Frames the client wrote, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Frames the client wrote, parsed as outbound events.
    #[must_use]
    pub fn sent_events(&self) -> Vec<OutboundEvent> {
        self.sent
            .lock()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Wait until the client has written at least `count` frames.
    pub async fn wait_for_sent(&self, count: usize) {
        let mut rx = self.sent_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Whether the client closed the link.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Frame text accepted by [`LinkHandle::push_frame`].
pub struct FrameText(String);

impl From<String> for FrameText {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FrameText {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<serde_json::Value> for FrameText {
    fn from(v: serde_json::Value) -> Self {
        Self(v.to_string())
    }
}

/// Wait until `manager` reaches `target`.
pub async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    let mut transitions = manager.subscribe_state();
    while manager.state() != target {
        match transitions.recv().await {
            Ok(t) if t.to == target => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token providers
// ─────────────────────────────────────────────────────────────────────────────

/// Hands out tokens from a fixed sequence, repeating the last one.
///
/// Records the `force_refresh` flag of every request.
pub struct SequenceTokenProvider {
    tokens: Mutex<VecDeque<Result<AuthToken, AuthError>>>,
    last: Mutex<Option<Result<AuthToken, AuthError>>>,
    force_flags: Mutex<Vec<bool>>,
}

impl SequenceTokenProvider {
    /// Provider yielding `tokens` in order.
    #[must_use]
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(tokens.into_iter().map(|t| Ok(AuthToken::new(t))))
    }

    /// Provider yielding explicit results, failures included.
    #[must_use]
    pub fn from_results(results: impl IntoIterator<Item = Result<AuthToken, AuthError>>) -> Self {
        Self {
            tokens: Mutex::new(results.into_iter().collect()),
            last: Mutex::new(None),
            force_flags: Mutex::new(Vec::new()),
        }
    }

    /// `force_refresh` of every request so far.
    #[must_use]
    pub fn force_flags(&self) -> Vec<bool> {
        self.force_flags.lock().clone()
    }
}

#[async_trait]
impl TokenProvider for SequenceTokenProvider {
    async fn token(&self, force_refresh: bool) -> Result<AuthToken, AuthError> {
        self.force_flags.lock().push(force_refresh);
        let mut last = self.last.lock();
        if let Some(next) = self.tokens.lock().pop_front() {
            *last = Some(next);
        }
        last.clone().unwrap_or(Err(AuthError::Unavailable))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub sender
// ─────────────────────────────────────────────────────────────────────────────

/// [`HubSender`] that records frames instead of sending them.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundEvent>>,
    disconnected: AtomicBool,
}

impl RecordingSender {
    /// Connected sender.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Toggle whether sends succeed.
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.lock().clone()
    }
}

impl HubSender for RecordingSender {
    fn send(&self, event: OutboundEvent) -> Result<(), ConnectionError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.sent.lock().push(event);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fake API
// ─────────────────────────────────────────────────────────────────────────────

/// REST operations of [`FakeApi`], for injecting failures and counting calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FakeCall {
    /// `notifications_page`
    NotificationsPage,
    /// `mark_notification_read`
    MarkRead,
    /// `mark_all_notifications_read`
    MarkAllRead,
    /// `presence_batch`
    PresenceBatch,
    /// `start_call`
    StartCall,
    /// `join_call`
    JoinCall,
    /// `active_calls`
    ActiveCalls,
    /// `register`
    Register,
    /// `unregister`
    Unregister,
}

#[derive(Default)]
struct FakeState {
    pages: HashMap<Option<String>, NotificationPage>,
    presence: HashMap<UserId, PresenceStatus>,
    presence_requests: Vec<Vec<UserId>>,
    delays: HashMap<FakeCall, Duration>,
    active_calls: Vec<CallSummary>,
    start_call: Option<CallStart>,
    join_media: Option<MediaParams>,
    failures: HashMap<FakeCall, ApiError>,
    calls: HashMap<FakeCall, usize>,
    read_marks: Vec<NotificationId>,
    started: Vec<ConversationId>,
    joined: Vec<CallId>,
    registrations: Vec<DeviceRegistration>,
    unregistrations: Vec<DeviceId>,
}

/// In-memory [`RealtimeApi`] and [`PushRegistrar`].
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    /// Empty fake.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `page` for requests with `cursor` (`None` = head).
    pub fn set_page(&self, cursor: Option<&str>, page: NotificationPage) {
        let _ = self.state.lock().pages.insert(cursor.map(str::to_string), page);
    }

    /// Server-side presence of `user`.
    pub fn set_presence(&self, user: impl Into<UserId>, status: PresenceStatus) {
        let _ = self.state.lock().presence.insert(user.into(), status);
    }

    /// Make every presence request take `delay` before answering.
    pub fn set_presence_delay(&self, delay: Duration) {
        self.set_delay(FakeCall::PresenceBatch, delay);
    }

    /// Make every `call` take `delay` before answering. Configured failures
    /// are returned after the delay.
    pub fn set_delay(&self, call: FakeCall, delay: Duration) {
        let _ = self.state.lock().delays.insert(call, delay);
    }

    /// Calls `active_calls` reports.
    pub fn set_active_calls(&self, calls: Vec<CallSummary>) {
        self.state.lock().active_calls = calls;
    }

    /// Response to the next `start_call`.
    pub fn set_start_call(&self, start: CallStart) {
        self.state.lock().start_call = Some(start);
    }

    /// Response to `join_call`.
    pub fn set_join_media(&self, media: MediaParams) {
        self.state.lock().join_media = Some(media);
    }

    /// Make `call` fail with `error` until cleared.
    pub fn fail(&self, call: FakeCall, error: ApiError) {
        let _ = self.state.lock().failures.insert(call, error);
    }

    /// Let `call` succeed again.
    pub fn clear_failure(&self, call: FakeCall) {
        let _ = self.state.lock().failures.remove(&call);
    }

    /// How many times `call` was invoked.
    #[must_use]
    pub fn call_count(&self, call: FakeCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// User ids of every presence request, in order.
    #[must_use]
    pub fn presence_requests(&self) -> Vec<Vec<UserId>> {
        self.state.lock().presence_requests.clone()
    }

    /// Ids passed to `mark_notification_read`.
    #[must_use]
    pub fn read_marks(&self) -> Vec<NotificationId> {
        self.state.lock().read_marks.clone()
    }

    /// Conversations passed to `start_call`.
    #[must_use]
    pub fn started_calls(&self) -> Vec<ConversationId> {
        self.state.lock().started.clone()
    }

    /// Calls passed to `join_call`.
    #[must_use]
    pub fn joined_calls(&self) -> Vec<CallId> {
        self.state.lock().joined.clone()
    }

    /// Registrations received.
    #[must_use]
    pub fn registrations(&self) -> Vec<DeviceRegistration> {
        self.state.lock().registrations.clone()
    }

    /// Devices unregistered.
    #[must_use]
    pub fn unregistrations(&self) -> Vec<DeviceId> {
        self.state.lock().unregistrations.clone()
    }

    fn enter(&self, call: FakeCall) -> ApiResult<()> {
        let mut state = self.state.lock();
        *state.calls.entry(call).or_default() += 1;
        state.failures.get(&call).cloned().map_or(Ok(()), Err)
    }

    async fn pause(&self, call: FakeCall) {
        let delay = self.state.lock().delays.get(&call).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RealtimeApi for FakeApi {
    async fn notifications_page(
        &self,
        cursor: Option<&PageCursor>,
        _limit: u32,
    ) -> ApiResult<NotificationPage> {
        self.enter(FakeCall::NotificationsPage)?;
        let key = cursor.map(|c| c.as_str().to_string());
        Ok(self.state.lock().pages.get(&key).cloned().unwrap_or_default())
    }

    async fn mark_notification_read(&self, id: NotificationId) -> ApiResult<()> {
        self.pause(FakeCall::MarkRead).await;
        self.enter(FakeCall::MarkRead)?;
        self.state.lock().read_marks.push(id);
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> ApiResult<()> {
        self.pause(FakeCall::MarkAllRead).await;
        self.enter(FakeCall::MarkAllRead)
    }

    async fn presence_batch(&self, users: &[UserId]) -> ApiResult<HashMap<UserId, PresenceStatus>> {
        self.enter(FakeCall::PresenceBatch)?;
        self.state.lock().presence_requests.push(users.to_vec());
        self.pause(FakeCall::PresenceBatch).await;
        let state = self.state.lock();
        Ok(users
            .iter()
            .filter_map(|u| state.presence.get(u).map(|s| (u.clone(), *s)))
            .collect())
    }

    async fn start_call(&self, conversation: &ConversationId) -> ApiResult<CallStart> {
        self.enter(FakeCall::StartCall)?;
        let mut state = self.state.lock();
        state.started.push(conversation.clone());
        state.start_call.clone().ok_or(ApiError::Status {
            status: 500,
            message: "no start_call response configured".into(),
        })
    }

    async fn join_call(&self, call: &CallId) -> ApiResult<MediaParams> {
        self.enter(FakeCall::JoinCall)?;
        let mut state = self.state.lock();
        state.joined.push(call.clone());
        Ok(state.join_media.clone().unwrap_or_else(|| MediaParams {
            token: "media-token".into(),
            server_url: "wss://media.test".into(),
        }))
    }

    async fn active_calls(&self) -> ApiResult<Vec<CallSummary>> {
        self.enter(FakeCall::ActiveCalls)?;
        Ok(self.state.lock().active_calls.clone())
    }
}

#[async_trait]
impl PushRegistrar for FakeApi {
    async fn register(&self, registration: &DeviceRegistration) -> ApiResult<()> {
        self.enter(FakeCall::Register)?;
        self.state.lock().registrations.push(registration.clone());
        Ok(())
    }

    async fn unregister(&self, device: &DeviceId) -> ApiResult<()> {
        self.enter(FakeCall::Unregister)?;
        self.state.lock().unregistrations.push(device.clone());
        Ok(())
    }
}
