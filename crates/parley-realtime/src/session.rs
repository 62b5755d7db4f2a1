//! Session context: builds and wires every slice for one signed-in user.
//!
//! A [`RealtimeSession`] owns the connection, the router, every slice, the
//! supervisor, and the scheduler they share. Nothing here is global: two
//! sessions in one process are fully independent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use parley_api::{DeviceRegistration, PushRegistrar, RealtimeApi, TokenProvider};
use parley_core::events::EventKind;
use parley_core::ids::{DeviceId, UserId};
use parley_settings::ParleySettings;
use tracing::{info, warn};

use crate::calls::CallManager;
use crate::connection::{ConnectionError, ConnectionManager, HubSender, Transport, transports_for};
use crate::conversations::ConversationTracker;
use crate::error::Result;
use crate::notifications::NotificationStream;
use crate::presence::PresenceCache;
use crate::router::{EventHandler, EventRouter};
use crate::scheduler::{DEFAULT_SHUTDOWN_TIMEOUT, TaskScheduler};
use crate::supervisor::{ReconnectionSupervisor, ResyncReport};

/// Builder for [`RealtimeSession`].
pub struct SessionBuilder {
    settings: ParleySettings,
    api: Arc<dyn RealtimeApi>,
    tokens: Arc<dyn TokenProvider>,
    push: Option<Arc<dyn PushRegistrar>>,
    local_user: Option<UserId>,
    transports: Option<Vec<Arc<dyn Transport>>>,
}

impl SessionBuilder {
    /// Register this device for OS push on start, unregister on logout.
    #[must_use]
    pub fn with_push(mut self, push: Arc<dyn PushRegistrar>) -> Self {
        self.push = Some(push);
        self
    }

    /// The signed-in user. Used to recognise the user's own messages and
    /// call signals echoed from other devices.
    #[must_use]
    pub fn with_local_user(mut self, user: impl Into<UserId>) -> Self {
        self.local_user = Some(user.into());
        self
    }

    /// Use these transports instead of the ones configured in `hub`.
    #[must_use]
    pub fn with_transports(mut self, transports: Vec<Arc<dyn Transport>>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Wire everything. Nothing connects until [`RealtimeSession::start`].
    #[must_use]
    pub fn build(self) -> RealtimeSession {
        let scheduler = TaskScheduler::new();
        let router = Arc::new(EventRouter::new());
        let transports = self
            .transports
            .unwrap_or_else(|| transports_for(&self.settings.hub));
        let connection =
            ConnectionManager::with_transports(&self.settings.reconnect, Arc::clone(&router), transports);
        let hub: Arc<dyn HubSender> = Arc::new(connection.clone());

        let presence = PresenceCache::new(
            Arc::clone(&self.api),
            Arc::clone(&hub),
            self.settings.presence.clone(),
            scheduler.clone(),
        );
        let notifications = Arc::new(NotificationStream::new(
            Arc::clone(&self.api),
            self.settings.notifications.page_size,
        ));
        let conversations = Arc::new(ConversationTracker::new(self.local_user.clone()));
        let calls = CallManager::new(
            Arc::clone(&self.api),
            hub,
            scheduler.clone(),
            &self.settings.calls,
            self.local_user.clone(),
        );
        let supervisor = ReconnectionSupervisor::new(
            presence.clone(),
            Arc::clone(&notifications),
            calls.clone(),
            scheduler.clone(),
            &self.settings.resync,
        );

        let _ = router.register(EventKind::PresenceChanged, Arc::new(presence.clone()));
        let _ = router.register(
            EventKind::NotificationPushed,
            Arc::clone(&notifications) as Arc<dyn EventHandler>,
        );
        let _ = router.register(
            EventKind::MessageCreated,
            Arc::clone(&conversations) as Arc<dyn EventHandler>,
        );
        let call_handler: Arc<dyn EventHandler> = Arc::new(calls.clone());
        for kind in EventKind::ALL.into_iter().filter(|k| k.is_call_signal()) {
            let _ = router.register(kind, Arc::clone(&call_handler));
        }

        RealtimeSession {
            settings: self.settings,
            api: self.api,
            push: self.push,
            tokens: Mutex::new(self.tokens),
            local_user: self.local_user,
            scheduler,
            watching: AtomicBool::new(false),
            connection,
            presence,
            notifications,
            conversations,
            calls,
            supervisor,
        }
    }
}

/// Everything realtime for one signed-in user.
pub struct RealtimeSession {
    settings: ParleySettings,
    api: Arc<dyn RealtimeApi>,
    push: Option<Arc<dyn PushRegistrar>>,
    tokens: Mutex<Arc<dyn TokenProvider>>,
    local_user: Option<UserId>,
    scheduler: TaskScheduler,
    watching: AtomicBool,
    connection: ConnectionManager,
    presence: PresenceCache,
    notifications: Arc<NotificationStream>,
    conversations: Arc<ConversationTracker>,
    calls: CallManager,
    supervisor: ReconnectionSupervisor,
}

impl RealtimeSession {
    /// Start building a session.
    #[must_use]
    pub fn builder(
        settings: ParleySettings,
        api: Arc<dyn RealtimeApi>,
        tokens: Arc<dyn TokenProvider>,
    ) -> SessionBuilder {
        SessionBuilder {
            settings,
            api,
            tokens,
            push: None,
            local_user: None,
            transports: None,
        }
    }

    /// Connect, register for push, and load the first notification page.
    ///
    /// Only the connection outcome is fatal. Push registration and the
    /// initial page are retried by the next resync or start. When the first
    /// attempt fails with a transport error the loop keeps retrying, so both
    /// still run before the error is returned; the supervisor resyncs once
    /// the hub is reached.
    pub async fn start(&self) -> Result<()> {
        if self.scheduler.is_shutting_down() {
            return Err(ConnectionError::Stopped.into());
        }
        if !self.watching.swap(true, Ordering::SeqCst) {
            self.supervisor.watch(&self.connection);
        }

        let tokens = Arc::clone(&*self.tokens.lock());
        let connected = self.connection.connect(tokens).await;
        if let Err(error) = &connected {
            if !matches!(error, ConnectionError::Transport(_)) {
                return connected.map_err(Into::into);
            }
            warn!(%error, "hub unreachable on start, retrying in the background");
        }

        if let (Some(push), Some(registration)) = (&self.push, self.device_registration()) {
            match push.register(&registration).await {
                Ok(()) => info!(device_id = %registration.device_id, "push registered"),
                Err(error) => warn!(device_id = %registration.device_id, %error, "push registration failed"),
            }
        }

        match self.notifications.load_page(None).await {
            Ok(count) => info!(count, "notifications loaded"),
            Err(error) => warn!(%error, "initial notification load failed"),
        }
        connected.map_err(Into::into)
    }

    /// Replace the token provider (account switch, token rotation) and
    /// reconnect. The reconnect counts as a gap and triggers a resync.
    pub async fn restart(&self, tokens: Arc<dyn TokenProvider>) -> Result<()> {
        if self.scheduler.is_shutting_down() {
            return Err(ConnectionError::Stopped.into());
        }
        info!("restarting hub connection with new credentials");
        self.connection.disconnect();
        *self.tokens.lock() = Arc::clone(&tokens);
        self.connection.connect(tokens).await?;
        Ok(())
    }

    /// Disconnect and stop every scheduled task. The session cannot be
    /// started again.
    pub async fn shutdown(&self) {
        self.connection.disconnect();
        self.scheduler.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
        info!("realtime session shut down");
    }

    /// Unregister push, then shut down.
    pub async fn logout(&self) {
        if let (Some(push), Some(device)) = (&self.push, self.device_id()) {
            if let Err(error) = push.unregister(&device).await {
                warn!(device_id = %device, %error, "push unregistration failed");
            }
        }
        self.shutdown().await;
    }

    /// Tell the connection whether the app is in the foreground.
    pub fn set_foreground(&self, foreground: bool) {
        self.connection.set_foreground(foreground);
    }

    /// Settings the session was built with.
    #[must_use]
    pub fn settings(&self) -> &ParleySettings {
        &self.settings
    }

    /// The signed-in user, if known.
    #[must_use]
    pub fn local_user(&self) -> Option<&UserId> {
        self.local_user.as_ref()
    }

    /// The REST client.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn RealtimeApi> {
        &self.api
    }

    /// Hub connection.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Presence cache.
    #[must_use]
    pub fn presence(&self) -> &PresenceCache {
        &self.presence
    }

    /// Notification feed.
    #[must_use]
    pub fn notifications(&self) -> &NotificationStream {
        &self.notifications
    }

    /// Conversation activity.
    #[must_use]
    pub fn conversations(&self) -> &ConversationTracker {
        &self.conversations
    }

    /// Call signaling.
    #[must_use]
    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    /// Resync reports from now on.
    #[must_use]
    pub fn subscribe_resync(&self) -> tokio::sync::broadcast::Receiver<ResyncReport> {
        self.supervisor.subscribe()
    }

    fn device_id(&self) -> Option<DeviceId> {
        self.settings.push.device_id.as_deref().map(DeviceId::new)
    }

    fn device_registration(&self) -> Option<DeviceRegistration> {
        self.device_id().map(|device_id| DeviceRegistration {
            device_id,
            platform: self.settings.push.platform.clone(),
            endpoint: self.settings.push.endpoint.clone(),
        })
    }
}

impl std::fmt::Debug for RealtimeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSession")
            .field("local_user", &self.local_user)
            .field("connection", &self.connection)
            .field("shutting_down", &self.scheduler.is_shutting_down())
            .finish_non_exhaustive()
    }
}
