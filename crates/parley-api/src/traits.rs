//! Collaborator traits the realtime core talks to.
//!
//! The realtime crate never touches HTTP directly; everything it needs from
//! the server outside the hub goes through [`RealtimeApi`], and OS push
//! registration through [`PushRegistrar`]. [`crate::HttpApiClient`]
//! implements both.

use std::collections::HashMap;

use async_trait::async_trait;
use parley_core::calls::{CallStart, CallSummary, MediaParams};
use parley_core::ids::{CallId, ConversationId, DeviceId, NotificationId, UserId};
use parley_core::notifications::{NotificationPage, PageCursor};
use parley_core::presence::PresenceStatus;
use serde::{Deserialize, Serialize};

use crate::errors::ApiResult;

/// REST operations used for initial state, resync, and mutations.
#[async_trait]
pub trait RealtimeApi: Send + Sync {
    /// One page of notification history, newest first. `None` for the head.
    async fn notifications_page(
        &self,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> ApiResult<NotificationPage>;

    /// Mark one notification read.
    async fn mark_notification_read(&self, id: NotificationId) -> ApiResult<()>;

    /// Mark every notification read.
    async fn mark_all_notifications_read(&self) -> ApiResult<()>;

    /// Current presence of `users`. Users the server does not report are
    /// omitted from the map.
    async fn presence_batch(&self, users: &[UserId])
    -> ApiResult<HashMap<UserId, PresenceStatus>>;

    /// Start a call in `conversation`.
    async fn start_call(&self, conversation: &ConversationId) -> ApiResult<CallStart>;

    /// Join an existing call, returning media parameters.
    async fn join_call(&self, call: &CallId) -> ApiResult<MediaParams>;

    /// Calls involving the current user that the server considers live.
    async fn active_calls(&self) -> ApiResult<Vec<CallSummary>>;
}

/// One device registration for OS-level push delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Client-chosen device id.
    pub device_id: DeviceId,
    /// Platform label (`ios`, `android`, `desktop`).
    pub platform: String,
    /// Platform push endpoint or token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Push-notification subscription channel.
#[async_trait]
pub trait PushRegistrar: Send + Sync {
    /// Register (or refresh) this device.
    async fn register(&self, registration: &DeviceRegistration) -> ApiResult<()>;

    /// Remove this device, on logout.
    async fn unregister(&self, device: &DeviceId) -> ApiResult<()>;
}
