//! Notification feed types shared by the REST client and the live stream.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::NotificationId;

/// One entry of the user's notification feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    /// Server-assigned id, monotonic per user.
    pub id: NotificationId,
    /// Free-form payload rendered by the UI.
    #[serde(default)]
    pub payload: Value,
    /// Server creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the user has read it.
    #[serde(default)]
    pub is_read: bool,
}

impl NotificationItem {
    /// Feed ordering: newest `created_at` first, ties broken by id descending.
    #[must_use]
    pub fn feed_order(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Opaque pagination cursor handed out by the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(String);

impl PageCursor {
    /// Wrap a cursor string received from the server.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The raw cursor value, passed back verbatim.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of notification history, newest first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    /// Items on this page.
    pub items: Vec<NotificationItem>,
    /// Cursor for the next (older) page; `None` at the end of history.
    #[serde(default)]
    pub next_cursor: Option<PageCursor>,
}
