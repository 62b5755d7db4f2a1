//! Hub wire protocol.
//!
//! Every frame on the hub connection is a JSON text envelope:
//!
//! ```json
//! {"event": "presence-changed", "data": {"userId": "u1", "status": "online"}}
//! ```
//!
//! - **[`HubEvent`]**: inbound events, a tagged union over the event name.
//! - **[`OutboundEvent`]**: frames this client sends to the hub.
//! - **[`decode_frame`]**: classifies a raw frame as a known event, an
//!   unknown event name (forward compatibility), or a decode failure.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::calls::{CallAction, MediaParams, ParticipantFlags};
use crate::ids::{CallId, ConversationId, MessageId, UserId};
use crate::notifications::NotificationItem;
use crate::presence::PresenceStatus;

// ─────────────────────────────────────────────────────────────────────────────
// Event kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Names of the inbound events this client understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `presence-changed`
    PresenceChanged,
    /// `notification-pushed`
    NotificationPushed,
    /// `message-created`
    MessageCreated,
    /// `call-invite`
    CallInvite,
    /// `call-accepted`
    CallAccepted,
    /// `call-rejected`
    CallRejected,
    /// `call-ended`
    CallEnded,
    /// `participant-joined`
    ParticipantJoined,
    /// `participant-left`
    ParticipantLeft,
}

impl EventKind {
    /// Every known kind.
    pub const ALL: [Self; 9] = [
        Self::PresenceChanged,
        Self::NotificationPushed,
        Self::MessageCreated,
        Self::CallInvite,
        Self::CallAccepted,
        Self::CallRejected,
        Self::CallEnded,
        Self::ParticipantJoined,
        Self::ParticipantLeft,
    ];

    /// Wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::PresenceChanged => "presence-changed",
            Self::NotificationPushed => "notification-pushed",
            Self::MessageCreated => "message-created",
            Self::CallInvite => "call-invite",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::CallEnded => "call-ended",
            Self::ParticipantJoined => "participant-joined",
            Self::ParticipantLeft => "participant-left",
        }
    }

    /// Look up a kind by wire name. `None` for names this client does not know.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Whether events of this kind belong to call signaling.
    #[must_use]
    pub fn is_call_signal(self) -> bool {
        matches!(
            self,
            Self::CallInvite
                | Self::CallAccepted
                | Self::CallRejected
                | Self::CallEnded
                | Self::ParticipantJoined
                | Self::ParticipantLeft
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// A user's presence changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChanged {
    /// Whose presence changed.
    pub user_id: UserId,
    /// The new status.
    pub status: PresenceStatus,
    /// Server time of the change, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

/// A message was posted to a conversation the user belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreated {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// New message id.
    pub message_id: MessageId,
    /// Author.
    pub sender_id: UserId,
    /// Server creation time.
    pub created_at: DateTime<Utc>,
    /// Short preview text for badges/toasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Someone is calling the user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    /// Call id.
    pub call_id: CallId,
    /// Conversation the call belongs to.
    pub conversation_id: ConversationId,
    /// Caller.
    pub caller_id: UserId,
    /// Media parameters for joining.
    pub media: MediaParams,
    /// Other users already in the call.
    #[serde(default)]
    pub participants: Vec<UserId>,
    /// When the server stops ringing, if it says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A participant-scoped call signal (accepted, rejected, left).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    /// Call id.
    pub call_id: CallId,
    /// Participant the signal refers to.
    pub user_id: UserId,
}

/// A participant joined or updated their media flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoined {
    /// Call id.
    pub call_id: CallId,
    /// Joining participant.
    pub user_id: UserId,
    /// Media flags.
    #[serde(default)]
    pub flags: ParticipantFlags,
}

/// The call was ended for everybody.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    /// Call id.
    pub call_id: CallId,
    /// Optional server-side reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// HubEvent
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound hub event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum HubEvent {
    /// `presence-changed`
    PresenceChanged(PresenceChanged),
    /// `notification-pushed`
    NotificationPushed(NotificationItem),
    /// `message-created`
    MessageCreated(MessageCreated),
    /// `call-invite`
    CallInvite(CallInvite),
    /// `call-accepted`
    CallAccepted(CallParticipant),
    /// `call-rejected`
    CallRejected(CallParticipant),
    /// `call-ended`
    CallEnded(CallEnded),
    /// `participant-joined`
    ParticipantJoined(ParticipantJoined),
    /// `participant-left`
    ParticipantLeft(CallParticipant),
}

impl HubEvent {
    /// The event's kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PresenceChanged(_) => EventKind::PresenceChanged,
            Self::NotificationPushed(_) => EventKind::NotificationPushed,
            Self::MessageCreated(_) => EventKind::MessageCreated,
            Self::CallInvite(_) => EventKind::CallInvite,
            Self::CallAccepted(_) => EventKind::CallAccepted,
            Self::CallRejected(_) => EventKind::CallRejected,
            Self::CallEnded(_) => EventKind::CallEnded,
            Self::ParticipantJoined(_) => EventKind::ParticipantJoined,
            Self::ParticipantLeft(_) => EventKind::ParticipantLeft,
        }
    }

    /// The call this event refers to, for call signals.
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::CallInvite(e) => Some(&e.call_id),
            Self::CallAccepted(e) | Self::CallRejected(e) | Self::ParticipantLeft(e) => {
                Some(&e.call_id)
            }
            Self::CallEnded(e) => Some(&e.call_id),
            Self::ParticipantJoined(e) => Some(&e.call_id),
            Self::PresenceChanged(_) | Self::NotificationPushed(_) | Self::MessageCreated(_) => {
                None
            }
        }
    }

    /// Serialize into a wire frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OutboundEvent
// ─────────────────────────────────────────────────────────────────────────────

/// A frame this client sends to the hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    /// Ask the hub to push presence changes for these users.
    SubscribeToPresence {
        /// Users of interest.
        #[serde(rename = "userIds")]
        user_ids: Vec<UserId>,
    },
    /// Report a local call action.
    CallAction {
        /// Call id.
        #[serde(rename = "callId")]
        call_id: CallId,
        /// What the user did.
        action: CallAction,
    },
}

impl OutboundEvent {
    /// Wire name of the frame.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscribeToPresence { .. } => "subscribe-to-presence",
            Self::CallAction { .. } => "call-action",
        }
    }

    /// Serialize into a wire frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Why an inbound frame could not be turned into a [`HubEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not JSON.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// The envelope has no string `event` field.
    #[error("frame has no event name")]
    MissingEventName,
    /// The event name is known but the payload does not match its schema.
    #[error("malformed {event} payload: {source}")]
    Payload {
        /// The event name.
        event: EventKind,
        /// Schema mismatch details.
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of decoding one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    /// A known, well-formed event.
    Event(HubEvent),
    /// An event name this client does not know.
    Unknown {
        /// The unrecognized name.
        name: String,
    },
}

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> Result<Decoded, DecodeError> {
    let mut value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
    let name = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingEventName)?;

    let Some(kind) = EventKind::from_name(name) else {
        return Ok(Decoded::Unknown {
            name: name.to_owned(),
        });
    };

    // Adjacently tagged enums need the content key even for empty payloads.
    if let Some(obj) = value.as_object_mut() {
        let _ = obj.entry("data").or_insert(Value::Null);
    }

    serde_json::from_value::<HubEvent>(value)
        .map(Decoded::Event)
        .map_err(|source| DecodeError::Payload {
            event: kind,
            source,
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
