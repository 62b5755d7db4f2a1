//! # parley-core
//!
//! Shared vocabulary for the Parley realtime client.
//!
//! - **Ids**: `UserId`, `ConversationId`, `CallId`, `NotificationId` and friends
//! - **Presence**: `PresenceStatus`
//! - **Notifications**: `NotificationItem`, `NotificationPage`, `PageCursor`
//! - **Calls**: `CallSummary`, `MediaParams`, `ParticipantFlags`, `CallAction`
//! - **Events**: `HubEvent` / `OutboundEvent` and the frame decoder
//! - **Errors**: `ErrorCategory` classification
//! - **Retry**: exponential backoff with jitter
//! - **Logging**: `tracing` subscriber setup and test capture

#![deny(unsafe_code)]

pub mod calls;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod notifications;
pub mod presence;
pub mod retry;

pub use errors::ErrorCategory;
pub use events::{Decoded, DecodeError, EventKind, HubEvent, OutboundEvent, decode_frame};
pub use ids::{CallId, ConnectionId, ConversationId, DeviceId, MessageId, NotificationId, UserId};
pub use presence::PresenceStatus;
