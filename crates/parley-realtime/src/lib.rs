//! # parley-realtime
//!
//! Client-side realtime delivery for Parley.
//!
//! One persistent hub connection feeds a router that fans typed events out
//! to independent slices, each the only writer of its own state:
//!
//! - **[`connection`]**: the connection loop, transports, backoff, auth refresh
//! - **[`router`]**: frame decoding and handler dispatch
//! - **[`presence`]**: per-user status with batched fetches
//! - **[`notifications`]**: the paginated notification feed
//! - **[`conversations`]**: latest message and unread count per conversation
//! - **[`calls`]**: call signaling state machines
//! - **[`supervisor`]**: resync and call failure across connection gaps
//! - **[`session`]**: wires all of the above for one signed-in user
//!
//! Slices publish changes on `tokio::sync` channels; UIs subscribe and read
//! snapshots. Nothing is process-global.

#![deny(unsafe_code)]

pub mod calls;
pub mod connection;
pub mod conversations;
pub mod error;
pub mod notifications;
pub mod presence;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use calls::{CallError, CallManager, CallSession, CallState, CallUpdate};
pub use connection::{ConnectionError, ConnectionInfo, ConnectionManager, ConnectionState, StateTransition};
pub use conversations::{ConversationActivity, ConversationTracker};
pub use error::{ParleyError, Result};
pub use notifications::{NotificationChange, NotificationError, NotificationStream};
pub use presence::{PresenceCache, PresenceError};
pub use router::{EventHandler, EventRouter};
pub use scheduler::TaskScheduler;
pub use session::{RealtimeSession, SessionBuilder};
pub use supervisor::{ReconnectionSupervisor, ResyncReport};
