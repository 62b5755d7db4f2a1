//! Hub connection.
//!
//! - **[`ConnectionManager`]**: owns the single connection loop (token fetch,
//!   transport negotiation, backoff, foreground parking).
//! - **[`Transport`] / [`Link`]**: how a link to the hub is opened and driven.
//! - **[`WebSocketTransport`]**, **[`LongPollingTransport`]**: the two
//!   transports, tried in the configured preference order.

pub mod long_polling;
pub mod manager;
pub mod state;
pub mod transport;
pub mod websocket;

pub use long_polling::LongPollingTransport;
pub use manager::{ConnectionManager, transports_for};
pub use state::{AuthFailure, ConnectionError, ConnectionInfo, ConnectionState, StateTransition};
pub use transport::{Link, Transport, TransportError};
pub use websocket::WebSocketTransport;

use parley_core::events::OutboundEvent;

/// Something that can put an outbound frame on the hub connection.
///
/// Slices depend on this rather than on [`ConnectionManager`] so they can be
/// tested without a connection.
pub trait HubSender: Send + Sync {
    /// Queue `event` on the open link. Fails with
    /// [`ConnectionError::NotConnected`] when no link is open; nothing is
    /// buffered across reconnects.
    fn send(&self, event: OutboundEvent) -> Result<(), ConnectionError>;
}
