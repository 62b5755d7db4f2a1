//! Transport abstraction.
//!
//! A [`Transport`] knows how to open a [`Link`] to the hub with a given
//! token. The connection manager tries transports in preference order and
//! owns whichever link it gets; nothing outside this module knows which
//! transport is in use.

use std::time::Duration;

use async_trait::async_trait;
use parley_api::AuthToken;
use parley_settings::TransportKind;
use thiserror::Error;

/// Close codes the hub uses to reject credentials on an open socket.
pub const AUTH_CLOSE_CODES: [u16; 2] = [4401, 4403];

/// Why a transport could not open, or why an open link stopped.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The hub refused the credentials (HTTP 401/403 or close code 4401/4403).
    #[error("hub rejected credentials ({status})")]
    AuthRejected {
        /// HTTP status or close code.
        status: u16,
    },

    /// The hub could not be reached.
    #[error("could not reach hub: {0}")]
    Connect(String),

    /// The hub answered the handshake with an unexpected HTTP status.
    #[error("hub answered with HTTP {status}")]
    Http {
        /// Status code.
        status: u16,
    },

    /// No pong arrived within the deadline.
    #[error("no pong within {0:?}")]
    PongTimeout(Duration),

    /// The hub closed the link.
    #[error("hub closed the link (code {code:?}): {reason}")]
    Closed {
        /// WebSocket close code, if one was sent.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },

    /// The long-polling connection id is no longer known to the hub.
    #[error("long-polling connection expired")]
    SessionGone,

    /// Read or write failed on an open link.
    #[error("link I/O failed: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this is a credentials problem rather than a connectivity one.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::AuthRejected { .. } => "auth",
            Self::Connect(_) => "connect",
            Self::Http { .. } => "http",
            Self::PongTimeout(_) => "pong_timeout",
            Self::Closed { .. } => "closed",
            Self::SessionGone => "session_gone",
            Self::Io(_) => "io",
        }
    }
}

/// A way of reaching the hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind this is.
    fn kind(&self) -> TransportKind;

    /// Open a link authenticated with `token`.
    async fn open(&self, token: &AuthToken) -> Result<Box<dyn Link>, TransportError>;
}

/// An open, bidirectional frame channel to the hub.
///
/// `recv` must be cancel-safe: the connection loop drops an in-progress
/// `recv` whenever it has an outbound frame to write.
#[async_trait]
pub trait Link: Send {
    /// Next inbound text frame. `Ok(None)` means the hub closed the link
    /// without an error.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Write one frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the link. Errors are irrelevant at this point.
    async fn close(&mut self);
}
