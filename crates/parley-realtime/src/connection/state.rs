//! Connection state vocabulary.

use std::fmt;

use chrono::{DateTime, Utc};
use parley_api::AuthError;
use parley_core::ids::ConnectionId;
use parley_settings::TransportKind;
use serde::Serialize;
use thiserror::Error;

use super::transport::TransportError;

/// Lifecycle state of the hub connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No connection loop is running.
    #[default]
    Disconnected,
    /// First attempt of a fresh loop in progress.
    Connecting,
    /// A link is open.
    Connected,
    /// The link dropped or an attempt failed; retrying with backoff.
    Reconnecting,
    /// The loop gave up (credentials). Call `connect` again to retry.
    Failed,
}

impl ConnectionState {
    /// Whether a connection loop is alive in this state.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state change, as published to state subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTransition {
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
    /// When the change happened.
    pub at: DateTime<Utc>,
    /// Number of times this manager has reached `Connected`, including this
    /// transition.
    pub epoch: u64,
}

impl StateTransition {
    /// Whether this transition reaches `Connected` after a gap: an earlier
    /// connected epoch, or failed attempts during which events went unseen.
    #[must_use]
    pub fn is_reconnect(&self) -> bool {
        self.to == ConnectionState::Connected
            && (self.epoch > 1 || self.from == ConnectionState::Reconnecting)
    }

    /// Whether this transition leaves `Connected`.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        self.from == ConnectionState::Connected && self.to != ConnectionState::Connected
    }
}

/// Point-in-time view of the connection, for UIs and diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Current state.
    pub state: ConnectionState,
    /// Transport of the open link, if connected.
    pub transport: Option<TransportKind>,
    /// Id of the current connected epoch.
    pub connection_id: Option<ConnectionId>,
    /// When the last link opened.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Consecutive failed attempts since the last successful connect.
    pub attempts: u32,
    /// Set after too many consecutive failures; cleared on connect.
    pub degraded: bool,
    /// Connected epochs so far.
    pub epoch: u64,
    /// Whether the client is in the foreground.
    pub foreground: bool,
}

/// Why credentials could not be used.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthFailure {
    /// The token provider could not produce a token.
    #[error("token provider failed: {0}")]
    Provider(#[from] AuthError),
    /// The provider returned the same token the hub just rejected.
    #[error("token provider returned the rejected token again")]
    TokenNotRefreshed,
    /// A freshly refreshed token was rejected too.
    #[error("refreshed token was rejected")]
    RefreshedTokenRejected,
}

/// Connection-level failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Credentials problem; the loop stopped in `Failed`.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),
    /// Every transport failed on this attempt; the loop keeps retrying.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// No link is open to carry an outbound frame.
    #[error("not connected")]
    NotConnected,
    /// The loop was stopped by `disconnect` before an outcome was known.
    #[error("connection loop stopped")]
    Stopped,
    /// An outbound frame could not be encoded.
    #[error("could not encode frame: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(from: ConnectionState, to: ConnectionState, epoch: u64) -> StateTransition {
        StateTransition {
            from,
            to,
            at: Utc::now(),
            epoch,
        }
    }

    #[test]
    fn reconnect_detection() {
        use ConnectionState::*;
        assert!(!transition(Connecting, Connected, 1).is_reconnect());
        assert!(transition(Reconnecting, Connected, 2).is_reconnect());
        assert!(transition(Reconnecting, Connected, 1).is_reconnect());
        assert!(transition(Connecting, Connected, 2).is_reconnect());
        assert!(!transition(Connected, Reconnecting, 2).is_reconnect());
    }

    #[test]
    fn loss_detection() {
        use ConnectionState::*;
        assert!(transition(Connected, Reconnecting, 1).is_connection_loss());
        assert!(transition(Connected, Disconnected, 1).is_connection_loss());
        assert!(!transition(Reconnecting, Failed, 1).is_connection_loss());
    }

    #[test]
    fn active_states() {
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Failed.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
    }
}
