//! Top-level error for callers that drive a whole session.

use parley_api::ApiError;
use parley_core::errors::{ErrorCategory, category_for_status};
use parley_core::events::DecodeError;
use parley_settings::SettingsError;
use thiserror::Error;

use crate::calls::CallError;
use crate::connection::{ConnectionError, TransportError};
use crate::notifications::NotificationError;
use crate::presence::PresenceError;

/// Anything a [`RealtimeSession`](crate::RealtimeSession) operation can fail with.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Settings could not be loaded.
    #[error(transparent)]
    Settings(#[from] SettingsError),
    /// A REST call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The hub connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// A presence fetch failed.
    #[error(transparent)]
    Presence(#[from] PresenceError),
    /// A notification operation failed.
    #[error(transparent)]
    Notification(#[from] NotificationError),
    /// A call operation failed.
    #[error(transparent)]
    Call(#[from] CallError),
    /// A hub frame could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Result alias for session-level operations.
pub type Result<T, E = ParleyError> = std::result::Result<T, E>;

fn transport_category(error: &TransportError) -> ErrorCategory {
    match error {
        TransportError::AuthRejected { .. } => ErrorCategory::Auth,
        TransportError::Http { status } => category_for_status(*status),
        TransportError::Connect(_)
        | TransportError::PongTimeout(_)
        | TransportError::Closed { .. }
        | TransportError::SessionGone
        | TransportError::Io(_) => ErrorCategory::Network,
    }
}

fn connection_category(error: &ConnectionError) -> ErrorCategory {
    match error {
        ConnectionError::Auth(_) => ErrorCategory::Auth,
        ConnectionError::Transport(e) => transport_category(e),
        ConnectionError::NotConnected => ErrorCategory::Network,
        ConnectionError::Stopped => ErrorCategory::Cancelled,
        ConnectionError::Encode(_) => ErrorCategory::Protocol,
    }
}

impl ParleyError {
    /// Classification for logging and retry decisions.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Settings(_) => ErrorCategory::Client,
            Self::Api(e)
            | Self::Presence(PresenceError::Api(e))
            | Self::Notification(NotificationError::Api(e))
            | Self::Call(CallError::Api(e)) => e.category(),
            Self::Connection(e) | Self::Call(CallError::Connection(e)) => connection_category(e),
            Self::Presence(PresenceError::Cancelled) => ErrorCategory::Cancelled,
            Self::Notification(NotificationError::UnknownId(_))
            | Self::Call(
                CallError::Terminal { .. }
                | CallError::InvalidTransition { .. }
                | CallError::UnknownCall(_)
                | CallError::Busy(_),
            ) => ErrorCategory::Client,
            Self::Decode(_) => ErrorCategory::Protocol,
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}
