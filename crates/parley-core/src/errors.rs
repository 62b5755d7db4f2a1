//! Error classification shared across the workspace.
//!
//! Each crate owns its own `thiserror` enums; this module only provides the
//! common [`ErrorCategory`] vocabulary they classify into, so callers can make
//! retry and surfacing decisions without matching on every concrete type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad error category used for logging and retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connectivity failure, timeout, connection reset.
    Network,
    /// Credentials rejected or unavailable.
    Auth,
    /// The peer sent something this client cannot interpret.
    Protocol,
    /// Server asked the client to slow down (429).
    RateLimit,
    /// Server-side failure (5xx).
    Server,
    /// Request rejected as invalid (4xx other than auth / rate limit).
    Client,
    /// The operation was cancelled locally.
    Cancelled,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Whether an operation failing with this category may succeed if retried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::Server)
    }

    /// Stable snake_case name, used as a metrics label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Protocol => "protocol",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Client => "client",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an HTTP status code.
///
/// Success codes map to [`ErrorCategory::Unknown`]; callers only ask about
/// statuses they already treat as failures.
#[must_use]
pub fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 => ErrorCategory::Network,
        429 => ErrorCategory::RateLimit,
        400..=499 => ErrorCategory::Client,
        500..=599 => ErrorCategory::Server,
        _ => ErrorCategory::Unknown,
    }
}
