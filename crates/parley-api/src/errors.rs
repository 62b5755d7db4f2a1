//! API error types.

use parley_core::errors::{ErrorCategory, category_for_status};
use thiserror::Error;

/// Result alias for REST calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// A failed REST call.
///
/// `Clone` so one failed request can be reported to every caller that was
/// waiting on it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("network error: {message}")]
    Network {
        /// Transport-level description.
        message: String,
    },

    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// Credentials were rejected even after a refresh.
    #[error("unauthorized ({status})")]
    Unauthorized {
        /// 401 or 403.
        status: u16,
    },

    /// The server asked the client to back off.
    #[error("rate limited")]
    RateLimited {
        /// Delay suggested by `Retry-After`, if any.
        retry_after_ms: Option<u64>,
    },

    /// The server returned another non-success status.
    #[error("API error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        message: String,
    },

    /// The response body did not match the expected schema.
    #[error("invalid response body: {message}")]
    Decode {
        /// Parser message.
        message: String,
    },

    /// Credentials could not be obtained at all.
    #[error("no credentials: {0}")]
    Auth(#[from] AuthError),

    /// The configured base URL is unusable.
    #[error("invalid base URL {url}: {message}")]
    InvalidUrl {
        /// The configured value.
        url: String,
        /// Why it was rejected.
        message: String,
    },
}

impl ApiError {
    /// Classification for logging and retry decisions.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } | Self::Timeout => ErrorCategory::Network,
            Self::Unauthorized { .. } | Self::Auth(_) => ErrorCategory::Auth,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Status { status, .. } => category_for_status(*status),
            Self::Decode { .. } => ErrorCategory::Protocol,
            Self::InvalidUrl { .. } => ErrorCategory::Client,
        }
    }

    /// Whether the same request may succeed later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode {
                message: err.to_string(),
            }
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}

/// Failure to obtain a connection/API token.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The user is signed out.
    #[error("no credentials available")]
    Unavailable,

    /// The refresh round-trip failed.
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(ApiError::Timeout.category(), ErrorCategory::Network);
        assert_eq!(
            ApiError::Unauthorized { status: 401 }.category(),
            ErrorCategory::Auth
        );
        assert_eq!(
            ApiError::Status {
                status: 502,
                message: String::new()
            }
            .category(),
            ErrorCategory::Server
        );
        assert_eq!(
            ApiError::Decode {
                message: "x".into()
            }
            .category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            ApiError::from(AuthError::Unavailable).category(),
            ErrorCategory::Auth
        );
    }

    #[test]
    fn retryability() {
        assert!(ApiError::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(
            !ApiError::Status {
                status: 404,
                message: "gone".into()
            }
            .is_retryable()
        );
    }
}
