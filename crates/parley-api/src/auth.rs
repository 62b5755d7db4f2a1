//! Connection credentials.

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::AuthError;

/// A bearer token. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a raw token.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The raw value, for building headers.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Source of bearer tokens for the hub and the REST API.
///
/// `force_refresh` is set after the server rejected the previous token; the
/// provider must then go back to its issuer instead of returning a cached
/// value.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, refreshed first if `force_refresh`.
    async fn token(&self, force_refresh: bool) -> Result<AuthToken, AuthError>;
}

/// Token provider backed by a fixed value that can be swapped at runtime.
///
/// Used by the CLI (token from the command line) and by tests.
#[derive(Debug)]
pub struct StaticTokenProvider {
    current: Mutex<Option<AuthToken>>,
}

impl StaticTokenProvider {
    /// Provider that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(Some(AuthToken::new(token))),
        }
    }

    /// Provider that fails with [`AuthError::Unavailable`].
    #[must_use]
    pub fn signed_out() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Replace the token handed out from now on.
    pub fn set(&self, token: Option<AuthToken>) {
        *self.current.lock() = token;
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _force_refresh: bool) -> Result<AuthToken, AuthError> {
        self.current.lock().clone().ok_or(AuthError::Unavailable)
    }
}
