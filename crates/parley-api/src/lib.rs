//! # parley-api
//!
//! The realtime core's view of the outside world, minus the hub:
//!
//! - [`RealtimeApi`]: REST calls for initial state, resync, and mutations
//! - [`TokenProvider`]: bearer tokens for the hub and the API
//! - [`PushRegistrar`]: OS push subscription
//! - [`HttpApiClient`]: the `reqwest` implementation of both REST traits

#![deny(unsafe_code)]

pub mod auth;
pub mod errors;
pub mod http;
pub mod traits;

pub use auth::{AuthToken, StaticTokenProvider, TokenProvider};
pub use errors::{ApiError, ApiResult, AuthError};
pub use http::HttpApiClient;
pub use traits::{DeviceRegistration, PushRegistrar, RealtimeApi};
