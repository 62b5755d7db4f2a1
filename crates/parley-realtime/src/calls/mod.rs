//! Call signaling.
//!
//! [`state`] holds the pure per-call state machine; [`manager`] owns the
//! sessions, timers, and the hub/REST side effects.

pub mod manager;
pub mod state;

pub use manager::{CallManager, CallUpdate, ReconcileReport};
pub use state::{CallDirection, CallError, CallInput, CallSession, CallState, Transition};
