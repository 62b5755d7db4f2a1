//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs to mention the fields it changes.

use std::fmt;
use std::time::Duration;

use parley_core::retry::BackoffConfig;
use serde::{Deserialize, Serialize};

/// Root settings for a Parley client session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Hub connection.
    pub hub: HubSettings,
    /// REST API client.
    pub api: ApiSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectSettings,
    /// Post-reconnect resync.
    pub resync: ResyncSettings,
    /// Call signaling.
    pub calls: CallSettings,
    /// Presence cache.
    pub presence: PresenceSettings,
    /// Notification feed.
    pub notifications: NotificationSettings,
    /// OS push registration.
    pub push: PushSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub
// ─────────────────────────────────────────────────────────────────────────────

/// A way of carrying hub frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Persistent WebSocket.
    #[serde(rename = "websocket")]
    WebSocket,
    /// HTTP long polling.
    #[serde(rename = "longPolling")]
    LongPolling,
}

impl TransportKind {
    /// Name used in settings and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::LongPolling => "longPolling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Base URL of the long-polling endpoints (`/negotiate`, `/poll`, `/send`).
    pub long_polling_url: String,
    /// Transports in preference order.
    pub transports: Vec<TransportKind>,
    /// Interval between keepalive pings.
    pub keepalive_interval_ms: u64,
    /// Link is considered dead if no pong arrives within this window.
    pub pong_timeout_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/hub".to_string(),
            long_polling_url: "http://127.0.0.1:8080/hub".to_string(),
            transports: vec![TransportKind::WebSocket, TransportKind::LongPolling],
            keepalive_interval_ms: 15_000,
            pong_timeout_ms: 30_000,
        }
    }
}

impl HubSettings {
    /// Keepalive ping interval.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Pong deadline.
    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API
// ─────────────────────────────────────────────────────────────────────────────

/// REST API settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Base URL all REST paths are joined onto.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl ApiSettings {
    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnect / resync
// ─────────────────────────────────────────────────────────────────────────────

/// Reconnect backoff settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// First retry delay.
    pub base_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Symmetric jitter, 0.0–1.0.
    pub jitter_factor: f64,
    /// Consecutive failures before the connection reports itself degraded.
    pub degraded_after_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            base_delay_ms: backoff.base_delay_ms,
            max_delay_ms: backoff.max_delay_ms,
            jitter_factor: backoff.jitter_factor,
            degraded_after_attempts: 5,
        }
    }
}

impl ReconnectSettings {
    /// Backoff parameters for the reconnect loop.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Resync settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResyncSettings {
    /// Re-fetch authoritative state after every reconnect.
    pub on_reconnect: bool,
    /// How long calls survive a dropped connection before failing.
    pub call_resync_window_ms: u64,
}

impl Default for ResyncSettings {
    fn default() -> Self {
        Self {
            on_reconnect: true,
            call_resync_window_ms: 20_000,
        }
    }
}

impl ResyncSettings {
    /// Grace period for calls while disconnected.
    #[must_use]
    pub fn call_resync_window(&self) -> Duration {
        Duration::from_millis(self.call_resync_window_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slices
// ─────────────────────────────────────────────────────────────────────────────

/// Call signaling settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallSettings {
    /// How long an invite rings, and how long media may take to connect.
    pub ring_timeout_ms: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout_ms: 45_000,
        }
    }
}

impl CallSettings {
    /// Ring / connect timeout.
    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }
}

/// Presence cache settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Window during which batched reads share one request.
    pub coalesce_window_ms: u64,
    /// Upper bound on user ids per batch request.
    pub max_batch_size: usize,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 25,
            max_batch_size: 200,
        }
    }
}

impl PresenceSettings {
    /// Coalescing window.
    #[must_use]
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// Notification feed settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    /// Items requested per page.
    pub page_size: u32,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { page_size: 30 }
    }
}

/// OS push registration. Disabled unless a device id is configured.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    /// Device id to register; generated and persisted by the embedding app.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Platform label sent with the registration (`ios`, `android`, `desktop`).
    pub platform: String,
    /// Platform push endpoint or token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            device_id: None,
            platform: "desktop".to_string(),
            endpoint: None,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` overrides).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = ParleySettings::default();
        assert_eq!(s.hub.url, "ws://127.0.0.1:8080/hub");
        assert_eq!(
            s.hub.transports,
            vec![TransportKind::WebSocket, TransportKind::LongPolling]
        );
        assert_eq!(s.hub.keepalive_interval(), Duration::from_secs(15));
        assert_eq!(s.hub.pong_timeout(), Duration::from_secs(30));
        assert_eq!(s.api.base_url, "http://127.0.0.1:8080/api");
        assert_eq!(s.reconnect.base_delay_ms, 500);
        assert_eq!(s.reconnect.max_delay_ms, 30_000);
        assert_eq!(s.reconnect.degraded_after_attempts, 5);
        assert!(s.resync.on_reconnect);
        assert_eq!(s.resync.call_resync_window(), Duration::from_secs(20));
        assert_eq!(s.calls.ring_timeout(), Duration::from_secs(45));
        assert_eq!(s.presence.coalesce_window(), Duration::from_millis(25));
        assert_eq!(s.presence.max_batch_size, 200);
        assert_eq!(s.notifications.page_size, 30);
        assert_eq!(s.logging.level, "warn");
        assert!(s.push.device_id.is_none());
    }

    #[test]
    fn camel_case_wire_names() {
        let json = serde_json::to_value(ParleySettings::default()).unwrap();
        assert!(json["hub"]["longPollingUrl"].is_string());
        assert_eq!(json["hub"]["transports"], serde_json::json!(["websocket", "longPolling"]));
        assert!(json["resync"]["callResyncWindowMs"].is_u64());
        assert!(json["push"].get("deviceId").is_none());
    }

    #[test]
    fn backoff_conversion() {
        let reconnect = ReconnectSettings {
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter_factor: 0.0,
            degraded_after_attempts: 3,
        };
        let backoff = reconnect.backoff();
        assert_eq!(backoff.base_delay_ms, 100);
        assert_eq!(backoff.max_delay_ms, 2_000);
    }
}
