//! Call signaling vocabulary shared by the REST client and the hub protocol.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CallId, ConversationId, UserId};

/// Connection parameters for the media server of one call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaParams {
    /// Short-lived media server token.
    pub token: String,
    /// Media server URL.
    pub server_url: String,
}

impl fmt::Debug for MediaParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaParams")
            .field("token", &"<redacted>")
            .field("server_url", &self.server_url)
            .finish()
    }
}

/// Per-participant connection and media flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantFlags {
    /// Participant's media connection is up.
    pub connected: bool,
    /// Microphone enabled.
    pub audio: bool,
    /// Camera enabled.
    pub video: bool,
}

impl Default for ParticipantFlags {
    fn default() -> Self {
        Self {
            connected: false,
            audio: true,
            video: true,
        }
    }
}

/// Action this client reports to the hub for a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    /// Accept an incoming invite.
    Accept,
    /// Decline an incoming invite.
    Reject,
    /// Hang up / cancel.
    End,
}

/// Call status according to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerCallStatus {
    /// Invite outstanding, nobody has answered yet.
    Ringing,
    /// Media session in progress.
    Active,
    /// Over.
    Ended,
}

/// Server view of a call involving the current user, returned by the
/// active-calls query used during resync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    /// Call id.
    pub call_id: CallId,
    /// Conversation the call belongs to.
    pub conversation_id: ConversationId,
    /// User who started the call.
    pub initiator: UserId,
    /// Current server status.
    pub status: ServerCallStatus,
    /// Users currently joined.
    #[serde(default)]
    pub participants: Vec<UserId>,
    /// When the call was created.
    pub started_at: DateTime<Utc>,
    /// When an unanswered invite stops ringing.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Media parameters, present for invites the user can still answer.
    #[serde(default)]
    pub media: Option<MediaParams>,
}

/// Response to starting a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStart {
    /// Id assigned by the server.
    pub call_id: CallId,
    /// Media parameters for the caller.
    pub media: MediaParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_params_debug_redacts_token() {
        let media = MediaParams {
            token: "secret-token".into(),
            server_url: "wss://media.example".into(),
        };
        let debug = format!("{media:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("wss://media.example"));
    }

    #[test]
    fn participant_flags_default_from_partial_json() {
        let flags: ParticipantFlags = serde_json::from_str(r#"{"connected":true}"#).unwrap();
        assert!(flags.connected);
        assert!(flags.audio);
        assert!(flags.video);
    }

    #[test]
    fn call_summary_deserializes() {
        let json = serde_json::json!({
            "callId": "call-1",
            "conversationId": "conv-1",
            "initiator": "alice",
            "status": "ringing",
            "startedAt": "2026-03-01T10:00:00Z",
            "expiresAt": "2026-03-01T10:00:45Z",
            "media": {"token": "t", "serverUrl": "wss://m"}
        });
        let summary: CallSummary = serde_json::from_value(json).unwrap();
        assert_eq!(summary.status, ServerCallStatus::Ringing);
        assert!(summary.participants.is_empty());
        assert!(summary.media.is_some());
    }

    #[test]
    fn call_action_wire_names() {
        assert_eq!(serde_json::to_string(&CallAction::Accept).unwrap(), "\"accept\"");
        assert_eq!(serde_json::to_string(&CallAction::End).unwrap(), "\"end\"");
    }
}
