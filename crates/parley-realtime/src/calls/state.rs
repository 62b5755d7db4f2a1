//! Call state machine.
//!
//! [`CallSession::apply`] is pure: it validates one input against the
//! current state and either moves the session or leaves it untouched and
//! returns an error. Timers, network calls, and notification live in
//! [`CallManager`](super::CallManager).
//!
//! ```text
//! Idle ──Initiate──▶ Ringing(Outgoing) ─┐
//! Idle ──IncomingInvite──▶ Ringing(Incoming) ─┤
//!                                          ├─Accept──▶ Connecting ──MediaConnected──▶ Active
//!                                          ├─Reject──▶ Rejected
//!                                          └─Timeout─▶ Missed
//! Connecting ──Timeout──▶ Failed
//! Ringing | Connecting | Active ──Hangup──▶ Ending ──End──▶ Ended
//! any non-terminal ──ConnectionLost──▶ Failed
//! any non-terminal ──ForceEnd──▶ Ended
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parley_api::ApiError;
use parley_core::calls::{MediaParams, ParticipantFlags};
use parley_core::ids::{CallId, ConversationId, UserId};
use thiserror::Error;

use crate::connection::ConnectionError;

/// Who placed the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallDirection {
    /// This client called out.
    Outgoing,
    /// Someone called this client.
    Incoming,
}

/// Lifecycle state of one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Created, nothing applied yet.
    Idle,
    /// Invite outstanding.
    Ringing(CallDirection),
    /// Answered; waiting for media.
    Connecting,
    /// Media flowing.
    Active,
    /// Local hangup sent, waiting to finish.
    Ending,
    /// Finished normally.
    Ended,
    /// Declined.
    Rejected,
    /// Nobody answered in time.
    Missed,
    /// Media never connected, or the connection was lost for too long.
    Failed,
}

impl CallState {
    /// Terminal states accept no further input.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Missed | Self::Failed)
    }

    /// Short name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ringing(CallDirection::Outgoing) => "ringing-outgoing",
            Self::Ringing(CallDirection::Incoming) => "ringing-incoming",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallInput {
    /// This client started the call.
    Initiate {
        /// Media parameters from `start_call`.
        media: MediaParams,
        /// The local user, if known.
        initiator: Option<UserId>,
    },
    /// The hub delivered an invite.
    IncomingInvite {
        /// Who is calling.
        caller: UserId,
        /// Media parameters, when the invite carried them.
        media: Option<MediaParams>,
        /// Others already in the call.
        participants: Vec<UserId>,
    },
    /// The call was answered (remotely for outgoing, locally for incoming).
    Accept {
        /// Who answered, when it was a remote participant.
        by: Option<UserId>,
    },
    /// The media layer reported a connected session.
    MediaConnected,
    /// The invite was declined.
    Reject,
    /// The ring or connect timer fired.
    Timeout,
    /// A participant joined or changed media flags.
    ParticipantJoined {
        /// Participant.
        user: UserId,
        /// Their flags.
        flags: ParticipantFlags,
    },
    /// A participant left.
    ParticipantLeft {
        /// Participant.
        user: UserId,
    },
    /// Local hangup.
    Hangup,
    /// The call is over.
    End,
    /// The hub connection stayed down past the resync window.
    ConnectionLost,
    /// Resync found the call over on the server.
    ForceEnd,
}

impl CallInput {
    /// Short name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiate { .. } => "initiate",
            Self::IncomingInvite { .. } => "incoming-invite",
            Self::Accept { .. } => "accept",
            Self::MediaConnected => "media-connected",
            Self::Reject => "reject",
            Self::Timeout => "timeout",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::Hangup => "hangup",
            Self::End => "end",
            Self::ConnectionLost => "connection-lost",
            Self::ForceEnd => "force-end",
        }
    }
}

/// A state change produced by [`CallSession::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State before.
    pub from: CallState,
    /// State after. Equal to `from` for participant updates.
    pub to: CallState,
}

/// Call signaling failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    /// The call already finished.
    #[error("call {call_id} is {state}")]
    Terminal {
        /// Call id.
        call_id: CallId,
        /// Its terminal state.
        state: CallState,
    },
    /// The input is not allowed in the current state.
    #[error("{input} not allowed while call {call_id} is {state}")]
    InvalidTransition {
        /// Call id.
        call_id: CallId,
        /// Current state.
        state: CallState,
        /// Rejected input.
        input: &'static str,
    },
    /// No such call.
    #[error("unknown call {0}")]
    UnknownCall(CallId),
    /// The conversation already has a live call.
    #[error("conversation {0} already has a call in progress")]
    Busy(ConversationId),
    /// The REST call failed; the session was restored.
    #[error("call request failed: {0}")]
    Api(#[from] ApiError),
    /// The hub frame could not be sent; the session was restored.
    #[error("call signal not sent: {0}")]
    Connection(#[from] ConnectionError),
}

/// One call from this client's point of view.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSession {
    call_id: CallId,
    conversation_id: ConversationId,
    state: CallState,
    participants: BTreeMap<UserId, ParticipantFlags>,
    initiator: Option<UserId>,
    started_at: DateTime<Utc>,
    direction: Option<CallDirection>,
    media: Option<MediaParams>,
}

impl CallSession {
    /// Fresh session in `Idle`.
    #[must_use]
    pub fn new(call_id: CallId, conversation_id: ConversationId) -> Self {
        Self {
            call_id,
            conversation_id,
            state: CallState::Idle,
            participants: BTreeMap::new(),
            initiator: None,
            started_at: Utc::now(),
            direction: None,
            media: None,
        }
    }

    /// Call id.
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Conversation the call belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Remote participants and their media flags.
    #[must_use]
    pub fn participants(&self) -> &BTreeMap<UserId, ParticipantFlags> {
        &self.participants
    }

    /// Who started the call, if known.
    #[must_use]
    pub fn initiator(&self) -> Option<&UserId> {
        self.initiator.as_ref()
    }

    /// When this client first saw the call.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Outgoing or incoming; `None` while `Idle`.
    #[must_use]
    pub fn direction(&self) -> Option<CallDirection> {
        self.direction
    }

    /// Media parameters for joining, once known.
    #[must_use]
    pub fn media(&self) -> Option<&MediaParams> {
        self.media.as_ref()
    }

    /// Attach media parameters (from `join_call`).
    pub fn set_media(&mut self, media: MediaParams) {
        self.media = Some(media);
    }

    /// Apply one input.
    pub fn apply(&mut self, input: CallInput) -> Result<Transition, CallError> {
        use CallDirection::{Incoming, Outgoing};
        use CallState::{Active, Connecting, Ended, Ending, Failed, Idle, Missed, Rejected, Ringing};

        let from = self.state;
        if from.is_terminal() {
            return Err(CallError::Terminal {
                call_id: self.call_id.clone(),
                state: from,
            });
        }

        let to = match (from, input) {
            (Idle, CallInput::Initiate { media, initiator }) => {
                self.media = Some(media);
                self.initiator = initiator;
                self.direction = Some(Outgoing);
                Ringing(Outgoing)
            }
            (
                Idle,
                CallInput::IncomingInvite {
                    caller,
                    media,
                    participants,
                },
            ) => {
                self.media = media;
                self.direction = Some(Incoming);
                let _ = self.participants.insert(caller.clone(), ParticipantFlags::default());
                for user in participants {
                    let _ = self.participants.entry(user).or_default();
                }
                self.initiator = Some(caller);
                Ringing(Incoming)
            }
            (Ringing(_), CallInput::Accept { by }) => {
                if let Some(user) = by {
                    let _ = self.participants.entry(user).or_default();
                }
                Connecting
            }
            (Connecting, CallInput::MediaConnected) => Active,
            (Ringing(_), CallInput::Reject) => Rejected,
            (Ringing(_), CallInput::Timeout) => Missed,
            (Connecting, CallInput::Timeout) => Failed,
            (state @ (Ringing(_) | Connecting | Active), CallInput::ParticipantJoined { user, flags }) => {
                let _ = self.participants.insert(user, flags);
                state
            }
            (state @ (Ringing(_) | Connecting), CallInput::ParticipantLeft { user }) => {
                let _ = self.participants.remove(&user);
                state
            }
            (Active, CallInput::ParticipantLeft { user }) => {
                let _ = self.participants.remove(&user);
                if self.participants.is_empty() { Ending } else { Active }
            }
            (Ringing(_) | Connecting | Active, CallInput::Hangup) => Ending,
            (Ringing(_) | Connecting | Active | Ending, CallInput::End) => Ended,
            (_, CallInput::ConnectionLost) => Failed,
            (_, CallInput::ForceEnd) => Ended,
            (state, other) => {
                return Err(CallError::InvalidTransition {
                    call_id: self.call_id.clone(),
                    state,
                    input: other.name(),
                });
            }
        };

        self.state = to;
        Ok(Transition { from, to })
    }
}
