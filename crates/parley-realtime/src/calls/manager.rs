//! Owns every [`CallSession`] of a session and drives them from local
//! actions, hub signals, timers, and resync.
//!
//! At most one non-terminal call exists per conversation. Local actions
//! move the session first and restore the previous snapshot if the REST or
//! hub call fails. Timers are armed for a specific state and do nothing if
//! the call has moved on by the time they fire.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use parley_api::RealtimeApi;
use parley_core::calls::{CallAction, CallSummary, ParticipantFlags, ServerCallStatus};
use parley_core::events::{CallEnded, CallInvite, CallParticipant, HubEvent, OutboundEvent, ParticipantJoined};
use parley_core::ids::{CallId, ConversationId, UserId};
use parley_settings::CallSettings;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::state::{CallDirection, CallError, CallInput, CallSession, CallState, Transition};
use crate::connection::HubSender;
use crate::router::EventHandler;
use crate::scheduler::{TaskScheduler, TimerHandle};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Published for every call state change.
#[derive(Clone, Debug, PartialEq)]
pub struct CallUpdate {
    /// Which call.
    pub call_id: CallId,
    /// What changed. `from == to` for participant updates.
    pub transition: Transition,
    /// Session after the change.
    pub session: CallSession,
}

/// Outcome of reconciling local calls with the server's active calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Local calls the server no longer has live, now `Ended`.
    pub force_ended: Vec<CallId>,
    /// Invites received during the gap that are still ringing.
    pub surfaced: Vec<CallId>,
    /// Invites received during the gap that already expired, now `Missed`.
    pub missed: Vec<CallId>,
}

impl ReconcileReport {
    /// Nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.force_ended.is_empty() && self.surfaced.is_empty() && self.missed.is_empty()
    }
}

struct CallEntry {
    session: CallSession,
    timer: Option<TimerHandle>,
}

impl CallEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

struct Inner {
    api: Arc<dyn RealtimeApi>,
    hub: Arc<dyn HubSender>,
    scheduler: TaskScheduler,
    ring_timeout: Duration,
    local_user: Option<UserId>,
    calls: Mutex<HashMap<CallId, CallEntry>>,
    updates: broadcast::Sender<CallUpdate>,
}

/// Call signaling for one session.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

fn busy_in(calls: &HashMap<CallId, CallEntry>, conversation: &ConversationId) -> bool {
    calls
        .values()
        .any(|e| e.session.conversation_id() == conversation && !e.session.state().is_terminal())
}

fn is_incoming_ringing(session: &CallSession) -> bool {
    session.state() == CallState::Ringing(CallDirection::Incoming)
}

impl CallManager {
    /// Manager for a session signed in as `local_user`, if known.
    #[must_use]
    pub fn new(
        api: Arc<dyn RealtimeApi>,
        hub: Arc<dyn HubSender>,
        scheduler: TaskScheduler,
        settings: &CallSettings,
        local_user: Option<UserId>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                hub,
                scheduler,
                ring_timeout: settings.ring_timeout(),
                local_user,
                calls: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Snapshot of one call.
    #[must_use]
    pub fn session(&self, call_id: &CallId) -> Option<CallSession> {
        self.inner.calls.lock().get(call_id).map(|e| e.session.clone())
    }

    /// Snapshots of every known call, oldest first.
    #[must_use]
    pub fn sessions(&self) -> Vec<CallSession> {
        let mut sessions: Vec<_> = self.inner.calls.lock().values().map(|e| e.session.clone()).collect();
        sessions.sort_by(|a, b| a.started_at().cmp(&b.started_at()).then_with(|| a.call_id().cmp(b.call_id())));
        sessions
    }

    /// The non-terminal call of a conversation, if any.
    #[must_use]
    pub fn live_call(&self, conversation: &ConversationId) -> Option<CallSession> {
        self.inner
            .calls
            .lock()
            .values()
            .find(|e| e.session.conversation_id() == conversation && !e.session.state().is_terminal())
            .map(|e| e.session.clone())
    }

    /// Whether the conversation already has a live call.
    #[must_use]
    pub fn is_busy(&self, conversation: &ConversationId) -> bool {
        busy_in(&self.inner.calls.lock(), conversation)
    }

    /// Call updates from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallUpdate> {
        self.inner.updates.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local actions
    // ─────────────────────────────────────────────────────────────────────

    /// Start a call in `conversation`.
    pub async fn initiate(&self, conversation: &ConversationId) -> Result<CallSession, CallError> {
        if self.is_busy(conversation) {
            return Err(CallError::Busy(conversation.clone()));
        }
        let start = self.inner.api.start_call(conversation).await?;

        let mut calls = self.inner.calls.lock();
        if busy_in(&calls, conversation) {
            // An invite for the same conversation won the race.
            drop(calls);
            warn!(call_id = %start.call_id, conversation_id = %conversation, "conversation became busy, cancelling new call");
            let _ = self.inner.hub.send(OutboundEvent::CallAction {
                call_id: start.call_id,
                action: CallAction::End,
            });
            return Err(CallError::Busy(conversation.clone()));
        }

        let mut session = CallSession::new(start.call_id.clone(), conversation.clone());
        let transition = session.apply(CallInput::Initiate {
            media: start.media,
            initiator: self.inner.local_user.clone(),
        })?;
        let timer = self.arm(&start.call_id, transition.to, self.inner.ring_timeout);
        self.publish(&session, transition);
        let snapshot = session.clone();
        let _ = calls.insert(
            start.call_id.clone(),
            CallEntry {
                session,
                timer: Some(timer),
            },
        );
        drop(calls);

        counter!("calls_started_total", "direction" => "outgoing").increment(1);
        info!(call_id = %start.call_id, conversation_id = %conversation, "outgoing call ringing");
        Ok(snapshot)
    }

    /// Answer an incoming call: join on the server, then tell the hub.
    pub async fn accept(&self, call_id: &CallId) -> Result<CallSession, CallError> {
        let before = self.begin(call_id, CallInput::Accept { by: None }, is_incoming_ringing)?;

        let joined = match self.inner.api.join_call(call_id).await {
            Ok(media) => self
                .inner
                .hub
                .send(OutboundEvent::CallAction {
                    call_id: call_id.clone(),
                    action: CallAction::Accept,
                })
                .map(|()| media)
                .map_err(CallError::from),
            Err(error) => Err(CallError::from(error)),
        };

        let media = match joined {
            Ok(media) => media,
            Err(error) => {
                warn!(call_id = %call_id, %error, "accept failed, restoring call");
                self.rollback(call_id, before, CallState::Connecting);
                return Err(error);
            }
        };

        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        if entry.session.state() == CallState::Connecting {
            entry.session.set_media(media);
            entry.cancel_timer();
            entry.timer = Some(self.arm(call_id, CallState::Connecting, self.inner.ring_timeout));
        }
        info!(call_id = %call_id, "call accepted");
        Ok(entry.session.clone())
    }

    /// Decline an incoming call.
    pub fn reject(&self, call_id: &CallId) -> Result<CallSession, CallError> {
        let before = self.begin(call_id, CallInput::Reject, is_incoming_ringing)?;
        if let Err(error) = self.inner.hub.send(OutboundEvent::CallAction {
            call_id: call_id.clone(),
            action: CallAction::Reject,
        }) {
            warn!(call_id = %call_id, %error, "reject not sent, restoring call");
            self.rollback(call_id, before, CallState::Rejected);
            return Err(error.into());
        }
        self.settle(call_id)
    }

    /// Hang up, or cancel an outgoing call that is still ringing.
    pub fn end(&self, call_id: &CallId) -> Result<CallSession, CallError> {
        let before = self.begin(call_id, CallInput::Hangup, |_| true)?;
        if let Err(error) = self.inner.hub.send(OutboundEvent::CallAction {
            call_id: call_id.clone(),
            action: CallAction::End,
        }) {
            warn!(call_id = %call_id, %error, "hangup not sent, restoring call");
            self.rollback(call_id, before, CallState::Ending);
            return Err(error.into());
        }

        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        let _ = self.drive(entry, CallInput::End);
        Ok(entry.session.clone())
    }

    /// The media layer connected.
    pub fn media_connected(&self, call_id: &CallId) -> Result<CallSession, CallError> {
        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        let transition = entry.session.apply(CallInput::MediaConnected)?;
        entry.cancel_timer();
        self.publish(&entry.session, transition);
        Ok(entry.session.clone())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection gaps
    // ─────────────────────────────────────────────────────────────────────

    /// Fail every live call. Returns the ids that moved to `Failed`.
    pub fn connection_lost_all(&self) -> Vec<CallId> {
        let mut calls = self.inner.calls.lock();
        let mut failed = Vec::new();
        for (call_id, entry) in calls.iter_mut() {
            if !entry.session.state().is_terminal() && self.drive(entry, CallInput::ConnectionLost).is_some() {
                failed.push(call_id.clone());
            }
        }
        drop(calls);

        if !failed.is_empty() {
            warn!(count = failed.len(), "hub connection lost, failing live calls");
        }
        failed.sort();
        failed
    }

    /// Fetch the server's active calls and reconcile.
    pub async fn resync(&self) -> Result<ReconcileReport, CallError> {
        let active = self.inner.api.active_calls().await?;
        Ok(self.reconcile(&active))
    }

    /// Reconcile local calls with the server's view after a gap.
    ///
    /// The server is authoritative: live local calls it does not list as
    /// live are force-ended. Ringing invites this client never saw are
    /// surfaced, or recorded as missed when they already expired. Calls the
    /// local user started are left alone.
    pub fn reconcile(&self, server: &[CallSummary]) -> ReconcileReport {
        let now = Utc::now();
        let live: HashMap<&CallId, &CallSummary> = server
            .iter()
            .filter(|s| s.status != ServerCallStatus::Ended)
            .map(|s| (&s.call_id, s))
            .collect();
        let mut report = ReconcileReport::default();

        let mut calls = self.inner.calls.lock();
        for (call_id, entry) in calls.iter_mut() {
            if entry.session.state().is_terminal() || live.contains_key(call_id) {
                continue;
            }
            if self.drive(entry, CallInput::ForceEnd).is_some() {
                counter!("calls_force_ended_total").increment(1);
                report.force_ended.push(call_id.clone());
            }
        }

        for summary in server {
            if summary.status != ServerCallStatus::Ringing
                || calls.contains_key(&summary.call_id)
                || self.is_local(&summary.initiator)
            {
                continue;
            }
            if busy_in(&calls, &summary.conversation_id) {
                debug!(call_id = %summary.call_id, "missed invite for busy conversation skipped");
                continue;
            }

            let mut session = CallSession::new(summary.call_id.clone(), summary.conversation_id.clone());
            let invite = CallInput::IncomingInvite {
                caller: summary.initiator.clone(),
                media: summary.media.clone(),
                participants: summary
                    .participants
                    .iter()
                    .filter(|u| !self.is_local(u))
                    .cloned()
                    .collect(),
            };
            let transition = match session.apply(invite) {
                Ok(transition) => transition,
                Err(error) => {
                    warn!(call_id = %summary.call_id, %error, "could not surface missed invite");
                    continue;
                }
            };
            self.publish(&session, transition);

            let mut entry = CallEntry { session, timer: None };
            if summary.expires_at.is_some_and(|at| at <= now) {
                if self.drive(&mut entry, CallInput::Timeout).is_some() {
                    report.missed.push(summary.call_id.clone());
                }
            } else {
                let delay = self.ring_delay(summary.expires_at);
                entry.timer = Some(self.arm(&summary.call_id, transition.to, delay));
                report.surfaced.push(summary.call_id.clone());
            }
            let _ = calls.insert(summary.call_id.clone(), entry);
        }
        drop(calls);

        report.force_ended.sort();
        report.surfaced.sort();
        report.missed.sort();
        if !report.is_empty() {
            info!(
                force_ended = report.force_ended.len(),
                surfaced = report.surfaced.len(),
                missed = report.missed.len(),
                "calls reconciled"
            );
        }
        report
    }

    // ─────────────────────────────────────────────────────────────────────
    // Hub signals
    // ─────────────────────────────────────────────────────────────────────

    fn on_invite(&self, invite: &CallInvite) {
        if self.is_local(&invite.caller_id) {
            trace!(call_id = %invite.call_id, "own invite echoed, ignoring");
            return;
        }
        let mut calls = self.inner.calls.lock();
        if calls.contains_key(&invite.call_id) {
            trace!(call_id = %invite.call_id, "duplicate call invite");
            return;
        }
        if busy_in(&calls, &invite.conversation_id) {
            drop(calls);
            info!(call_id = %invite.call_id, conversation_id = %invite.conversation_id, "conversation busy, auto-rejecting invite");
            counter!("calls_auto_rejected_total").increment(1);
            if let Err(error) = self.inner.hub.send(OutboundEvent::CallAction {
                call_id: invite.call_id.clone(),
                action: CallAction::Reject,
            }) {
                warn!(call_id = %invite.call_id, %error, "auto-reject not sent");
            }
            return;
        }

        let mut session = CallSession::new(invite.call_id.clone(), invite.conversation_id.clone());
        let transition = match session.apply(CallInput::IncomingInvite {
            caller: invite.caller_id.clone(),
            media: Some(invite.media.clone()),
            participants: invite.participants.iter().filter(|u| !self.is_local(u)).cloned().collect(),
        }) {
            Ok(transition) => transition,
            Err(error) => {
                warn!(call_id = %invite.call_id, %error, "invalid call invite");
                return;
            }
        };
        let timer = self.arm(&invite.call_id, transition.to, self.ring_delay(invite.expires_at));
        self.publish(&session, transition);
        let _ = calls.insert(
            invite.call_id.clone(),
            CallEntry {
                session,
                timer: Some(timer),
            },
        );
        drop(calls);

        counter!("calls_started_total", "direction" => "incoming").increment(1);
        info!(call_id = %invite.call_id, caller = %invite.caller_id, "incoming call ringing");
    }

    fn on_accepted(&self, signal: &CallParticipant) {
        let local = self.is_local(&signal.user_id);
        self.with_call(&signal.call_id, |entry| match (entry.session.state(), local) {
            (CallState::Ringing(CallDirection::Outgoing), false) => {
                if let Some(transition) = self.drive(
                    entry,
                    CallInput::Accept {
                        by: Some(signal.user_id.clone()),
                    },
                ) {
                    entry.cancel_timer();
                    entry.timer = Some(self.arm(&signal.call_id, transition.to, self.inner.ring_timeout));
                }
            }
            (CallState::Ringing(CallDirection::Incoming), true) => {
                info!(call_id = %signal.call_id, "call answered on another device");
                let _ = self.drive(entry, CallInput::ForceEnd);
            }
            (_, true) => {}
            (_, false) => {
                let _ = self.drive(
                    entry,
                    CallInput::ParticipantJoined {
                        user: signal.user_id.clone(),
                        flags: ParticipantFlags {
                            connected: true,
                            ..ParticipantFlags::default()
                        },
                    },
                );
            }
        });
    }

    fn on_rejected(&self, signal: &CallParticipant) {
        let local = self.is_local(&signal.user_id);
        self.with_call(&signal.call_id, |entry| match (entry.session.state(), local) {
            (CallState::Ringing(CallDirection::Outgoing), false) => {
                let nobody_else = entry.session.participants().keys().all(|u| *u == signal.user_id);
                if nobody_else {
                    let _ = self.drive(entry, CallInput::Reject);
                } else {
                    self.leave(entry, &signal.user_id);
                }
            }
            (CallState::Ringing(CallDirection::Incoming), true) => {
                info!(call_id = %signal.call_id, "call declined on another device");
                let _ = self.drive(entry, CallInput::Reject);
            }
            (_, true) => {}
            (_, false) => self.leave(entry, &signal.user_id),
        });
    }

    fn on_ended(&self, signal: &CallEnded) {
        self.with_call(&signal.call_id, |entry| {
            debug!(call_id = %signal.call_id, reason = signal.reason.as_deref(), "call ended remotely");
            if entry.session.state() != CallState::Ending && self.drive(entry, CallInput::Hangup).is_none() {
                return;
            }
            let _ = self.drive(entry, CallInput::End);
        });
    }

    fn on_participant_joined(&self, signal: &ParticipantJoined) {
        if self.is_local(&signal.user_id) {
            return;
        }
        self.with_call(&signal.call_id, |entry| {
            let _ = self.drive(
                entry,
                CallInput::ParticipantJoined {
                    user: signal.user_id.clone(),
                    flags: signal.flags,
                },
            );
        });
    }

    fn on_participant_left(&self, signal: &CallParticipant) {
        if self.is_local(&signal.user_id) {
            return;
        }
        self.with_call(&signal.call_id, |entry| self.leave(entry, &signal.user_id));
    }

    fn leave(&self, entry: &mut CallEntry, user: &UserId) {
        let left = self.drive(entry, CallInput::ParticipantLeft { user: user.clone() });
        if left.is_some_and(|t| t.to == CallState::Ending) {
            let _ = self.drive(entry, CallInput::End);
        }
    }

    fn on_timeout(&self, call_id: &CallId, armed_for: CallState) {
        let mut calls = self.inner.calls.lock();
        let Some(entry) = calls.get_mut(call_id) else {
            return;
        };
        if entry.session.state() != armed_for {
            return;
        }
        entry.timer = None;
        let Some(transition) = self.drive(entry, CallInput::Timeout) else {
            return;
        };
        drop(calls);

        counter!("call_timeouts_total", "state" => transition.from.as_str()).increment(1);
        info!(call_id = %call_id, from = %transition.from, to = %transition.to, "call timed out");
        if armed_for != CallState::Ringing(CallDirection::Incoming) {
            let _ = self.inner.hub.send(OutboundEvent::CallAction {
                call_id: call_id.clone(),
                action: CallAction::End,
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────

    fn is_local(&self, user: &UserId) -> bool {
        self.inner.local_user.as_ref() == Some(user)
    }

    fn ring_delay(&self, expires_at: Option<DateTime<Utc>>) -> Duration {
        expires_at.map_or(self.inner.ring_timeout, |at| {
            (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.inner.ring_timeout)
        })
    }

    fn with_call(&self, call_id: &CallId, f: impl FnOnce(&mut CallEntry)) {
        let mut calls = self.inner.calls.lock();
        match calls.get_mut(call_id) {
            Some(entry) => f(entry),
            None => debug!(call_id = %call_id, "signal for unknown call ignored"),
        }
    }

    /// Apply an input from a signal or timer. Invalid inputs are logged.
    fn drive(&self, entry: &mut CallEntry, input: CallInput) -> Option<Transition> {
        let name = input.name();
        match entry.session.apply(input) {
            Ok(transition) => {
                if transition.to.is_terminal() {
                    entry.cancel_timer();
                }
                self.publish(&entry.session, transition);
                Some(transition)
            }
            Err(error) => {
                debug!(call_id = %entry.session.call_id(), input = name, %error, "call input ignored");
                None
            }
        }
    }

    /// Apply a local action optimistically. Returns the snapshot to restore.
    fn begin(
        &self,
        call_id: &CallId,
        input: CallInput,
        allowed: impl FnOnce(&CallSession) -> bool,
    ) -> Result<CallSession, CallError> {
        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        let state = entry.session.state();
        if !state.is_terminal() && !allowed(&entry.session) {
            return Err(CallError::InvalidTransition {
                call_id: call_id.clone(),
                state,
                input: input.name(),
            });
        }
        let before = entry.session.clone();
        let transition = entry.session.apply(input)?;
        self.publish(&entry.session, transition);
        Ok(before)
    }

    /// Restore `before` unless the call has left `expected` in the meantime.
    fn rollback(&self, call_id: &CallId, before: CallSession, expected: CallState) {
        let mut calls = self.inner.calls.lock();
        let Some(entry) = calls.get_mut(call_id) else {
            return;
        };
        if entry.session.state() != expected {
            debug!(call_id = %call_id, state = %entry.session.state(), "call moved on, not restoring");
            return;
        }
        let transition = Transition {
            from: expected,
            to: before.state(),
        };
        entry.session = before;
        entry.cancel_timer();
        if matches!(transition.to, CallState::Ringing(_) | CallState::Connecting) {
            entry.timer = Some(self.arm(call_id, transition.to, self.inner.ring_timeout));
        }
        self.publish(&entry.session, transition);
    }

    fn settle(&self, call_id: &CallId) -> Result<CallSession, CallError> {
        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        if entry.session.state().is_terminal() {
            entry.cancel_timer();
        }
        Ok(entry.session.clone())
    }

    fn arm(&self, call_id: &CallId, armed_for: CallState, delay: Duration) -> TimerHandle {
        let manager = self.clone();
        let call_id = call_id.clone();
        self.inner
            .scheduler
            .spawn_after(delay, async move { manager.on_timeout(&call_id, armed_for) })
    }

    fn publish(&self, session: &CallSession, transition: Transition) {
        trace!(call_id = %session.call_id(), from = %transition.from, to = %transition.to, "call transition");
        let _ = self.inner.updates.send(CallUpdate {
            call_id: session.call_id().clone(),
            transition,
            session: session.clone(),
        });
    }
}

impl EventHandler for CallManager {
    fn handle(&self, event: &HubEvent) {
        match event {
            HubEvent::CallInvite(invite) => self.on_invite(invite),
            HubEvent::CallAccepted(signal) => self.on_accepted(signal),
            HubEvent::CallRejected(signal) => self.on_rejected(signal),
            HubEvent::CallEnded(signal) => self.on_ended(signal),
            HubEvent::ParticipantJoined(signal) => self.on_participant_joined(signal),
            HubEvent::ParticipantLeft(signal) => self.on_participant_left(signal),
            _ => {}
        }
    }
}

impl fmt::Debug for CallManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallManager")
            .field("calls", &self.inner.calls.lock().len())
            .field("local_user", &self.inner.local_user)
            .finish_non_exhaustive()
    }
}
