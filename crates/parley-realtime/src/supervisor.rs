//! Reconnection supervisor.
//!
//! Watches connection transitions and keeps the slices honest across gaps:
//!
//! - every `Connected`: re-send presence subscriptions, disarm the call
//!   window;
//! - `Connected` after a gap (an earlier epoch, or failed attempts before
//!   the first one): resync presence, the notification head, and calls
//!   concurrently against the server;
//! - leaving `Connected`: abandon any resync in flight and arm the call
//!   window, which fails live calls if the link stays down too long.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use parley_settings::ResyncSettings;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::calls::{CallError, CallManager, ReconcileReport};
use crate::connection::{ConnectionInfo, ConnectionManager, ConnectionState, StateTransition};
use crate::notifications::{HeadMerge, NotificationError, NotificationStream};
use crate::presence::{PresenceCache, PresenceError};
use crate::scheduler::{TaskScheduler, TimerHandle};

const REPORT_CHANNEL_CAPACITY: usize = 16;

/// What one resync did. Each part fails independently.
#[derive(Clone, Debug, PartialEq)]
pub struct ResyncReport {
    /// Connected epoch the resync ran for.
    pub epoch: u64,
    /// When it finished.
    pub completed_at: DateTime<Utc>,
    /// Subscribed users refreshed.
    pub presence: Result<usize, PresenceError>,
    /// Notification head merge.
    pub notifications: Result<HeadMerge, NotificationError>,
    /// Call reconciliation.
    pub calls: Result<ReconcileReport, CallError>,
}

impl ResyncReport {
    /// Every part succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.presence.is_ok() && self.notifications.is_ok() && self.calls.is_ok()
    }
}

#[derive(Default)]
struct Tracking {
    last_epoch: u64,
    resync: Option<(u64, CancellationToken)>,
    resync_seq: u64,
    call_window: Option<TimerHandle>,
}

struct Inner {
    presence: PresenceCache,
    notifications: Arc<NotificationStream>,
    calls: CallManager,
    scheduler: TaskScheduler,
    on_reconnect: bool,
    call_window: Duration,
    tracking: Mutex<Tracking>,
    reports: broadcast::Sender<ResyncReport>,
}

/// Drives resync and call failure from connection transitions.
#[derive(Clone)]
pub struct ReconnectionSupervisor {
    inner: Arc<Inner>,
}

impl ReconnectionSupervisor {
    /// Supervisor over the given slices.
    #[must_use]
    pub fn new(
        presence: PresenceCache,
        notifications: Arc<NotificationStream>,
        calls: CallManager,
        scheduler: TaskScheduler,
        settings: &ResyncSettings,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                presence,
                notifications,
                calls,
                scheduler,
                on_reconnect: settings.on_reconnect,
                call_window: settings.call_resync_window(),
                tracking: Mutex::new(Tracking::default()),
                reports,
            }),
        }
    }

    /// Follow `connection`'s transitions until the scheduler shuts down.
    pub fn watch(&self, connection: &ConnectionManager) {
        let mut transitions = connection.subscribe_state();
        let connection = connection.clone();
        let supervisor = self.clone();
        self.inner.scheduler.spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(transition) => supervisor.on_transition(&transition),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed connection transitions, re-reading state");
                        supervisor.catch_up(&connection.info());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Resync reports from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResyncReport> {
        self.inner.reports.subscribe()
    }

    /// React to one connection transition.
    pub fn on_transition(&self, transition: &StateTransition) {
        if transition.to == ConnectionState::Connected {
            self.on_connected(transition);
        } else if transition.is_connection_loss() {
            self.on_lost(transition.to);
        }
    }

    /// Resync `presence`, notifications, and calls now and publish the report.
    pub async fn resync(&self, epoch: u64) -> ResyncReport {
        let (presence, notifications, calls) = tokio::join!(
            self.inner.presence.refresh_subscribed(),
            self.inner.notifications.reload_head(),
            self.inner.calls.resync(),
        );
        let report = ResyncReport {
            epoch,
            completed_at: Utc::now(),
            presence,
            notifications,
            calls,
        };

        if report.is_complete() {
            counter!("resync_total", "outcome" => "complete").increment(1);
            info!(epoch, "resync complete");
        } else {
            counter!("resync_total", "outcome" => "partial").increment(1);
            warn!(
                epoch,
                presence = ?report.presence.as_ref().err(),
                notifications = ?report.notifications.as_ref().err(),
                calls = ?report.calls.as_ref().err(),
                "resync incomplete"
            );
        }
        let _ = self.inner.reports.send(report.clone());
        report
    }

    fn on_connected(&self, transition: &StateTransition) {
        {
            let mut tracking = self.inner.tracking.lock();
            tracking.last_epoch = transition.epoch;
            if let Some(timer) = tracking.call_window.take() {
                timer.cancel();
            }
        }

        if let Err(error) = self.inner.presence.resubscribe() {
            debug!(%error, "presence resubscribe not sent");
        }
        if transition.is_reconnect() && self.inner.on_reconnect {
            self.start_resync(transition.epoch);
        }
    }

    fn on_lost(&self, to: ConnectionState) {
        let mut tracking = self.inner.tracking.lock();
        if let Some((_, token)) = tracking.resync.take() {
            debug!("connection lost, abandoning resync");
            counter!("resync_total", "outcome" => "abandoned").increment(1);
            token.cancel();
        }
        if tracking.call_window.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }

        let calls = self.inner.calls.clone();
        let window = self.inner.call_window;
        debug!(state = %to, ?window, "hub connection lost, arming call window");
        tracking.call_window = Some(self.inner.scheduler.spawn_after(window, async move {
            let _ = calls.connection_lost_all();
        }));
    }

    fn start_resync(&self, epoch: u64) {
        let token = self.inner.scheduler.child_token();
        let seq = {
            let mut tracking = self.inner.tracking.lock();
            tracking.resync_seq += 1;
            let seq = tracking.resync_seq;
            if let Some((_, previous)) = tracking.resync.replace((seq, token.clone())) {
                previous.cancel();
            }
            seq
        };

        let supervisor = self.clone();
        self.inner.scheduler.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                _ = supervisor.resync(epoch) => {
                    let mut tracking = supervisor.inner.tracking.lock();
                    if tracking.resync.as_ref().is_some_and(|(s, _)| *s == seq) {
                        tracking.resync = None;
                    }
                }
            }
        });
    }

    fn catch_up(&self, info: &ConnectionInfo) {
        let last_epoch = self.inner.tracking.lock().last_epoch;
        let (from, to) = if info.state == ConnectionState::Connected {
            if info.epoch == last_epoch {
                return;
            }
            (ConnectionState::Reconnecting, ConnectionState::Connected)
        } else {
            (ConnectionState::Connected, info.state)
        };
        self.on_transition(&StateTransition {
            from,
            to,
            at: Utc::now(),
            epoch: info.epoch,
        });
    }
}

impl std::fmt::Debug for ReconnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracking = self.inner.tracking.lock();
        f.debug_struct("ReconnectionSupervisor")
            .field("last_epoch", &tracking.last_epoch)
            .field("resync_in_flight", &tracking.resync.is_some())
            .field("call_window_armed", &tracking.call_window.is_some())
            .finish_non_exhaustive()
    }
}
