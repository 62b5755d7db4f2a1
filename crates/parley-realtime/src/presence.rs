//! Presence cache.
//!
//! Per-user status with last-write-wins semantics. Reads are answered from
//! memory; misses go through a coalescer that merges every request made
//! within `coalesce_window` into one `presence_batch` round-trip (split into
//! `max_batch_size` chunks).
//!
//! Every write bumps a sequence number. A batch records the sequence when it
//! is dispatched and skips entries written after that, so a live
//! `presence-changed` that arrives while a fetch is in flight is never
//! overwritten by the older server snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use parley_api::{ApiError, RealtimeApi};
use parley_core::events::{HubEvent, OutboundEvent};
use parley_core::ids::UserId;
use parley_core::presence::PresenceStatus;
use parley_settings::PresenceSettings;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionError, HubSender};
use crate::router::EventHandler;
use crate::scheduler::TaskScheduler;

/// Why a presence fetch failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
    /// The batch request failed.
    #[error("presence fetch failed: {0}")]
    Api(#[from] ApiError),
    /// The session shut down before the batch ran.
    #[error("presence fetch cancelled")]
    Cancelled,
}

type BatchResult = Result<Arc<HashMap<UserId, PresenceStatus>>, PresenceError>;

#[derive(Clone, Copy, Debug)]
struct PresenceEntry {
    status: PresenceStatus,
    updated_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<UserId, PresenceEntry>,
    seq: u64,
}

struct PendingBatch {
    users: HashSet<UserId>,
    waiters: Vec<oneshot::Sender<BatchResult>>,
}

struct Inner {
    api: Arc<dyn RealtimeApi>,
    hub: Arc<dyn HubSender>,
    settings: PresenceSettings,
    scheduler: TaskScheduler,
    entries: RwLock<Entries>,
    watchers: Mutex<HashMap<UserId, watch::Sender<PresenceStatus>>>,
    pending: Mutex<Option<PendingBatch>>,
}

/// Session-scoped presence state.
#[derive(Clone)]
pub struct PresenceCache {
    inner: Arc<Inner>,
}

impl PresenceCache {
    /// Empty cache.
    #[must_use]
    pub fn new(
        api: Arc<dyn RealtimeApi>,
        hub: Arc<dyn HubSender>,
        settings: PresenceSettings,
        scheduler: TaskScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                hub,
                settings,
                scheduler,
                entries: RwLock::new(Entries::default()),
                watchers: Mutex::new(HashMap::new()),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Cached status. Unknown users read as `Offline`.
    #[must_use]
    pub fn status(&self, user: &UserId) -> PresenceStatus {
        self.inner
            .entries
            .read()
            .map
            .get(user)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    /// When `user`'s status was last written, if ever.
    #[must_use]
    pub fn updated_at(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.inner.entries.read().map.get(user).map(|e| e.updated_at)
    }

    /// Cached statuses for `users`, read under one lock. No network.
    #[must_use]
    pub fn statuses(&self, users: &[UserId]) -> HashMap<UserId, PresenceStatus> {
        let entries = self.inner.entries.read();
        users
            .iter()
            .map(|u| {
                let status = entries.map.get(u).map(|e| e.status).unwrap_or_default();
                (u.clone(), status)
            })
            .collect()
    }

    /// Statuses for `users`, fetching the ones never seen before.
    pub async fn get_statuses(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, PresenceStatus>, PresenceError> {
        let missing: Vec<UserId> = {
            let entries = self.inner.entries.read();
            users
                .iter()
                .filter(|u| !entries.map.contains_key(*u))
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            let _ = self.fetch(missing).await?;
        }
        Ok(self.statuses(users))
    }

    /// Round-trip for `users` even if cached. Returns the server's answer.
    pub async fn refresh_batch(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, PresenceStatus>, PresenceError> {
        if users.is_empty() {
            return Ok(HashMap::new());
        }
        let all = self.fetch(users.to_vec()).await?;
        Ok(users
            .iter()
            .filter_map(|u| all.get(u).map(|s| (u.clone(), *s)))
            .collect())
    }

    /// Refresh every user with a live subscriber. Returns how many were refreshed.
    pub async fn refresh_subscribed(&self) -> Result<usize, PresenceError> {
        let users = self.subscribed_users();
        let refreshed = self.refresh_batch(&users).await?;
        debug!(users = refreshed.len(), "presence refreshed");
        Ok(refreshed.len())
    }

    /// Watch `user`'s status.
    ///
    /// The first live subscriber for a user asks the hub for pushes; an
    /// unknown user is fetched in the background.
    pub fn subscribe(&self, user: &UserId) -> watch::Receiver<PresenceStatus> {
        let current = self.status(user);
        let (rx, first) = {
            let mut watchers = self.inner.watchers.lock();
            let sender = watchers
                .entry(user.clone())
                .or_insert_with(|| watch::channel(current).0);
            let first = sender.receiver_count() == 0;
            (sender.subscribe(), first)
        };

        if first {
            self.send_subscription(vec![user.clone()]);
        }
        if !self.inner.entries.read().map.contains_key(user) {
            // Result arrives through the watch channel.
            drop(self.enqueue(std::iter::once(user.clone())));
        }
        rx
    }

    /// Users with at least one live subscriber.
    #[must_use]
    pub fn subscribed_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .inner
            .watchers
            .lock()
            .iter()
            .filter(|(_, tx)| tx.receiver_count() > 0)
            .map(|(u, _)| u.clone())
            .collect();
        users.sort();
        users
    }

    /// Ask the hub again for pushes about every subscribed user.
    pub fn resubscribe(&self) -> Result<(), ConnectionError> {
        let users = self.subscribed_users();
        if users.is_empty() {
            return Ok(());
        }
        self.inner
            .hub
            .send(OutboundEvent::SubscribeToPresence { user_ids: users })
    }

    /// Apply a live presence change. The latest call always wins.
    pub fn apply_event(&self, user: &UserId, status: PresenceStatus, at: Option<DateTime<Utc>>) {
        {
            let mut entries = self.inner.entries.write();
            entries.seq += 1;
            let seq = entries.seq;
            let _ = entries.map.insert(
                user.clone(),
                PresenceEntry {
                    status,
                    updated_at: at.unwrap_or_else(Utc::now),
                    seq,
                },
            );
        }
        trace!(user_id = %user, %status, "presence changed");
        self.inner.notify(user, status);
    }

    fn send_subscription(&self, user_ids: Vec<UserId>) {
        match self
            .inner
            .hub
            .send(OutboundEvent::SubscribeToPresence { user_ids })
        {
            Ok(()) => {}
            // Re-sent by the supervisor on the next connect.
            Err(ConnectionError::NotConnected) => {}
            Err(error) => warn!(%error, "could not subscribe to presence"),
        }
    }

    async fn fetch(&self, users: Vec<UserId>) -> BatchResult {
        let shutdown = self.inner.scheduler.child_token();
        let answer = self.enqueue(users);
        tokio::select! {
            () = shutdown.cancelled() => Err(PresenceError::Cancelled),
            result = answer => result.unwrap_or(Err(PresenceError::Cancelled)),
        }
    }

    /// Join the open batch, or open one and schedule its flush.
    fn enqueue(&self, users: impl IntoIterator<Item = UserId>) -> oneshot::Receiver<BatchResult> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.inner.pending.lock();
        if let Some(batch) = pending.as_mut() {
            batch.users.extend(users);
            batch.waiters.push(tx);
        } else {
            *pending = Some(PendingBatch {
                users: users.into_iter().collect(),
                waiters: vec![tx],
            });
            let inner = Arc::clone(&self.inner);
            let _ = self
                .inner
                .scheduler
                .spawn_after(self.inner.settings.coalesce_window(), async move {
                    inner.flush().await;
                });
        }
        rx
    }
}

impl Inner {
    async fn flush(&self) {
        let Some(batch) = self.pending.lock().take() else {
            return;
        };
        let start_seq = self.entries.read().seq;
        let mut users: Vec<UserId> = batch.users.into_iter().collect();
        users.sort();
        let chunk_size = self.settings.max_batch_size.max(1);

        let requests = users.chunks(chunk_size).map(|chunk| {
            counter!("presence_batches_total").increment(1);
            self.api.presence_batch(chunk)
        });
        let results = join_all(requests).await;

        let mut merged = HashMap::with_capacity(users.len());
        let mut failure = None;
        for (chunk, result) in users.chunks(chunk_size).zip(results) {
            match result {
                Ok(statuses) => {
                    for user in chunk {
                        // Omitted users are offline.
                        let status = statuses.get(user).copied().unwrap_or_default();
                        let _ = merged.insert(user.clone(), status);
                    }
                }
                Err(error) => {
                    warn!(%error, users = chunk.len(), "presence batch failed");
                    failure = Some(error);
                }
            }
        }

        self.apply_batch(&merged, start_seq);
        debug!(users = users.len(), fetched = merged.len(), "presence batch done");

        let outcome = match failure {
            Some(error) => Err(PresenceError::Api(error)),
            None => Ok(Arc::new(merged)),
        };
        for waiter in batch.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn apply_batch(&self, statuses: &HashMap<UserId, PresenceStatus>, start_seq: u64) {
        let mut changed = Vec::new();
        {
            let mut entries = self.entries.write();
            let now = Utc::now();
            for (user, status) in statuses {
                let previous = entries.map.get(user).copied();
                if previous.is_some_and(|e| e.seq > start_seq) {
                    trace!(user_id = %user, "keeping presence pushed during fetch");
                    continue;
                }
                entries.seq += 1;
                let seq = entries.seq;
                let _ = entries.map.insert(
                    user.clone(),
                    PresenceEntry {
                        status: *status,
                        updated_at: now,
                        seq,
                    },
                );
                if previous.is_none_or(|e| e.status != *status) {
                    changed.push((user.clone(), *status));
                }
            }
        }
        for (user, status) in changed {
            self.notify(&user, status);
        }
    }

    fn notify(&self, user: &UserId, status: PresenceStatus) {
        if let Some(sender) = self.watchers.lock().get(user) {
            let _ = sender.send_if_modified(|current| {
                if *current == status {
                    return false;
                }
                *current = status;
                true
            });
        }
    }
}

impl EventHandler for PresenceCache {
    fn handle(&self, event: &HubEvent) {
        if let HubEvent::PresenceChanged(change) = event {
            self.apply_event(&change.user_id, change.status, change.at);
        }
    }
}

impl std::fmt::Debug for PresenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceCache")
            .field("entries", &self.inner.entries.read().map.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApi, FakeCall, RecordingSender};
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::time::Duration;

    fn settings() -> PresenceSettings {
        PresenceSettings {
            coalesce_window_ms: 25,
            max_batch_size: 200,
        }
    }

    fn cache_with(api: &Arc<FakeApi>, hub: &Arc<RecordingSender>, settings: PresenceSettings) -> PresenceCache {
        PresenceCache::new(api.clone(), hub.clone(), settings, TaskScheduler::new())
    }

    fn ids(names: &[&str]) -> Vec<UserId> {
        names.iter().map(|n| UserId::new(*n)).collect()
    }

    #[test]
    fn unknown_user_reads_offline() {
        let cache = cache_with(&FakeApi::new(), &RecordingSender::new(), settings());
        assert_eq!(cache.status(&UserId::new("ghost")), PresenceStatus::Offline);
        assert!(cache.updated_at(&UserId::new("ghost")).is_none());
    }

    #[test]
    fn last_event_wins() {
        let cache = cache_with(&FakeApi::new(), &RecordingSender::new(), settings());
        let u = UserId::new("u1");
        cache.apply_event(&u, PresenceStatus::Online, None);
        cache.apply_event(&u, PresenceStatus::Busy, None);
        cache.apply_event(&u, PresenceStatus::Offline, None);
        assert_eq!(cache.status(&u), PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_batch() {
        let api = FakeApi::new();
        api.set_presence("a", PresenceStatus::Online);
        api.set_presence("c", PresenceStatus::Busy);
        let cache = cache_with(&api, &RecordingSender::new(), settings());

        let first = ids(&["a", "b"]);
        let second = ids(&["b", "c"]);
        let (r1, r2) = tokio::join!(cache.get_statuses(&first), cache.get_statuses(&second));
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();

        assert_eq!(api.call_count(FakeCall::PresenceBatch), 1);
        assert_eq!(api.presence_requests(), vec![ids(&["a", "b", "c"])]);
        assert_eq!(r1.len(), 2);
        assert_eq!(r1[&UserId::new("a")], PresenceStatus::Online);
        assert_eq!(r2[&UserId::new("b")], PresenceStatus::Offline);
        assert_eq!(r2[&UserId::new("c")], PresenceStatus::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_outside_window_start_new_batch() {
        let api = FakeApi::new();
        let cache = cache_with(&api, &RecordingSender::new(), settings());

        let _ = cache.get_statuses(&ids(&["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = cache.get_statuses(&ids(&["b"])).await.unwrap();
        assert_eq!(api.call_count(FakeCall::PresenceBatch), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_users_are_not_fetched() {
        let api = FakeApi::new();
        let cache = cache_with(&api, &RecordingSender::new(), settings());
        cache.apply_event(&UserId::new("a"), PresenceStatus::Busy, None);

        let statuses = cache.get_statuses(&ids(&["a"])).await.unwrap();
        assert_eq!(statuses[&UserId::new("a")], PresenceStatus::Busy);
        assert_eq!(api.call_count(FakeCall::PresenceBatch), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn large_batches_are_chunked() {
        let api = FakeApi::new();
        let cache = cache_with(
            &api,
            &RecordingSender::new(),
            PresenceSettings {
                coalesce_window_ms: 25,
                max_batch_size: 2,
            },
        );

        let users = ids(&["a", "b", "c", "d", "e"]);
        let statuses = cache.get_statuses(&users).await.unwrap();
        assert_eq!(statuses.len(), 5);
        let requests = api.presence_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.len() <= 2));
    }

    #[tokio::test(start_paused = true)]
    async fn push_during_fetch_wins() {
        let api = FakeApi::new();
        api.set_presence("a", PresenceStatus::Offline);
        api.set_presence_delay(Duration::from_millis(500));
        let cache = cache_with(&api, &RecordingSender::new(), settings());

        let fetch = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh_batch(&ids(&["a"])).await })
        };
        // Past the coalesce window, inside the request.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.apply_event(&UserId::new("a"), PresenceStatus::Online, None);

        let answer = fetch.await.unwrap().unwrap();
        assert_eq!(answer[&UserId::new("a")], PresenceStatus::Offline);
        assert_eq!(cache.status(&UserId::new("a")), PresenceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_reaches_every_waiter() {
        let api = FakeApi::new();
        api.fail(FakeCall::PresenceBatch, ApiError::Timeout);
        let cache = cache_with(&api, &RecordingSender::new(), settings());

        let (ids_a, ids_b) = (ids(&["a"]), ids(&["b"]));
        let (r1, r2) = tokio::join!(cache.get_statuses(&ids_a), cache.get_statuses(&ids_b));
        assert_matches!(r1, Err(PresenceError::Api(ApiError::Timeout)));
        assert_matches!(r2, Err(PresenceError::Api(ApiError::Timeout)));
        assert_eq!(api.call_count(FakeCall::PresenceBatch), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_batch() {
        let api = FakeApi::new();
        let scheduler = TaskScheduler::new();
        let cache = PresenceCache::new(api.clone(), RecordingSender::new(), settings(), scheduler.clone());

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_statuses(&ids(&["a"])).await })
        };
        tokio::task::yield_now().await;
        scheduler.shutdown(Duration::from_secs(1)).await;
        assert_matches!(pending.await.unwrap(), Err(PresenceError::Cancelled));
        assert_eq!(api.call_count(FakeCall::PresenceBatch), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_sends_once_and_tracks_receivers() {
        let api = FakeApi::new();
        api.set_presence("a", PresenceStatus::Online);
        let hub = RecordingSender::new();
        let cache = cache_with(&api, &hub, settings());
        let a = UserId::new("a");

        let mut rx1 = cache.subscribe(&a);
        let rx2 = cache.subscribe(&a);
        assert_eq!(hub.sent().len(), 1);
        assert_eq!(cache.subscribed_users(), vec![a.clone()]);

        // Background fetch fills in the real status.
        rx1.changed().await.unwrap();
        assert_eq!(*rx1.borrow(), PresenceStatus::Online);

        drop(rx1);
        drop(rx2);
        assert!(cache.subscribed_users().is_empty());
        let _rx3 = cache.subscribe(&a);
        assert_eq!(hub.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_disconnected_is_quiet() {
        let hub = RecordingSender::new();
        hub.set_connected(false);
        let cache = cache_with(&FakeApi::new(), &hub, settings());
        let _rx = cache.subscribe(&UserId::new("a"));
        assert!(hub.sent().is_empty());

        hub.set_connected(true);
        cache.resubscribe().unwrap();
        assert_eq!(
            hub.sent(),
            vec![OutboundEvent::SubscribeToPresence {
                user_ids: ids(&["a"])
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_see_live_events() {
        let cache = cache_with(&FakeApi::new(), &RecordingSender::new(), settings());
        let a = UserId::new("a");
        cache.apply_event(&a, PresenceStatus::Online, None);
        let mut rx = cache.subscribe(&a);
        assert_eq!(*rx.borrow_and_update(), PresenceStatus::Online);

        cache.handle(&HubEvent::PresenceChanged(parley_core::events::PresenceChanged {
            user_id: a.clone(),
            status: PresenceStatus::Absent,
            at: None,
        }));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), PresenceStatus::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_subscribed_only_fetches_watched_users() {
        let api = FakeApi::new();
        let cache = cache_with(&api, &RecordingSender::new(), settings());
        cache.apply_event(&UserId::new("a"), PresenceStatus::Online, None);
        cache.apply_event(&UserId::new("b"), PresenceStatus::Online, None);
        let _rx = cache.subscribe(&UserId::new("b"));

        assert_eq!(cache.refresh_subscribed().await.unwrap(), 1);
        assert_eq!(api.presence_requests(), vec![ids(&["b"])]);
        assert_eq!(cache.status(&UserId::new("b")), PresenceStatus::Offline);
        assert_eq!(cache.status(&UserId::new("a")), PresenceStatus::Online);
    }

    fn status_strategy() -> impl Strategy<Value = PresenceStatus> {
        prop_oneof![
            Just(PresenceStatus::Online),
            Just(PresenceStatus::Offline),
            Just(PresenceStatus::Busy),
            Just(PresenceStatus::Absent),
        ]
    }

    proptest! {
        #[test]
        fn final_status_is_last_applied(events in prop::collection::vec((0..4usize, status_strategy()), 1..64)) {
            let cache = cache_with(&FakeApi::new(), &RecordingSender::new(), settings());
            let users = ids(&["a", "b", "c", "d"]);
            let mut expected = HashMap::new();
            for (idx, status) in &events {
                cache.apply_event(&users[*idx], *status, None);
                let _ = expected.insert(users[*idx].clone(), *status);
            }
            let snapshot = cache.statuses(&users);
            for user in &users {
                let want = expected.get(user).copied().unwrap_or_default();
                prop_assert_eq!(snapshot[user], want);
            }
        }
    }
}
