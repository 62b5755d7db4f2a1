//! Notification stream.
//!
//! Merges paginated history with live `notification-pushed` events into one
//! de-duplicated feed, kept newest-first. The unread count is maintained on
//! every mutation and always equals [`NotificationStream::recount_unread`].

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use parley_api::{ApiError, RealtimeApi};
use parley_core::events::HubEvent;
use parley_core::ids::NotificationId;
use parley_core::notifications::{NotificationItem, PageCursor};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::router::EventHandler;

const CHANGE_CHANNEL_CAPACITY: usize = 128;

/// Why a notification operation failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    /// The REST call failed; optimistic changes were rolled back.
    #[error("notification request failed: {0}")]
    Api(#[from] ApiError),
    /// The id is not in the loaded feed.
    #[error("unknown notification {0}")]
    UnknownId(NotificationId),
}

/// Change notice published after every feed mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationChange {
    /// Newly inserted ids.
    pub added: Vec<NotificationId>,
    /// Ids whose read flag changed.
    pub read_changed: Vec<NotificationId>,
    /// Unread count after the change.
    pub unread: usize,
}

/// Result of a head reload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadMerge {
    /// Items the feed did not have.
    pub added: usize,
    /// Known items whose read flag the server corrected.
    pub read_changed: usize,
}

#[derive(Default)]
struct Feed {
    items: Vec<NotificationItem>,
    ids: HashSet<NotificationId>,
    unread: usize,
    next_cursor: Option<PageCursor>,
    head_loaded: bool,
    /// Head merges applied so far.
    merges: u64,
    /// Merge that last reported each id's read flag.
    confirmed: HashMap<NotificationId, u64>,
}

impl Feed {
    fn insert(&mut self, item: NotificationItem) -> bool {
        if !self.ids.insert(item.id) {
            return false;
        }
        if !item.is_read {
            self.unread += 1;
        }
        let at = self
            .items
            .partition_point(|existing| existing.feed_order(&item) == Ordering::Less);
        self.items.insert(at, item);
        true
    }

    fn set_read(&mut self, id: NotificationId, read: bool) -> Option<bool> {
        let item = self.items.iter_mut().find(|i| i.id == id)?;
        if item.is_read == read {
            return Some(false);
        }
        item.is_read = read;
        if read {
            self.unread -= 1;
        } else {
            self.unread += 1;
        }
        Some(true)
    }

    fn is_read(&self, id: NotificationId) -> Option<bool> {
        self.items.iter().find(|i| i.id == id).map(|i| i.is_read)
    }

    /// Undo an optimistic read of `id` made when `merges` was `since`.
    /// Flags a later head merge reported are the server's and stay.
    fn roll_back_read(&mut self, id: NotificationId, since: u64) -> bool {
        if self.confirmed.get(&id).is_some_and(|merge| *merge > since) {
            return false;
        }
        self.is_read(id) == Some(true) && self.set_read(id, false) == Some(true)
    }
}

/// Session-scoped notification feed.
pub struct NotificationStream {
    api: Arc<dyn RealtimeApi>,
    page_size: u32,
    feed: Mutex<Feed>,
    changes: broadcast::Sender<NotificationChange>,
}

impl NotificationStream {
    /// Empty feed fetching `page_size` items per page.
    #[must_use]
    pub fn new(api: Arc<dyn RealtimeApi>, page_size: u32) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            api,
            page_size,
            feed: Mutex::new(Feed::default()),
            changes,
        }
    }

    /// Load one page of history. `None` loads the head.
    ///
    /// Returns how many items were new.
    pub async fn load_page(&self, cursor: Option<&PageCursor>) -> Result<usize, NotificationError> {
        let page = self.api.notifications_page(cursor, self.page_size).await?;
        let mut feed = self.feed.lock();

        let mut added = Vec::new();
        for item in page.items {
            let id = item.id;
            if feed.insert(item) {
                added.push(id);
            }
        }

        // Advance pagination on the first head load or when loading the tail.
        let advance = match cursor {
            None => !feed.head_loaded,
            Some(c) => feed.next_cursor.as_ref() == Some(c),
        };
        if advance {
            feed.next_cursor = page.next_cursor;
        }
        feed.head_loaded = true;

        debug!(added = added.len(), unread = feed.unread, "notification page loaded");
        let count = added.len();
        self.publish(&feed, added, Vec::new());
        Ok(count)
    }

    /// Re-fetch the head page and merge it authoritatively.
    pub async fn reload_head(&self) -> Result<HeadMerge, NotificationError> {
        let page = self.api.notifications_page(None, self.page_size).await?;
        let mut feed = self.feed.lock();
        feed.merges += 1;
        let merge = feed.merges;

        let mut added = Vec::new();
        let mut read_changed = Vec::new();
        for item in page.items {
            let id = item.id;
            let _ = feed.confirmed.insert(id, merge);
            if feed.ids.contains(&id) {
                if feed.set_read(id, item.is_read) == Some(true) {
                    read_changed.push(id);
                }
            } else if feed.insert(item) {
                added.push(id);
            }
        }
        if !feed.head_loaded {
            feed.next_cursor = page.next_cursor;
            feed.head_loaded = true;
        }

        let merge = HeadMerge {
            added: added.len(),
            read_changed: read_changed.len(),
        };
        debug!(added = merge.added, read_changed = merge.read_changed, "notification head reloaded");
        self.publish(&feed, added, read_changed);
        Ok(merge)
    }

    /// Insert a live item unless its id is already known. Returns whether it was new.
    pub fn on_push(&self, item: NotificationItem) -> bool {
        let mut feed = self.feed.lock();
        let id = item.id;
        if !feed.insert(item) {
            debug!(notification_id = id.get(), "duplicate notification ignored");
            return false;
        }
        self.publish(&feed, vec![id], Vec::new());
        true
    }

    /// Mark one item read, optimistically.
    pub async fn mark_read(&self, id: NotificationId) -> Result<(), NotificationError> {
        let since = {
            let mut feed = self.feed.lock();
            match feed.set_read(id, true) {
                None => return Err(NotificationError::UnknownId(id)),
                Some(false) => return Ok(()),
                Some(true) => self.publish(&feed, Vec::new(), vec![id]),
            }
            feed.merges
        };

        if let Err(error) = self.api.mark_notification_read(id).await {
            warn!(%error, notification_id = id.get(), "mark read failed, rolling back");
            let mut feed = self.feed.lock();
            if feed.roll_back_read(id, since) {
                self.publish(&feed, Vec::new(), vec![id]);
            }
            return Err(error.into());
        }
        Ok(())
    }

    /// Mark everything read, optimistically. Returns how many items flipped.
    pub async fn mark_all_read(&self) -> Result<usize, NotificationError> {
        let (flipped, since) = {
            let mut feed = self.feed.lock();
            let unread: Vec<NotificationId> = feed
                .items
                .iter()
                .filter(|i| !i.is_read)
                .map(|i| i.id)
                .collect();
            for id in &unread {
                let _ = feed.set_read(*id, true);
            }
            if !unread.is_empty() {
                self.publish(&feed, Vec::new(), unread.clone());
            }
            (unread, feed.merges)
        };

        if let Err(error) = self.api.mark_all_notifications_read().await {
            warn!(%error, items = flipped.len(), "mark all read failed, rolling back");
            let mut feed = self.feed.lock();
            let restored: Vec<NotificationId> = flipped
                .into_iter()
                .filter(|id| feed.roll_back_read(*id, since))
                .collect();
            if !restored.is_empty() {
                self.publish(&feed, Vec::new(), restored);
            }
            return Err(error.into());
        }
        Ok(flipped.len())
    }

    /// Maintained unread count.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.feed.lock().unread
    }

    /// Unread count computed from scratch.
    #[must_use]
    pub fn recount_unread(&self) -> usize {
        self.feed.lock().items.iter().filter(|i| !i.is_read).count()
    }

    /// Snapshot of the feed, newest first.
    #[must_use]
    pub fn items(&self) -> Vec<NotificationItem> {
        self.feed.lock().items.clone()
    }

    /// Cursor for the next older page, if history continues.
    #[must_use]
    pub fn next_cursor(&self) -> Option<PageCursor> {
        self.feed.lock().next_cursor.clone()
    }

    /// Change notices from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationChange> {
        self.changes.subscribe()
    }

    fn publish(&self, feed: &Feed, added: Vec<NotificationId>, read_changed: Vec<NotificationId>) {
        if added.is_empty() && read_changed.is_empty() {
            return;
        }
        let _ = self.changes.send(NotificationChange {
            added,
            read_changed,
            unread: feed.unread,
        });
    }
}

impl EventHandler for NotificationStream {
    fn handle(&self, event: &HubEvent) {
        if let HubEvent::NotificationPushed(item) = event {
            let _ = self.on_push(item.clone());
        }
    }
}

impl std::fmt::Debug for NotificationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let feed = self.feed.lock();
        f.debug_struct("NotificationStream")
            .field("items", &feed.items.len())
            .field("unread", &feed.unread)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApi, FakeCall};
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use parley_core::notifications::NotificationPage;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn item(id: u64, secs: i64, is_read: bool) -> NotificationItem {
        NotificationItem {
            id: NotificationId(id),
            payload: json!({"n": id}),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            is_read,
        }
    }

    fn ids(stream: &NotificationStream) -> Vec<u64> {
        stream.items().iter().map(|i| i.id.get()).collect()
    }

    fn stream_with(api: &Arc<FakeApi>) -> NotificationStream {
        NotificationStream::new(api.clone(), 30)
    }

    #[tokio::test]
    async fn pages_merge_with_pushes_without_duplicates() {
        let api = FakeApi::new();
        api.set_page(
            None,
            NotificationPage {
                items: vec![item(5, 500, false), item(4, 400, true)],
                next_cursor: Some(PageCursor::new("p2")),
            },
        );
        api.set_page(
            Some("p2"),
            NotificationPage {
                items: vec![item(3, 300, false), item(2, 200, false)],
                next_cursor: None,
            },
        );
        let stream = stream_with(&api);

        assert_eq!(stream.load_page(None).await.unwrap(), 2);
        assert!(stream.on_push(item(6, 600, false)));
        assert!(!stream.on_push(item(5, 500, false)));

        let cursor = stream.next_cursor().unwrap();
        assert_eq!(cursor.as_str(), "p2");
        assert_eq!(stream.load_page(Some(&cursor)).await.unwrap(), 2);
        assert!(stream.next_cursor().is_none());
        assert!(!stream.on_push(item(2, 200, false)));

        assert_eq!(ids(&stream), vec![6, 5, 4, 3, 2]);
        assert_eq!(stream.unread_count(), 4);
        assert_eq!(stream.unread_count(), stream.recount_unread());
    }

    #[test]
    fn push_lands_at_head_and_ties_break_by_id() {
        let stream = stream_with(&FakeApi::new());
        assert!(stream.on_push(item(1, 100, false)));
        assert!(stream.on_push(item(3, 100, false)));
        assert!(stream.on_push(item(2, 100, false)));
        assert!(stream.on_push(item(9, 50, false)));
        assert!(stream.on_push(item(4, 200, false)));
        assert_eq!(ids(&stream), vec![4, 3, 2, 1, 9]);
    }

    #[tokio::test]
    async fn reload_head_is_authoritative() {
        let api = FakeApi::new();
        api.set_page(
            None,
            NotificationPage {
                items: vec![item(2, 200, false), item(1, 100, false)],
                next_cursor: Some(PageCursor::new("older")),
            },
        );
        let stream = stream_with(&api);
        let _ = stream.load_page(None).await.unwrap();

        api.set_page(
            None,
            NotificationPage {
                items: vec![item(3, 300, false), item(2, 200, true), item(1, 100, false)],
                next_cursor: Some(PageCursor::new("newer-cursor")),
            },
        );
        let merge = stream.reload_head().await.unwrap();
        assert_eq!(merge, HeadMerge { added: 1, read_changed: 1 });
        assert_eq!(ids(&stream), vec![3, 2, 1]);
        assert_eq!(stream.unread_count(), 2);
        // Pagination continues from where history left off.
        assert_eq!(stream.next_cursor().unwrap().as_str(), "older");
    }

    #[tokio::test]
    async fn mark_read_rolls_back_on_failure() {
        let api = FakeApi::new();
        let stream = stream_with(&api);
        let _ = stream.on_push(item(1, 100, false));
        api.fail(FakeCall::MarkRead, ApiError::Timeout);

        let result = stream.mark_read(NotificationId(1)).await;
        assert_matches!(result, Err(NotificationError::Api(ApiError::Timeout)));
        assert_eq!(stream.unread_count(), 1);
        assert!(!stream.items()[0].is_read);
        assert_eq!(api.call_count(FakeCall::MarkRead), 1);
    }

    #[tokio::test]
    async fn mark_read_success_and_unknown_id() {
        let api = FakeApi::new();
        let stream = stream_with(&api);
        let _ = stream.on_push(item(1, 100, false));
        let mut changes = stream.subscribe();

        stream.mark_read(NotificationId(1)).await.unwrap();
        assert_eq!(stream.unread_count(), 0);
        assert_eq!(api.read_marks(), vec![NotificationId(1)]);
        let change = changes.try_recv().unwrap();
        assert_eq!(change.read_changed, vec![NotificationId(1)]);
        assert_eq!(change.unread, 0);

        // Already read: no request.
        stream.mark_read(NotificationId(1)).await.unwrap();
        assert_eq!(api.call_count(FakeCall::MarkRead), 1);

        assert_matches!(
            stream.mark_read(NotificationId(42)).await,
            Err(NotificationError::UnknownId(NotificationId(42)))
        );
    }

    #[tokio::test]
    async fn mark_all_read_restores_exactly_flipped_flags() {
        let api = FakeApi::new();
        let stream = stream_with(&api);
        let _ = stream.on_push(item(1, 100, false));
        let _ = stream.on_push(item(2, 200, true));
        let _ = stream.on_push(item(3, 300, false));
        api.fail(FakeCall::MarkAllRead, ApiError::Network { message: "down".into() });

        assert!(stream.mark_all_read().await.is_err());
        let read: Vec<(u64, bool)> = stream.items().iter().map(|i| (i.id.get(), i.is_read)).collect();
        assert_eq!(read, vec![(3, false), (2, true), (1, false)]);
        assert_eq!(stream.unread_count(), 2);

        api.clear_failure(FakeCall::MarkAllRead);
        assert_eq!(stream.mark_all_read().await.unwrap(), 2);
        assert_eq!(stream.unread_count(), 0);
        assert_eq!(stream.recount_unread(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_keeps_flags_confirmed_by_a_head_merge() {
        let api = FakeApi::new();
        let stream = Arc::new(stream_with(&api));
        let _ = stream.on_push(item(1, 100, false));
        let _ = stream.on_push(item(2, 200, false));
        api.fail(FakeCall::MarkAllRead, ApiError::Timeout);
        api.set_delay(FakeCall::MarkAllRead, Duration::from_secs(1));

        let marking = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.mark_all_read().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stream.unread_count(), 0);

        // The server already has 2 read (another device); 1 is still unread there.
        api.set_page(
            None,
            NotificationPage {
                items: vec![item(2, 200, true)],
                next_cursor: None,
            },
        );
        let _ = stream.reload_head().await.unwrap();

        assert!(marking.await.unwrap().is_err());
        let read: Vec<(u64, bool)> = stream.items().iter().map(|i| (i.id.get(), i.is_read)).collect();
        assert_eq!(read, vec![(2, true), (1, false)]);
        assert_eq!(stream.unread_count(), 1);
        assert_eq!(stream.unread_count(), stream.recount_unread());
    }

    #[tokio::test]
    async fn failed_page_leaves_feed_untouched() {
        let api = FakeApi::new();
        api.fail(FakeCall::NotificationsPage, ApiError::Timeout);
        let stream = stream_with(&api);
        let _ = stream.on_push(item(1, 100, false));

        assert!(stream.load_page(None).await.is_err());
        assert_eq!(ids(&stream), vec![1]);
    }

    #[test]
    fn router_pushes_are_deduplicated() {
        let stream = stream_with(&FakeApi::new());
        let event = HubEvent::NotificationPushed(item(7, 700, false));
        stream.handle(&event);
        stream.handle(&event);
        assert_eq!(ids(&stream), vec![7]);
        assert_eq!(stream.unread_count(), 1);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Push(u64, i64, bool),
        MarkRead(u64),
        MarkAll { fail: bool },
        Reload(Vec<(u64, i64, bool)>),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..20u64, 0..50i64, any::<bool>()).prop_map(|(id, t, r)| Op::Push(id, t, r)),
            (0..20u64).prop_map(Op::MarkRead),
            any::<bool>().prop_map(|fail| Op::MarkAll { fail }),
            prop::collection::vec((0..20u64, 0..50i64, any::<bool>()), 0..5).prop_map(Op::Reload),
        ]
    }

    proptest! {
        #[test]
        fn unread_count_always_matches_recount(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let api = FakeApi::new();
                let stream = stream_with(&api);
                for op in ops {
                    match op {
                        Op::Push(id, t, r) => { let _ = stream.on_push(item(id, t, r)); }
                        Op::MarkRead(id) => { let _ = stream.mark_read(NotificationId(id)).await; }
                        Op::MarkAll { fail } => {
                            if fail {
                                api.fail(FakeCall::MarkAllRead, ApiError::Timeout);
                            } else {
                                api.clear_failure(FakeCall::MarkAllRead);
                            }
                            let _ = stream.mark_all_read().await;
                        }
                        Op::Reload(items) => {
                            api.set_page(None, NotificationPage {
                                items: items.into_iter().map(|(id, t, r)| item(id, t, r)).collect(),
                                next_cursor: None,
                            });
                            let _ = stream.reload_head().await;
                        }
                    }
                    assert_eq!(stream.unread_count(), stream.recount_unread());
                    let items = stream.items();
                    let unique: HashSet<_> = items.iter().map(|i| i.id).collect();
                    assert_eq!(unique.len(), items.len());
                    assert!(items.windows(2).all(|w| w[0].feed_order(&w[1]) != Ordering::Greater));
                }
            });
        }
    }
}
