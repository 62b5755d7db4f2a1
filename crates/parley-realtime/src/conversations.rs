//! Conversation activity.
//!
//! Tracks the latest message and an unread counter per conversation from
//! `message-created` events. Messages written by the local user, or posted
//! to the conversation the user has open, never count as unread.
//!
//! Redelivered messages are recognised by id against a fixed window of the
//! most recent ids per conversation, so memory stays bounded by the number
//! of conversations.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_core::events::{HubEvent, MessageCreated};
use parley_core::ids::{ConversationId, MessageId, UserId};
use tokio::sync::broadcast;
use tracing::trace;

use crate::router::EventHandler;

const UPDATE_CHANNEL_CAPACITY: usize = 128;

/// Message ids remembered per conversation for de-duplication.
pub const RECENT_MESSAGE_WINDOW: usize = 256;

/// Latest activity in one conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationActivity {
    /// Most recent message.
    pub last_message_id: MessageId,
    /// When it was created.
    pub last_message_at: DateTime<Utc>,
    /// Author of the most recent message.
    pub last_sender: UserId,
    /// Preview of the most recent message, if the hub sent one.
    pub preview: Option<String>,
    /// Messages not yet seen.
    pub unread: u32,
}

/// Published whenever a conversation's activity changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationUpdate {
    /// Which conversation.
    pub conversation_id: ConversationId,
    /// Its activity after the change.
    pub activity: ConversationActivity,
}

struct Conversation {
    activity: ConversationActivity,
    recent: VecDeque<MessageId>,
}

impl Conversation {
    /// Remember `id`. Returns `false` if it is already in the window.
    fn remember(&mut self, id: &MessageId) -> bool {
        if self.recent.contains(id) {
            return false;
        }
        if self.recent.len() == RECENT_MESSAGE_WINDOW {
            let _ = self.recent.pop_front();
        }
        self.recent.push_back(id.clone());
        true
    }
}

#[derive(Default)]
struct Tracker {
    conversations: HashMap<ConversationId, Conversation>,
    active: Option<ConversationId>,
}

/// Per-conversation activity for one session.
pub struct ConversationTracker {
    local_user: Option<UserId>,
    state: Mutex<Tracker>,
    updates: broadcast::Sender<ConversationUpdate>,
}

impl ConversationTracker {
    /// Tracker for a session signed in as `local_user`, if known.
    #[must_use]
    pub fn new(local_user: Option<UserId>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            local_user,
            state: Mutex::new(Tracker::default()),
            updates,
        }
    }

    /// Record a new message. Returns `false` for a message already seen.
    pub fn on_message(&self, message: &MessageCreated) -> bool {
        let mut state = self.state.lock();
        let counts = self.local_user.as_ref() != Some(&message.sender_id)
            && state.active.as_ref() != Some(&message.conversation_id);

        let activity = match state.conversations.get_mut(&message.conversation_id) {
            Some(conversation) => {
                if !conversation.remember(&message.message_id) {
                    trace!(message_id = %message.message_id, "duplicate message ignored");
                    return false;
                }
                let existing = &mut conversation.activity;
                // Out-of-order delivery keeps the newer message as "last".
                if message.created_at >= existing.last_message_at {
                    existing.last_message_id = message.message_id.clone();
                    existing.last_message_at = message.created_at;
                    existing.last_sender = message.sender_id.clone();
                    existing.preview.clone_from(&message.preview);
                }
                if counts {
                    existing.unread = existing.unread.saturating_add(1);
                }
                existing.clone()
            }
            None => {
                let activity = ConversationActivity {
                    last_message_id: message.message_id.clone(),
                    last_message_at: message.created_at,
                    last_sender: message.sender_id.clone(),
                    preview: message.preview.clone(),
                    unread: u32::from(counts),
                };
                let _ = state.conversations.insert(
                    message.conversation_id.clone(),
                    Conversation {
                        activity: activity.clone(),
                        recent: VecDeque::from([message.message_id.clone()]),
                    },
                );
                activity
            }
        };

        let _ = self.updates.send(ConversationUpdate {
            conversation_id: message.conversation_id.clone(),
            activity,
        });
        true
    }

    /// The conversation the user is looking at. Clears its unread count.
    pub fn set_active_conversation(&self, conversation: Option<ConversationId>) {
        let mut state = self.state.lock();
        state.active.clone_from(&conversation);
        drop(state);
        if let Some(conversation) = conversation {
            self.mark_seen(&conversation);
        }
    }

    /// Reset a conversation's unread count.
    pub fn mark_seen(&self, conversation: &ConversationId) {
        let mut state = self.state.lock();
        let Some(activity) = state.conversations.get_mut(conversation).map(|c| &mut c.activity) else {
            return;
        };
        if activity.unread == 0 {
            return;
        }
        activity.unread = 0;
        let _ = self.updates.send(ConversationUpdate {
            conversation_id: conversation.clone(),
            activity: activity.clone(),
        });
    }

    /// Activity of one conversation.
    #[must_use]
    pub fn activity(&self, conversation: &ConversationId) -> Option<ConversationActivity> {
        self.state
            .lock()
            .conversations
            .get(conversation)
            .map(|c| c.activity.clone())
    }

    /// Unread messages across all conversations.
    #[must_use]
    pub fn total_unread(&self) -> u64 {
        self.state
            .lock()
            .conversations
            .values()
            .map(|c| u64::from(c.activity.unread))
            .sum()
    }

    /// Updates from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.updates.subscribe()
    }
}

impl EventHandler for ConversationTracker {
    fn handle(&self, event: &HubEvent) {
        if let HubEvent::MessageCreated(message) = event {
            let _ = self.on_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(id: &str, conversation: &str, sender: &str, secs: i64) -> MessageCreated {
        MessageCreated {
            conversation_id: ConversationId::new(conversation),
            message_id: MessageId::new(id),
            sender_id: UserId::new(sender),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            preview: Some(format!("message {id}")),
        }
    }

    #[test]
    fn counts_unread_and_ignores_duplicates() {
        let tracker = ConversationTracker::new(Some(UserId::new("me")));
        assert!(tracker.on_message(&message("m1", "c1", "bob", 10)));
        assert!(tracker.on_message(&message("m2", "c1", "bob", 20)));
        assert!(!tracker.on_message(&message("m2", "c1", "bob", 20)));

        let activity = tracker.activity(&ConversationId::new("c1")).unwrap();
        assert_eq!(activity.unread, 2);
        assert_eq!(activity.last_message_id, MessageId::new("m2"));
    }

    #[test]
    fn own_messages_do_not_count() {
        let tracker = ConversationTracker::new(Some(UserId::new("me")));
        let _ = tracker.on_message(&message("m1", "c1", "me", 10));
        assert_eq!(tracker.activity(&ConversationId::new("c1")).unwrap().unread, 0);
    }

    #[test]
    fn active_conversation_stays_read() {
        let tracker = ConversationTracker::new(None);
        let _ = tracker.on_message(&message("m1", "c1", "bob", 10));
        let _ = tracker.on_message(&message("m2", "c2", "bob", 10));
        assert_eq!(tracker.total_unread(), 2);

        tracker.set_active_conversation(Some(ConversationId::new("c1")));
        assert_eq!(tracker.total_unread(), 1);
        let _ = tracker.on_message(&message("m3", "c1", "bob", 30));
        assert_eq!(tracker.activity(&ConversationId::new("c1")).unwrap().unread, 0);
    }

    #[test]
    fn late_message_does_not_replace_newer_last() {
        let tracker = ConversationTracker::new(None);
        let _ = tracker.on_message(&message("m2", "c1", "bob", 20));
        let _ = tracker.on_message(&message("m1", "c1", "bob", 10));
        let activity = tracker.activity(&ConversationId::new("c1")).unwrap();
        assert_eq!(activity.last_message_id, MessageId::new("m2"));
        assert_eq!(activity.unread, 2);
    }

    #[test]
    fn duplicate_window_is_bounded_per_conversation() {
        let tracker = ConversationTracker::new(None);
        let total = RECENT_MESSAGE_WINDOW + 10;
        for n in 0..total {
            let id = format!("m{n}");
            assert!(tracker.on_message(&message(&id, "c1", "bob", i64::try_from(n).unwrap())));
        }
        let _ = tracker.on_message(&message("x1", "c2", "bob", 1));

        {
            let state = tracker.state.lock();
            assert_eq!(state.conversations["c1"].recent.len(), RECENT_MESSAGE_WINDOW);
            assert_eq!(state.conversations["c2"].recent.len(), 1);
        }
        // Recent ids are still recognised.
        let last = format!("m{}", total - 1);
        assert!(!tracker.on_message(&message(&last, "c1", "bob", 0)));
        assert_eq!(
            tracker.activity(&ConversationId::new("c1")).unwrap().unread,
            u32::try_from(total).unwrap()
        );
        // The same id in another conversation is a different message.
        assert!(tracker.on_message(&message("m0", "c2", "bob", 2)));
    }

    #[test]
    fn updates_are_published() {
        let tracker = ConversationTracker::new(None);
        let mut updates = tracker.subscribe();
        tracker.handle(&HubEvent::MessageCreated(message("m1", "c1", "bob", 10)));
        tracker.mark_seen(&ConversationId::new("c1"));

        let first = updates.try_recv().unwrap();
        assert_eq!(first.activity.unread, 1);
        let second = updates.try_recv().unwrap();
        assert_eq!(second.activity.unread, 0);
        assert!(updates.try_recv().is_err());
    }
}
