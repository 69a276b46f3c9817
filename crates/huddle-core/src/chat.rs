use std::collections::HashSet;

use parking_lot::{Mutex, ReentrantMutex};

use crate::errors::HuddleError;
use crate::events::{Callback, SubscriptionId, Subscribers};
use crate::transport::RemoteChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub id: String,
    pub timestamp_ms: u64,
    pub origin: ChatOrigin,
    pub author_name: String,
    pub message: String,
}

impl ChatEntry {
    /// A message typed by the local user, stamped with the current wall clock.
    pub fn local(author_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            origin: ChatOrigin::Local,
            author_name: author_name.into(),
            message: message.into(),
        }
    }
}

impl From<RemoteChatMessage> for ChatEntry {
    fn from(msg: RemoteChatMessage) -> Self {
        Self {
            id: msg.id,
            timestamp_ms: msg.timestamp_ms,
            origin: ChatOrigin::Remote,
            author_name: msg.author_name,
            message: msg.text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatAppended {
    pub entry: ChatEntry,
    pub position: usize,
}

#[derive(Default)]
struct TimelineState {
    entries: Vec<ChatEntry>,
    ids: HashSet<String>,
}

/// Append-only chat log.
///
/// Entries of one origin keep arrival order. A late entry from the other
/// origin is placed before trailing entries that carry a later timestamp.
pub struct ChatTimeline {
    state: Mutex<TimelineState>,
    /// Held from position assignment through emit, so subscribers see
    /// appends in the order positions were assigned.
    dispatch: ReentrantMutex<()>,
    subscribers: Subscribers<ChatAppended>,
}

impl ChatTimeline {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimelineState::default()),
            dispatch: ReentrantMutex::new(()),
            subscribers: Subscribers::new(),
        }
    }

    /// Insert `entry` and return the position it was given.
    pub fn append(&self, entry: ChatEntry) -> Result<usize, HuddleError> {
        let _dispatch = self.dispatch.lock();
        let position = {
            let mut state = self.state.lock();
            if state.ids.contains(&entry.id) {
                return Err(HuddleError::DuplicateEntry(entry.id));
            }

            let mut position = state.entries.len();
            while position > 0 {
                let prev = &state.entries[position - 1];
                if prev.origin != entry.origin && prev.timestamp_ms > entry.timestamp_ms {
                    position -= 1;
                } else {
                    break;
                }
            }

            state.ids.insert(entry.id.clone());
            state.entries.insert(position, entry.clone());
            position
        };

        tracing::debug!(id = %entry.id, origin = ?entry.origin, position, "chat entry appended");
        self.subscribers.emit(&ChatAppended { entry, position });
        Ok(position)
    }

    /// All entries in display order at the time of the call.
    pub fn entries(&self) -> Vec<ChatEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, callback: Callback<ChatAppended>) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }
}

impl Default for ChatTimeline {
    fn default() -> Self {
        Self::new()
    }
}
