use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::time::Instant;

use crate::events::{Callback, SubscriptionId, Subscribers};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    After(Duration),
    Sticky,
}

/// A transient alert shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub description: String,
    pub created_at: Instant,
    pub ttl: Ttl,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, description: impl Into<String>, ttl: Ttl) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            description: description.into(),
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_sticky(&self) -> bool {
        matches!(self.ttl, Ttl::Sticky)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Ttl::After(ttl) => now.saturating_duration_since(self.created_at) >= ttl,
            Ttl::Sticky => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissReason {
    User,
    Expired,
    Evicted,
}

#[derive(Debug, Clone)]
pub struct DismissedNotification {
    pub notification: Notification,
    pub reason: DismissReason,
}

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Shown(Notification),
    Dismissed { id: String, reason: DismissReason },
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<Notification>,
    history: VecDeque<DismissedNotification>,
}

impl QueueState {
    fn retire(&mut self, notification: Notification, reason: DismissReason, limit: usize, events: &mut Vec<NotificationEvent>) {
        events.push(NotificationEvent::Dismissed {
            id: notification.id.clone(),
            reason,
        });
        self.history.push_back(DismissedNotification { notification, reason });
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    fn expire(&mut self, now: Instant, limit: usize, events: &mut Vec<NotificationEvent>) {
        let mut index = 0;
        while index < self.visible.len() {
            if self.visible[index].is_expired(now) {
                if let Some(notification) = self.visible.remove(index) {
                    self.retire(notification, DismissReason::Expired, limit, events);
                }
            } else {
                index += 1;
            }
        }
    }
}

/// Bounded stack of visible notifications.
///
/// Expiry is evaluated lazily whenever the queue is touched; there is no
/// timer per notification.
pub struct NotificationQueue {
    state: Mutex<QueueState>,
    /// Held across each mutation and its emit so `Shown` always precedes
    /// the matching `Dismissed`.
    dispatch: ReentrantMutex<()>,
    max_visible: usize,
    default_ttl: Duration,
    history_limit: usize,
    subscribers: Subscribers<NotificationEvent>,
}

impl NotificationQueue {
    pub fn new(max_visible: usize, default_ttl: Duration, history_limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            dispatch: ReentrantMutex::new(()),
            max_visible: max_visible.max(1),
            default_ttl,
            history_limit,
            subscribers: Subscribers::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.max_visible_notifications,
            settings.notification_ttl(),
            settings.notification_history_limit,
        )
    }

    /// Show a notification with the queue's default ttl. Returns its id.
    pub fn notify(&self, kind: NotificationKind, title: impl Into<String>, description: impl Into<String>) -> String {
        self.push(Notification::new(kind, title, description, Ttl::After(self.default_ttl)))
    }

    /// Show `notification`, evicting the oldest non-sticky one when over capacity.
    pub fn push(&self, notification: Notification) -> String {
        let id = notification.id.clone();
        let _dispatch = self.dispatch.lock();
        let mut events = Vec::new();
        let shown = {
            let mut state = self.state.lock();
            state.expire(Instant::now(), self.history_limit, &mut events);
            if state.visible.iter().any(|n| n.id == id) {
                tracing::debug!(%id, "notification already visible");
                false
            } else {
                state.visible.push_back(notification.clone());
                Self::evict_overflow(&mut state, self.max_visible, self.history_limit, &mut events);
                true
            }
        };
        if shown {
            events.push(NotificationEvent::Shown(notification));
        }
        self.dispatch(events);
        id
    }

    fn evict_overflow(state: &mut QueueState, max_visible: usize, history_limit: usize, events: &mut Vec<NotificationEvent>) {
        while state.visible.len() > max_visible {
            let older = state.visible.len() - 1;
            let Some(index) = state.visible.iter().take(older).position(|n| !n.is_sticky()) else {
                tracing::debug!("all older notifications are sticky, exceeding limit");
                break;
            };
            if let Some(evicted) = state.visible.remove(index) {
                tracing::debug!(id = %evicted.id, "notification evicted");
                state.retire(evicted, DismissReason::Evicted, history_limit, events);
            }
        }
    }

    /// Remove a notification now. Returns false if it was not visible.
    pub fn dismiss(&self, id: &str) -> bool {
        let _dispatch = self.dispatch.lock();
        let mut events = Vec::new();
        let found = {
            let mut state = self.state.lock();
            match state.visible.iter().position(|n| n.id == id) {
                Some(index) => {
                    if let Some(notification) = state.visible.remove(index) {
                        state.retire(notification, DismissReason::User, self.history_limit, &mut events);
                    }
                    true
                }
                None => false,
            }
        };
        self.dispatch(events);
        found
    }

    /// Dismiss every notification whose ttl elapsed at `now`. Returns their ids.
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let _dispatch = self.dispatch.lock();
        let mut events = Vec::new();
        self.state.lock().expire(now, self.history_limit, &mut events);
        let ids = events
            .iter()
            .filter_map(|event| match event {
                NotificationEvent::Dismissed { id, .. } => Some(id.clone()),
                NotificationEvent::Shown(_) => None,
            })
            .collect();
        self.dispatch(events);
        ids
    }

    /// Visible notifications, oldest first.
    pub fn visible(&self) -> Vec<Notification> {
        self.expire(Instant::now());
        self.state.lock().visible.iter().cloned().collect()
    }

    pub fn history(&self) -> Vec<DismissedNotification> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn subscribe(&self, callback: Callback<NotificationEvent>) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn dispatch(&self, events: Vec<NotificationEvent>) {
        for event in events {
            self.subscribers.emit(&event);
        }
    }
}
