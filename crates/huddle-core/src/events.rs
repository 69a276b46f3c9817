use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::chat::ChatEntry;
use crate::devices::DeviceChange;
use crate::notifications::{DismissReason, Notification};
use crate::surface::SessionState;
use crate::tracks::TrackState;

/// Events emitted by the control surface to the rendering layer.
#[derive(Debug, Clone)]
pub enum HuddleEvent {
    SessionStateChanged(SessionState),
    ConnectionStateChanged(ConnectionState),
    TrackChanged(TrackState),
    DevicesChanged(DeviceChange),
    ChatAppended { entry: ChatEntry, position: usize },
    NotificationShown(Notification),
    NotificationDismissed { id: String, reason: DismissReason },
}

/// Transport connection state as reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

/// Handle returned by every `subscribe`; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Callback registry shared by the components.
///
/// `emit` runs on a copy of the subscriber list, so callbacks may
/// subscribe or unsubscribe without deadlocking.
pub struct Subscribers<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: Callback<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, callback));
        id
    }

    /// Returns false when `id` was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(sid, _)| *sid != id);
        entries.len() != before
    }

    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self.entries.read().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<Subscribers<HuddleEvent>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Subscribers::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) -> SubscriptionId {
        self.listeners
            .subscribe(Arc::new(move |event: &HuddleEvent| listener.on_event(event.clone())))
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn emit(&self, event: HuddleEvent) {
        self.listeners.emit(&event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
