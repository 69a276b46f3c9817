//! Input device enumeration and hot-plug tracking.
//!
//! The registry holds the last enumerated device set behind an `Arc` that
//! is swapped wholesale on every refresh, so readers on other sessions
//! never see a half-updated list.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};

use crate::errors::{HuddleError, PlatformError};
use crate::events::{Callback, SubscriptionId, Subscribers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
    pub is_default: bool,
}

impl Device {
    pub fn new(id: impl Into<String>, kind: DeviceKind, label: impl Into<String>, is_default: bool) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            is_default,
        }
    }
}

/// Device ids that appeared or disappeared for one kind during a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
    pub kind: DeviceKind,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub type ChangeNotifier = Arc<dyn Fn() + Send + Sync>;

/// Host platform that owns the physical devices.
pub trait DevicePlatform: Send + Sync + 'static {
    fn enumerate_devices(&self) -> impl Future<Output = Result<Vec<Device>, PlatformError>> + Send;

    /// Register a notifier fired on hardware plug/unplug.
    fn on_device_change(&self, notifier: ChangeNotifier);
}

#[derive(Debug, Default)]
struct DeviceSet {
    audio_inputs: Vec<Device>,
    video_inputs: Vec<Device>,
}

impl DeviceSet {
    fn from_platform(devices: Vec<Device>) -> Self {
        let mut set = DeviceSet::default();
        let mut seen = HashSet::new();
        for device in devices {
            if !seen.insert((device.kind, device.id.clone())) {
                tracing::debug!(device_id = %device.id, "duplicate device from platform ignored");
                continue;
            }
            set.list_mut(device.kind).push(device);
        }
        // Default first, otherwise platform order.
        set.audio_inputs.sort_by_key(|d| !d.is_default);
        set.video_inputs.sort_by_key(|d| !d.is_default);
        set
    }

    fn list(&self, kind: DeviceKind) -> &[Device] {
        match kind {
            DeviceKind::AudioInput => &self.audio_inputs,
            DeviceKind::VideoInput => &self.video_inputs,
        }
    }

    fn list_mut(&mut self, kind: DeviceKind) -> &mut Vec<Device> {
        match kind {
            DeviceKind::AudioInput => &mut self.audio_inputs,
            DeviceKind::VideoInput => &mut self.video_inputs,
        }
    }

    fn diff(&self, next: &DeviceSet, kind: DeviceKind) -> DeviceChange {
        let old: HashSet<&str> = self.list(kind).iter().map(|d| d.id.as_str()).collect();
        let new: HashSet<&str> = next.list(kind).iter().map(|d| d.id.as_str()).collect();
        DeviceChange {
            kind,
            added: next
                .list(kind)
                .iter()
                .filter(|d| !old.contains(d.id.as_str()))
                .map(|d| d.id.clone())
                .collect(),
            removed: self
                .list(kind)
                .iter()
                .filter(|d| !new.contains(d.id.as_str()))
                .map(|d| d.id.clone())
                .collect(),
        }
    }
}

/// Available input devices, shareable read-only across sessions.
pub struct DeviceRegistry<P> {
    platform: Arc<P>,
    current: RwLock<Arc<DeviceSet>>,
    refresh_lock: Mutex<()>,
    enumerated: AtomicBool,
    subscribers: Subscribers<DeviceChange>,
}

impl<P: DevicePlatform> DeviceRegistry<P> {
    /// Create a registry and start following the platform's hot-plug notifications.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(platform: Arc<P>) -> Arc<Self> {
        let registry = Arc::new(Self {
            platform,
            current: RwLock::new(Arc::new(DeviceSet::default())),
            refresh_lock: Mutex::new(()),
            enumerated: AtomicBool::new(false),
            subscribers: Subscribers::new(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        registry.platform.on_device_change(Arc::new(move || {
            let _ = tx.send(());
        }));

        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Collapse a burst of plug events into one enumeration.
                while rx.try_recv().is_ok() {}
                let Some(registry) = weak.upgrade() else { break };
                if let Err(e) = registry.refresh().await {
                    tracing::warn!("device refresh after hot-plug failed: {e}");
                }
            }
            tracing::debug!("device change loop ended");
        });

        registry
    }

    /// Re-enumerate devices and notify subscribers of what changed.
    pub async fn refresh(&self) -> Result<(), HuddleError> {
        let _guard = self.refresh_lock.lock().await;

        let devices = self.platform.enumerate_devices().await?;
        let next = Arc::new(DeviceSet::from_platform(devices));
        let previous = std::mem::replace(&mut *self.current.write(), next.clone());
        self.enumerated.store(true, Ordering::SeqCst);

        tracing::info!(
            audio_inputs = next.audio_inputs.len(),
            video_inputs = next.video_inputs.len(),
            "devices enumerated"
        );

        for kind in [DeviceKind::AudioInput, DeviceKind::VideoInput] {
            let change = previous.diff(&next, kind);
            if change.added.is_empty() && change.removed.is_empty() {
                continue;
            }
            tracing::debug!(?kind, added = ?change.added, removed = ?change.removed, "device set changed");
            self.subscribers.emit(&change);
        }
        Ok(())
    }

    /// Current devices of `kind`, default first.
    pub fn devices_of(&self, kind: DeviceKind) -> Vec<Device> {
        self.snapshot().list(kind).to_vec()
    }

    pub fn device(&self, kind: DeviceKind, id: &str) -> Option<Device> {
        self.snapshot().list(kind).iter().find(|d| d.id == id).cloned()
    }

    pub fn default_device(&self, kind: DeviceKind) -> Option<Device> {
        self.snapshot().list(kind).first().cloned()
    }

    /// True once at least one enumeration has succeeded.
    pub fn has_enumerated(&self) -> bool {
        self.enumerated.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, kind: DeviceKind, callback: Callback<DeviceChange>) -> SubscriptionId {
        self.subscribers.subscribe(Arc::new(move |change: &DeviceChange| {
            if change.kind == kind {
                callback(change);
            }
        }))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn snapshot(&self) -> Arc<DeviceSet> {
        self.current.read().clone()
    }
}
