//! Local track enable/disable state.
//!
//! Every track kind gets its own lane: a worker task that drains a command
//! queue one command at a time. Commands for one kind therefore never
//! overlap on the transport, while different kinds run independently.
//! Device hot-plug events enter the same queue instead of calling into
//! the worker directly.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{mpsc, oneshot};

use crate::devices::{DeviceChange, DeviceKind, DevicePlatform, DeviceRegistry};
use crate::errors::HuddleError;
use crate::events::{Callback, SubscriptionId, Subscribers};
use crate::notifications::{NotificationKind, NotificationQueue};
use crate::transport::{TrackHandle, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Microphone,
    Camera,
    ScreenShare,
}

impl TrackKind {
    pub const ALL: [TrackKind; 3] = [TrackKind::Microphone, TrackKind::Camera, TrackKind::ScreenShare];

    /// The device kind this track captures from. Screen share has none.
    pub fn device_kind(self) -> Option<DeviceKind> {
        match self {
            TrackKind::Microphone => Some(DeviceKind::AudioInput),
            TrackKind::Camera => Some(DeviceKind::VideoInput),
            TrackKind::ScreenShare => None,
        }
    }

    fn title(self) -> &'static str {
        match self {
            TrackKind::Microphone => "Microphone",
            TrackKind::Camera => "Camera",
            TrackKind::ScreenShare => "Screen share",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackKind::Microphone => "microphone",
            TrackKind::Camera => "camera",
            TrackKind::ScreenShare => "screen share",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Unpublished,
    Publishing,
    Published,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackState {
    pub kind: TrackKind,
    pub enabled: bool,
    pub selected_device_id: Option<String>,
    pub publish_state: PublishState,
}

impl TrackState {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: false,
            selected_device_id: None,
            publish_state: PublishState::Unpublished,
        }
    }
}

type TrackStates = Arc<Mutex<HashMap<TrackKind, TrackState>>>;

/// Taken before the state lock and held through emit, so subscribers see
/// state changes in the order they were applied.
type Dispatch = Arc<ReentrantMutex<()>>;

enum TrackCommand {
    SetEnabled { enabled: bool, done: oneshot::Sender<()> },
    SelectDevice { device_id: String, done: oneshot::Sender<()> },
    DevicesRemoved(Vec<String>),
    Teardown { done: oneshot::Sender<()> },
}

/// Owns the local track states for the kinds a session exposes.
pub struct TrackController<P: DevicePlatform> {
    lanes: HashMap<TrackKind, mpsc::UnboundedSender<TrackCommand>>,
    states: TrackStates,
    dispatch: Dispatch,
    registry: Arc<DeviceRegistry<P>>,
    device_subscriptions: Mutex<Vec<SubscriptionId>>,
    subscribers: Arc<Subscribers<TrackState>>,
    closing: Arc<AtomicBool>,
}

impl<P: DevicePlatform> TrackController<P> {
    /// Spawn one lane per kind. Must be called from within a tokio runtime.
    pub fn new<T: Transport>(
        kinds: &[TrackKind],
        transport: Arc<T>,
        registry: Arc<DeviceRegistry<P>>,
        notifications: Arc<NotificationQueue>,
    ) -> Self {
        let states: TrackStates = Arc::new(Mutex::new(
            kinds.iter().map(|kind| (*kind, TrackState::new(*kind))).collect(),
        ));
        let dispatch: Dispatch = Arc::new(ReentrantMutex::new(()));
        let subscribers = Arc::new(Subscribers::new());
        let closing = Arc::new(AtomicBool::new(false));
        let mut lanes = HashMap::new();
        let mut device_subscriptions = Vec::new();

        for &kind in kinds {
            if lanes.contains_key(&kind) {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();

            if let Some(device_kind) = kind.device_kind() {
                let lane = tx.clone();
                let id = registry.subscribe(
                    device_kind,
                    Arc::new(move |change: &DeviceChange| {
                        if !change.removed.is_empty() {
                            let _ = lane.send(TrackCommand::DevicesRemoved(change.removed.clone()));
                        }
                    }),
                );
                device_subscriptions.push(id);
            }

            let worker = TrackWorker {
                kind,
                transport: transport.clone(),
                registry: registry.clone(),
                states: states.clone(),
                dispatch: dispatch.clone(),
                subscribers: subscribers.clone(),
                notifications: notifications.clone(),
                closing: closing.clone(),
                live: None,
            };
            tokio::spawn(worker.run(rx));
            lanes.insert(kind, tx);
        }

        Self {
            lanes,
            states,
            dispatch,
            registry,
            device_subscriptions: Mutex::new(device_subscriptions),
            subscribers,
            closing,
        }
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        TrackKind::ALL.into_iter().filter(|kind| self.lanes.contains_key(kind)).collect()
    }

    pub fn state(&self, kind: TrackKind) -> Option<TrackState> {
        self.states.lock().get(&kind).cloned()
    }

    /// States of every instantiated kind, in `TrackKind::ALL` order.
    pub fn states(&self) -> Vec<TrackState> {
        let states = self.states.lock();
        TrackKind::ALL.iter().filter_map(|kind| states.get(kind).cloned()).collect()
    }

    /// Request `enabled` for `kind`.
    ///
    /// The command is queued when this is called, not when the future is
    /// first polled; the future resolves once the lane has settled it.
    /// Transport failures are reported through notifications, not here.
    pub fn set_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> impl Future<Output = Result<(), HuddleError>> + Send + use<P> {
        let queued = self.enqueue(kind, |done| TrackCommand::SetEnabled { enabled, done });
        async move { queued?.await.map_err(|_| HuddleError::SessionClosed) }
    }

    /// Switch `kind` to `device_id`, swapping the live track if it is enabled.
    pub fn select_device(
        &self,
        kind: TrackKind,
        device_id: &str,
    ) -> impl Future<Output = Result<(), HuddleError>> + Send + use<P> {
        let queued = self
            .validate_device(kind, device_id)
            .and_then(|device_id| self.enqueue(kind, |done| TrackCommand::SelectDevice { device_id, done }));
        async move { queued?.await.map_err(|_| HuddleError::SessionClosed) }
    }

    /// Stop accepting commands and unpublish every lane.
    ///
    /// In-flight commands finish in the background but no longer touch the
    /// visible state. The returned future resolves when each lane has
    /// released its track.
    pub fn teardown(&self) -> impl Future<Output = ()> + Send + use<P> {
        self.closing.store(true, Ordering::SeqCst);
        self.release_device_subscriptions();

        let acks: Vec<oneshot::Receiver<()>> = self
            .lanes
            .values()
            .filter_map(|lane| {
                let (done, ack) = oneshot::channel();
                lane.send(TrackCommand::Teardown { done }).ok().map(|_| ack)
            })
            .collect();

        async move {
            for ack in acks {
                let _ = ack.await;
            }
        }
    }

    /// Mark every track disabled and unpublished without waiting for the transport.
    pub fn force_unpublished(&self) {
        let _dispatch = self.dispatch.lock();
        let changed: Vec<TrackState> = {
            let mut states = self.states.lock();
            states
                .values_mut()
                .filter(|s| s.enabled || s.publish_state != PublishState::Unpublished)
                .map(|s| {
                    s.enabled = false;
                    s.publish_state = PublishState::Unpublished;
                    s.clone()
                })
                .collect()
        };
        for state in changed {
            self.subscribers.emit(&state);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, callback: Callback<TrackState>) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn enqueue(
        &self,
        kind: TrackKind,
        command: impl FnOnce(oneshot::Sender<()>) -> TrackCommand,
    ) -> Result<oneshot::Receiver<()>, HuddleError> {
        let lane = self
            .lanes
            .get(&kind)
            .ok_or(HuddleError::ControlDisabled(kind.into()))?;
        if self.is_closing() {
            return Err(HuddleError::SessionClosed);
        }
        let (done, ack) = oneshot::channel();
        lane.send(command(done)).map_err(|_| HuddleError::SessionClosed)?;
        Ok(ack)
    }

    fn validate_device(&self, kind: TrackKind, device_id: &str) -> Result<String, HuddleError> {
        if !self.lanes.contains_key(&kind) {
            return Err(HuddleError::ControlDisabled(kind.into()));
        }
        let invalid = || HuddleError::InvalidDevice {
            kind,
            device_id: device_id.to_string(),
        };
        let device_kind = kind.device_kind().ok_or_else(invalid)?;
        self.registry
            .device(device_kind, device_id)
            .map(|device| device.id)
            .ok_or_else(invalid)
    }

    fn release_device_subscriptions(&self) {
        for id in self.device_subscriptions.lock().drain(..) {
            self.registry.unsubscribe(id);
        }
    }
}

impl<P: DevicePlatform> Drop for TrackController<P> {
    fn drop(&mut self) {
        self.release_device_subscriptions();
    }
}

/// What the transport currently has published for a lane.
struct LiveTrack {
    handle: TrackHandle,
    device_id: Option<String>,
}

struct TrackWorker<T, P> {
    kind: TrackKind,
    transport: Arc<T>,
    registry: Arc<DeviceRegistry<P>>,
    states: TrackStates,
    dispatch: Dispatch,
    subscribers: Arc<Subscribers<TrackState>>,
    notifications: Arc<NotificationQueue>,
    closing: Arc<AtomicBool>,
    live: Option<LiveTrack>,
}

impl<T: Transport, P: DevicePlatform> TrackWorker<T, P> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TrackCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                TrackCommand::SetEnabled { enabled, done } => {
                    if !self.is_closing() {
                        if enabled {
                            self.enable().await;
                        } else {
                            self.disable().await;
                        }
                    }
                    let _ = done.send(());
                }
                TrackCommand::SelectDevice { device_id, done } => {
                    if !self.is_closing() {
                        self.select(device_id).await;
                    }
                    let _ = done.send(());
                }
                TrackCommand::DevicesRemoved(removed) => {
                    if !self.is_closing() {
                        self.on_devices_removed(removed).await;
                    }
                }
                TrackCommand::Teardown { done } => {
                    self.release().await;
                    self.update(|s| {
                        s.enabled = false;
                        s.publish_state = PublishState::Unpublished;
                    });
                    let _ = done.send(());
                    break;
                }
            }
        }
        tracing::debug!(kind = %self.kind, "track lane ended");
    }

    async fn enable(&mut self) {
        let current = self.state();
        if current.enabled && current.publish_state == PublishState::Published {
            tracing::debug!(kind = %self.kind, "already published");
            return;
        }

        let device_id = match self.kind.device_kind() {
            None => None,
            Some(device_kind) => match self.resolve_device(device_kind, current.selected_device_id.as_deref()) {
                Some(id) => Some(id),
                None => {
                    tracing::warn!(kind = %self.kind, "no device available to publish");
                    self.update(|s| {
                        s.enabled = false;
                        s.selected_device_id = None;
                        s.publish_state = PublishState::Failed;
                    });
                    self.notify(
                        NotificationKind::Error,
                        format!("{} unavailable", self.kind.title()),
                        format!("No {} was found. Connect one and try again.", self.kind),
                    );
                    return;
                }
            },
        };

        self.update(|s| {
            s.enabled = true;
            s.selected_device_id = device_id.clone();
            s.publish_state = PublishState::Publishing;
        });

        if let Err(e) = self.publish(device_id).await {
            tracing::warn!(kind = %self.kind, "publish failed: {e}");
            self.settle(|s| {
                s.enabled = false;
                s.publish_state = PublishState::Failed;
            });
            self.notify(
                NotificationKind::Error,
                format!("{} could not be enabled", self.kind.title()),
                e.to_string(),
            );
        }
    }

    async fn disable(&mut self) {
        let current = self.state();
        if !current.enabled && self.live.is_none() {
            if current.publish_state == PublishState::Failed {
                self.update(|s| s.publish_state = PublishState::Unpublished);
            }
            tracing::debug!(kind = %self.kind, "already disabled");
            return;
        }

        // Optimistic: the caller sees the track off before the transport confirms.
        self.update(|s| {
            s.enabled = false;
            s.publish_state = PublishState::Unpublished;
        });
        self.release().await;
    }

    async fn select(&mut self, device_id: String) {
        let current = self.state();
        if current.selected_device_id.as_deref() == Some(device_id.as_str()) {
            tracing::debug!(kind = %self.kind, %device_id, "device already selected");
            return;
        }
        let Some(device_kind) = self.kind.device_kind() else { return };
        if self.registry.device(device_kind, &device_id).is_none() {
            tracing::warn!(kind = %self.kind, %device_id, "device vanished before it could be selected");
            return;
        }

        if !current.enabled || self.live.is_none() {
            self.update(|s| s.selected_device_id = Some(device_id.clone()));
            return;
        }

        // Live swap: `enabled` stays true for observers the whole time.
        let previous = current.selected_device_id.clone();
        tracing::info!(kind = %self.kind, from = ?previous, to = %device_id, "swapping device");
        self.update(|s| {
            s.selected_device_id = Some(device_id.clone());
            s.publish_state = PublishState::Publishing;
        });
        self.release().await;

        if let Err(e) = self.publish(Some(device_id)).await {
            tracing::warn!(kind = %self.kind, "publish on new device failed: {e}");
            self.notify(
                NotificationKind::Error,
                format!("Could not switch {}", self.kind),
                e.to_string(),
            );
            self.restore(previous).await;
        }
    }

    /// Republish on the device used before a failed swap.
    async fn restore(&mut self, previous: Option<String>) {
        if self.is_closing() {
            return;
        }
        let previous = previous.filter(|id| {
            self.kind
                .device_kind()
                .is_some_and(|device_kind| self.registry.device(device_kind, id).is_some())
        });
        let Some(previous) = previous else {
            self.update(|s| {
                s.enabled = false;
                s.publish_state = PublishState::Failed;
            });
            return;
        };

        self.update(|s| s.selected_device_id = Some(previous.clone()));
        if let Err(e) = self.publish(Some(previous)).await {
            tracing::warn!(kind = %self.kind, "restoring previous device failed: {e}");
            self.settle(|s| {
                s.enabled = false;
                s.publish_state = PublishState::Failed;
            });
        }
    }

    async fn on_devices_removed(&mut self, removed: Vec<String>) {
        let current = self.state();
        let Some(selected) = current.selected_device_id.clone() else { return };
        if !removed.contains(&selected) {
            return;
        }
        let Some(device_kind) = self.kind.device_kind() else { return };

        if !current.enabled {
            tracing::info!(kind = %self.kind, device_id = %selected, "selected device removed");
            self.update(|s| s.selected_device_id = None);
            return;
        }

        match self.registry.default_device(device_kind) {
            Some(fallback) => {
                tracing::info!(kind = %self.kind, from = %selected, to = %fallback.id, "device removed, falling back");
                self.update(|s| {
                    s.selected_device_id = Some(fallback.id.clone());
                    s.publish_state = PublishState::Publishing;
                });
                self.release().await;
                match self.publish(Some(fallback.id.clone())).await {
                    Ok(()) => self.notify(
                        NotificationKind::Warning,
                        format!("{} changed", self.kind.title()),
                        format!("Switched to {}.", fallback.label),
                    ),
                    Err(e) => {
                        tracing::warn!(kind = %self.kind, "fallback publish failed: {e}");
                        self.settle(|s| {
                            s.enabled = false;
                            s.publish_state = PublishState::Failed;
                        });
                        self.notify(
                            NotificationKind::Error,
                            format!("{} disconnected", self.kind.title()),
                            e.to_string(),
                        );
                    }
                }
            }
            None => {
                tracing::warn!(kind = %self.kind, device_id = %selected, "device removed, none left");
                self.update(|s| {
                    s.enabled = false;
                    s.selected_device_id = None;
                    s.publish_state = PublishState::Unpublished;
                });
                self.release().await;
                self.notify(
                    NotificationKind::Error,
                    format!("{} disconnected", self.kind.title()),
                    format!("No other {} is available.", self.kind),
                );
            }
        }
    }

    /// Publish and record the live track; marks the state published on success.
    async fn publish(&mut self, device_id: Option<String>) -> Result<(), HuddleError> {
        let handle = self.transport.publish(self.kind, device_id.as_deref()).await?;
        tracing::info!(kind = %self.kind, sid = %handle.sid, device_id = ?device_id, "track published");
        self.live = Some(LiveTrack { handle, device_id });
        self.settle(|s| s.publish_state = PublishState::Published);
        Ok(())
    }

    /// Unpublish whatever is live. Failures are logged only.
    async fn release(&mut self) {
        let Some(live) = self.live.take() else { return };
        match self.transport.unpublish(self.kind).await {
            Ok(()) => tracing::info!(kind = %self.kind, sid = %live.handle.sid, "track unpublished"),
            Err(e) => tracing::warn!(
                kind = %self.kind,
                sid = %live.handle.sid,
                device_id = ?live.device_id,
                "unpublish failed (ignored): {e}"
            ),
        }
    }

    fn resolve_device(&self, device_kind: DeviceKind, selected: Option<&str>) -> Option<String> {
        selected
            .and_then(|id| self.registry.device(device_kind, id))
            .or_else(|| self.registry.default_device(device_kind))
            .map(|device| device.id)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn state(&self) -> TrackState {
        self.states
            .lock()
            .get(&self.kind)
            .cloned()
            .unwrap_or_else(|| TrackState::new(self.kind))
    }

    fn update(&self, apply: impl FnOnce(&mut TrackState)) {
        let _dispatch = self.dispatch.lock();
        let changed = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(&self.kind) else { return };
            let before = state.clone();
            apply(state);
            (*state != before).then(|| state.clone())
        };
        if let Some(state) = changed {
            self.subscribers.emit(&state);
        }
    }

    /// Like `update`, but dropped once the session is closing.
    fn settle(&self, apply: impl FnOnce(&mut TrackState)) {
        if self.is_closing() {
            tracing::debug!(kind = %self.kind, "session closing, result discarded");
            return;
        }
        self.update(apply);
    }

    fn notify(&self, kind: NotificationKind, title: String, description: String) {
        if self.is_closing() {
            return;
        }
        self.notifications.notify(kind, title, description);
    }
}
