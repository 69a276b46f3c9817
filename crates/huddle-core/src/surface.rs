//! The facade the rendering layer talks to.
//!
//! `ControlSurface` owns the track controller, chat timeline and
//! notification queue of one session, shares a device registry with other
//! sessions, and turns transport callbacks into queued events handled by
//! its own loop.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::chat::{ChatAppended, ChatEntry, ChatTimeline};
use crate::config::{Control, ControlConfig};
use crate::devices::{Device, DeviceChange, DeviceKind, DevicePlatform, DeviceRegistry};
use crate::errors::HuddleError;
use crate::events::{ConnectionState, EventEmitter, HuddleEvent, HuddleEventListener, SubscriptionId};
use crate::notifications::{DismissedNotification, Notification, NotificationEvent, NotificationKind, NotificationQueue};
use crate::settings::Settings;
use crate::tracks::{TrackController, TrackKind, TrackState};
use crate::transport::{RemoteChatMessage, Transport};

/// How often expired notifications are swept when nothing else touches the queue.
const NOTIFICATION_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle of one session.
///
/// ```text
/// Connecting → Active → Leaving → Left
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Leaving,
    Left,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        matches!(self, SessionState::Leaving | SessionState::Left)
    }
}

/// Point-in-time copy of everything the rendering layer draws.
#[derive(Debug, Clone)]
pub struct SurfaceSnapshot {
    pub state: SessionState,
    pub connection: ConnectionState,
    pub config: ControlConfig,
    pub tracks: Vec<TrackState>,
    pub audio_inputs: Vec<Device>,
    pub video_inputs: Vec<Device>,
    pub chat: Vec<ChatEntry>,
    pub notifications: Vec<Notification>,
}

impl SurfaceSnapshot {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackState> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

enum SurfaceEvent {
    RemoteMessage(RemoteChatMessage),
    Connection(ConnectionState),
}

pub struct ControlSurface<T: Transport, P: DevicePlatform> {
    inner: Arc<SurfaceInner<T, P>>,
}

struct SurfaceInner<T: Transport, P: DevicePlatform> {
    config: ControlConfig,
    settings: Settings,
    /// Watched so a second `leave` can wait for the first one to finish.
    state: watch::Sender<SessionState>,
    connection: Mutex<ConnectionState>,
    transport: Arc<T>,
    registry: Arc<DeviceRegistry<P>>,
    tracks: TrackController<P>,
    chat: ChatTimeline,
    notifications: Arc<NotificationQueue>,
    emitter: EventEmitter,
    device_subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl<T: Transport, P: DevicePlatform> ControlSurface<T, P> {
    /// Build a surface in the `Connecting` state. Must be called from within a tokio runtime.
    pub fn new(
        config: ControlConfig,
        settings: Settings,
        transport: Arc<T>,
        registry: Arc<DeviceRegistry<P>>,
    ) -> Self {
        let emitter = EventEmitter::new();
        let notifications = Arc::new(NotificationQueue::from_settings(&settings));
        let tracks = TrackController::new(
            &config.track_kinds(),
            transport.clone(),
            registry.clone(),
            notifications.clone(),
        );
        let chat = ChatTimeline::new();

        let e = emitter.clone();
        tracks.subscribe(Arc::new(move |state: &TrackState| {
            e.emit(HuddleEvent::TrackChanged(state.clone()));
        }));
        let e = emitter.clone();
        chat.subscribe(Arc::new(move |appended: &ChatAppended| {
            e.emit(HuddleEvent::ChatAppended {
                entry: appended.entry.clone(),
                position: appended.position,
            });
        }));
        let e = emitter.clone();
        notifications.subscribe(Arc::new(move |event: &NotificationEvent| {
            e.emit(match event {
                NotificationEvent::Shown(n) => HuddleEvent::NotificationShown(n.clone()),
                NotificationEvent::Dismissed { id, reason } => HuddleEvent::NotificationDismissed {
                    id: id.clone(),
                    reason: *reason,
                },
            });
        }));
        let device_subscriptions = [DeviceKind::AudioInput, DeviceKind::VideoInput]
            .into_iter()
            .map(|kind| {
                let e = emitter.clone();
                registry.subscribe(
                    kind,
                    Arc::new(move |change: &DeviceChange| e.emit(HuddleEvent::DevicesChanged(change.clone()))),
                )
            })
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let messages = tx.clone();
        transport.on_remote_message(Arc::new(move |msg: &RemoteChatMessage| {
            let _ = messages.send(SurfaceEvent::RemoteMessage(msg.clone()));
        }));
        transport.on_connection_state_change(Arc::new(move |state: &ConnectionState| {
            let _ = tx.send(SurfaceEvent::Connection(state.clone()));
        }));

        let inner = Arc::new(SurfaceInner {
            config,
            settings,
            state: watch::Sender::new(SessionState::Connecting),
            connection: Mutex::new(ConnectionState::Connecting),
            transport,
            registry,
            tracks,
            chat,
            notifications,
            emitter,
            device_subscriptions: Mutex::new(device_subscriptions),
        });
        tokio::spawn(SurfaceInner::event_loop(Arc::downgrade(&inner), rx));

        Self { inner }
    }

    /// Enumerate devices and enter `Active`, then apply the join preferences.
    ///
    /// Can be retried after a failed enumeration.
    pub async fn connect(&self) -> Result<(), HuddleError> {
        match self.session_state() {
            SessionState::Active => return Ok(()),
            SessionState::Leaving | SessionState::Left => return Err(HuddleError::SessionClosed),
            SessionState::Connecting => {}
        }

        if let Err(e) = self.inner.registry.refresh().await {
            tracing::warn!("device enumeration failed while connecting: {e}");
            self.inner
                .notifications
                .notify(NotificationKind::Error, "Devices unavailable", e.to_string());
            return Err(e);
        }

        if !self.inner.transition(SessionState::Connecting, SessionState::Active) {
            return match self.session_state() {
                SessionState::Active => Ok(()),
                _ => Err(HuddleError::SessionClosed),
            };
        }
        tracing::info!("session active");

        let settings = &self.inner.settings;
        let mut pending = Vec::new();
        if settings.mic_enabled_on_join && self.inner.config.microphone {
            pending.push(self.inner.tracks.set_enabled(TrackKind::Microphone, true));
        }
        if settings.camera_enabled_on_join && self.inner.config.camera {
            pending.push(self.inner.tracks.set_enabled(TrackKind::Camera, true));
        }
        for join in pending {
            if let Err(e) = join.await {
                tracing::debug!("join preference not applied: {e}");
            }
        }
        Ok(())
    }

    /// Enable or disable a local track.
    ///
    /// Rejections (disabled control, closed session) come back as errors;
    /// transport and device failures surface as notifications instead.
    pub fn toggle_track(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> impl Future<Output = Result<(), HuddleError>> + Send + use<T, P> {
        let queued = self
            .inner
            .check(Control::from(kind))
            .map(|()| self.inner.tracks.set_enabled(kind, enabled));
        async move { queued?.await }
    }

    pub fn select_device(
        &self,
        kind: TrackKind,
        device_id: &str,
    ) -> impl Future<Output = Result<(), HuddleError>> + Send + use<T, P> {
        let queued = self
            .inner
            .check(Control::from(kind))
            .map(|()| self.inner.tracks.select_device(kind, device_id));
        async move { queued?.await }
    }

    /// Post a chat message. Blank text is ignored and yields `None`.
    pub async fn send_message(&self, text: &str) -> Result<Option<ChatEntry>, HuddleError> {
        self.inner.check(Control::Chat)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let entry = ChatEntry::local(self.inner.settings.author_name(), text);
        self.inner.chat.append(entry.clone())?;

        if let Err(e) = self.inner.transport.send_chat(text).await {
            tracing::warn!(id = %entry.id, "chat send failed: {e}");
            self.inner
                .notifications
                .notify(NotificationKind::Error, "Message not sent", e.to_string());
        }
        Ok(Some(entry))
    }

    /// Returns false if the notification was already gone.
    pub fn dismiss_notification(&self, id: &str) -> Result<bool, HuddleError> {
        if self.session_state().is_closed() {
            return Err(HuddleError::SessionClosed);
        }
        Ok(self.inner.notifications.dismiss(id))
    }

    /// Unpublish everything and close the session. Calling it again is a no-op.
    pub async fn leave(&self) -> Result<(), HuddleError> {
        if !self.inner.config.leave {
            return Err(HuddleError::ControlDisabled(Control::Leave));
        }
        self.inner.shut_down("left by user").await;
        Ok(())
    }

    pub fn snapshot(&self) -> SurfaceSnapshot {
        let inner = &self.inner;
        SurfaceSnapshot {
            state: inner.session_state(),
            connection: inner.connection.lock().clone(),
            config: inner.config,
            tracks: inner.tracks.states(),
            audio_inputs: inner.registry.devices_of(DeviceKind::AudioInput),
            video_inputs: inner.registry.devices_of(DeviceKind::VideoInput),
            chat: inner.chat.entries(),
            notifications: inner.notifications.visible(),
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.session_state()
    }

    pub fn config(&self) -> ControlConfig {
        self.inner.config
    }

    pub fn notification_history(&self) -> Vec<DismissedNotification> {
        self.inner.notifications.history()
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) -> SubscriptionId {
        self.inner.emitter.add_listener(listener)
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.inner.emitter.remove_listener(id)
    }
}

impl<T: Transport, P: DevicePlatform> SurfaceInner<T, P> {
    fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn check(&self, control: Control) -> Result<(), HuddleError> {
        if self.session_state().is_closed() {
            return Err(HuddleError::SessionClosed);
        }
        if !self.config.is_enabled(control) {
            return Err(HuddleError::ControlDisabled(control));
        }
        Ok(())
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        });
        if !moved {
            return false;
        }
        self.emitter.emit(HuddleEvent::SessionStateChanged(to));
        true
    }

    /// Start teardown unless it is already underway, then wait for `Left`.
    ///
    /// The teardown itself runs on its own task, so a dropped `leave` future
    /// cannot strand the session in `Leaving`.
    async fn shut_down(self: &Arc<Self>, reason: &str) {
        let started = self.state.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = SessionState::Leaving;
            true
        });
        if started {
            self.emitter.emit(HuddleEvent::SessionStateChanged(SessionState::Leaving));
            tracing::info!(reason, "leaving session");
            let inner = self.clone();
            tokio::spawn(async move { inner.finish_teardown().await });
        } else {
            tracing::debug!(reason, "teardown already underway");
        }

        let mut state = self.state.subscribe();
        // The sender lives in `self`, so this only returns once `Left` is seen.
        let _ = state.wait_for(|state| *state == SessionState::Left).await;
    }

    async fn finish_teardown(&self) {
        let timeout = self.settings.teardown_timeout();
        if tokio::time::timeout(timeout, self.tracks.teardown()).await.is_err() {
            tracing::warn!(?timeout, "track teardown timed out, closing anyway");
            self.tracks.force_unpublished();
        }
        self.release_device_subscriptions();

        // Waiters are woken only after listeners have seen `Left`.
        self.state.send_if_modified(|state| {
            *state = SessionState::Left;
            false
        });
        self.emitter.emit(HuddleEvent::SessionStateChanged(SessionState::Left));
        self.state.send_modify(|_| {});
        tracing::info!("session left");
    }

    fn receive_remote(&self, msg: RemoteChatMessage) {
        if self.session_state() == SessionState::Left {
            tracing::debug!(id = %msg.id, "chat message after leave dropped");
            return;
        }
        match self.chat.append(ChatEntry::from(msg)) {
            Ok(_) => {}
            Err(HuddleError::DuplicateEntry(id)) => {
                tracing::debug!(%id, "duplicate chat delivery ignored");
            }
            Err(e) => tracing::warn!("remote chat message rejected: {e}"),
        }
    }

    fn on_connection_state(self: &Arc<Self>, state: ConnectionState) {
        *self.connection.lock() = state.clone();
        self.emitter.emit(HuddleEvent::ConnectionStateChanged(state.clone()));

        let live = matches!(self.session_state(), SessionState::Connecting | SessionState::Active);
        if state == ConnectionState::Disconnected && live {
            tracing::warn!("transport disconnected, tearing down session");
            self.notifications.notify(
                NotificationKind::Error,
                "Connection lost",
                "The session ended unexpectedly.",
            );
            let inner = self.clone();
            tokio::spawn(async move {
                inner.shut_down("transport disconnected").await;
            });
        }
    }

    fn release_device_subscriptions(&self) {
        for id in self.device_subscriptions.lock().drain(..) {
            self.registry.unsubscribe(id);
        }
    }

    async fn event_loop(weak: Weak<Self>, mut events: mpsc::UnboundedReceiver<SurfaceEvent>) {
        let mut sweep = tokio::time::interval(NOTIFICATION_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
                _ = sweep.tick() => None,
            };
            let Some(inner) = weak.upgrade() else { break };

            match event {
                Some(SurfaceEvent::RemoteMessage(msg)) => inner.receive_remote(msg),
                Some(SurfaceEvent::Connection(state)) => inner.on_connection_state(state),
                None => {
                    inner.notifications.expire(Instant::now());
                }
            }

            if inner.session_state() == SessionState::Left {
                break;
            }
        }
        tracing::debug!("surface event loop ended");
    }
}

impl<T: Transport, P: DevicePlatform> Drop for SurfaceInner<T, P> {
    fn drop(&mut self) {
        self.release_device_subscriptions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaving_and_left_are_closed() {
        assert!(!SessionState::Connecting.is_closed());
        assert!(!SessionState::Active.is_closed());
        assert!(SessionState::Leaving.is_closed());
        assert!(SessionState::Left.is_closed());
    }

    #[test]
    fn snapshot_track_lookup() {
        let snapshot = SurfaceSnapshot {
            state: SessionState::Active,
            connection: ConnectionState::Connected,
            config: ControlConfig::default(),
            tracks: vec![TrackState {
                kind: TrackKind::Camera,
                enabled: true,
                selected_device_id: Some("cam".to_string()),
                publish_state: crate::tracks::PublishState::Published,
            }],
            audio_inputs: Vec::new(),
            video_inputs: Vec::new(),
            chat: Vec::new(),
            notifications: Vec::new(),
        };
        assert!(snapshot.track(TrackKind::Camera).is_some_and(|t| t.enabled));
        assert!(snapshot.track(TrackKind::Microphone).is_none());
    }
}
