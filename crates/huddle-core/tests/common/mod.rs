#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use huddle_core::devices::ChangeNotifier;
use huddle_core::events::{Callback, Subscribers};
use huddle_core::{
    ConnectionState, ControlConfig, ControlSurface, Device, DeviceKind, DevicePlatform, DeviceRegistry, HuddleEvent,
    HuddleEventListener, PlatformError, RemoteChatMessage, Settings, TrackHandle, TrackKind, Transport,
};
use huddle_core::errors::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Publish { kind: TrackKind, device_id: Option<String> },
    Unpublish(TrackKind),
    Send(String),
}

/// Transport double that records calls and detects overlapping calls per kind.
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    in_flight: Mutex<HashMap<TrackKind, usize>>,
    overlaps: AtomicUsize,
    published: AtomicUsize,
    delay: Mutex<Duration>,
    failing_devices: Mutex<HashSet<String>>,
    fail_publish: AtomicBool,
    fail_send: AtomicBool,
    hang_unpublish: AtomicBool,
    messages: Subscribers<RemoteChatMessage>,
    connection: Subscribers<ConnectionState>,
}

struct InFlight<'a> {
    transport: &'a FakeTransport,
    kind: TrackKind,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.transport.in_flight.lock().get_mut(&self.kind) {
            *count -= 1;
        }
    }
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let transport = Self::default();
        *transport.delay.lock() = delay;
        Arc::new(transport)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn publish_count(&self, kind: TrackKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Publish { kind: k, .. } if *k == kind))
            .count()
    }

    pub fn unpublish_count(&self, kind: TrackKind) -> usize {
        self.calls().iter().filter(|c| **c == Call::Unpublish(kind)).count()
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn fail_device(&self, device_id: &str) {
        self.failing_devices.lock().insert(device_id.to_string());
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn set_hang_unpublish(&self, hang: bool) {
        self.hang_unpublish.store(hang, Ordering::SeqCst);
    }

    pub fn deliver(&self, msg: RemoteChatMessage) {
        self.messages.emit(&msg);
    }

    pub fn set_connection(&self, state: ConnectionState) {
        self.connection.emit(&state);
    }

    fn enter(&self, kind: TrackKind) -> InFlight<'_> {
        let mut in_flight = self.in_flight.lock();
        let count = in_flight.entry(kind).or_insert(0);
        if *count > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        *count += 1;
        InFlight { transport: self, kind }
    }

    fn delay(&self) -> Duration {
        *self.delay.lock()
    }
}

impl Transport for FakeTransport {
    async fn publish(&self, kind: TrackKind, device_id: Option<&str>) -> Result<TrackHandle, TransportError> {
        let device_id = device_id.map(str::to_string);
        self.calls.lock().push(Call::Publish {
            kind,
            device_id: device_id.clone(),
        });
        let _in_flight = self.enter(kind);
        tokio::time::sleep(self.delay()).await;

        let failing = device_id
            .as_ref()
            .is_some_and(|id| self.failing_devices.lock().contains(id));
        if failing || self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("simulated failure".to_string()));
        }
        let n = self.published.fetch_add(1, Ordering::SeqCst);
        Ok(TrackHandle { sid: format!("TR_{n}") })
    }

    async fn unpublish(&self, kind: TrackKind) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Unpublish(kind));
        let _in_flight = self.enter(kind);
        if self.hang_unpublish.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay()).await;
        Ok(())
    }

    async fn send_chat(&self, text: &str) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Send(text.to_string()));
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Send("simulated failure".to_string()));
        }
        Ok(())
    }

    fn on_remote_message(&self, callback: Callback<RemoteChatMessage>) {
        self.messages.subscribe(callback);
    }

    fn on_connection_state_change(&self, callback: Callback<ConnectionState>) {
        self.connection.subscribe(callback);
    }
}

/// Device platform double with a mutable device list.
#[derive(Default)]
pub struct FakePlatform {
    devices: Mutex<Vec<Device>>,
    denied: AtomicBool,
    notifier: Mutex<Option<ChangeNotifier>>,
}

impl FakePlatform {
    pub fn with_devices(devices: Vec<Device>) -> Arc<Self> {
        let platform = Self::default();
        *platform.devices.lock() = devices;
        Arc::new(platform)
    }

    /// Replace the device list and fire the hot-plug notifier.
    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock() = devices;
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier();
        }
    }

    pub fn deny(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }
}

impl DevicePlatform for FakePlatform {
    async fn enumerate_devices(&self) -> Result<Vec<Device>, PlatformError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(PlatformError::PermissionDenied);
        }
        Ok(self.devices.lock().clone())
    }

    fn on_device_change(&self, notifier: ChangeNotifier) {
        *self.notifier.lock() = Some(notifier);
    }
}

/// Listener that keeps every event it sees.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<HuddleEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<HuddleEvent> {
        self.events.lock().clone()
    }

    pub fn track_states(&self, kind: TrackKind) -> Vec<huddle_core::TrackState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HuddleEvent::TrackChanged(state) if state.kind == kind => Some(state),
                _ => None,
            })
            .collect()
    }
}

impl HuddleEventListener for Recorder {
    fn on_event(&self, event: HuddleEvent) {
        self.events.lock().push(event);
    }
}

pub fn mic(id: &str, is_default: bool) -> Device {
    Device::new(id, DeviceKind::AudioInput, format!("Mic {id}"), is_default)
}

pub fn cam(id: &str, is_default: bool) -> Device {
    Device::new(id, DeviceKind::VideoInput, format!("Camera {id}"), is_default)
}

/// Settings that publish nothing on join.
pub fn quiet_settings() -> Settings {
    Settings {
        mic_enabled_on_join: false,
        camera_enabled_on_join: false,
        ..Settings::default()
    }
}

pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub platform: Arc<FakePlatform>,
    pub registry: Arc<DeviceRegistry<FakePlatform>>,
    pub surface: ControlSurface<FakeTransport, FakePlatform>,
}

pub fn harness(
    config: ControlConfig,
    settings: Settings,
    transport: Arc<FakeTransport>,
    devices: Vec<Device>,
) -> Harness {
    let platform = FakePlatform::with_devices(devices);
    let registry = DeviceRegistry::new(platform.clone());
    let surface = ControlSurface::new(config, settings, transport.clone(), registry.clone());
    Harness {
        transport,
        platform,
        registry,
        surface,
    }
}

/// Poll `check` until it holds, letting spawned tasks and timers run.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
