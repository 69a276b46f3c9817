//! Huddle core: the in-call control surface.
//!
//! Pure Rust crate with no platform dependencies. Hosts plug in a media
//! [`Transport`] and a [`DevicePlatform`], then drive a [`ControlSurface`]
//! and render from its snapshots and events.

pub mod chat;
pub mod config;
pub mod devices;
pub mod errors;
pub mod events;
#[cfg(feature = "livekit")]
pub mod livekit_transport;
pub mod logging;
pub mod notifications;
pub mod settings;
pub mod surface;
pub mod tracks;
pub mod transport;

pub use chat::{ChatEntry, ChatOrigin, ChatTimeline};
pub use config::{Control, ControlConfig};
pub use devices::{Device, DeviceChange, DeviceKind, DevicePlatform, DeviceRegistry};
pub use errors::{HuddleError, PlatformError, TransportError};
pub use events::{ConnectionState, HuddleEvent, HuddleEventListener, SubscriptionId};
pub use logging::init_logging;
pub use notifications::{Notification, NotificationKind, NotificationQueue, Ttl};
pub use settings::{Settings, SettingsStore};
pub use surface::{ControlSurface, SessionState, SurfaceSnapshot};
pub use tracks::{PublishState, TrackController, TrackKind, TrackState};
pub use transport::{RemoteChatMessage, TrackHandle, Transport};
