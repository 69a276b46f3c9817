use thiserror::Error;

use crate::config::Control;
use crate::tracks::TrackKind;

#[derive(Debug, Error)]
pub enum HuddleError {
    #[error("device enumeration failed: {0}")]
    DeviceEnumeration(#[from] PlatformError),
    #[error("no {kind} device with id {device_id:?}")]
    InvalidDevice { kind: TrackKind, device_id: String },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("duplicate chat entry: {0}")]
    DuplicateEntry(String),
    #[error("control disabled: {0}")]
    ControlDisabled(Control),
    #[error("session closed")]
    SessionClosed,
}

/// Failures reported by the media transport collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("unpublish failed: {0}")]
    Unpublish(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Failures reported by the host device platform.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("devices unavailable: {0}")]
    Unavailable(String),
}
