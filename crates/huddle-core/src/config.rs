use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tracks::TrackKind;

/// A user-facing control on the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Leave,
    Chat,
    Camera,
    Microphone,
    ScreenShare,
}

impl From<TrackKind> for Control {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Microphone => Control::Microphone,
            TrackKind::Camera => Control::Camera,
            TrackKind::ScreenShare => Control::ScreenShare,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Control::Leave => "leave",
            Control::Chat => "chat",
            Control::Camera => "camera",
            Control::Microphone => "microphone",
            Control::ScreenShare => "screen share",
        };
        f.write_str(name)
    }
}

/// Which controls a session exposes. Fixed for the lifetime of a surface.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlConfig {
    #[serde(default = "default_true")]
    pub leave: bool,
    #[serde(default = "default_true")]
    pub chat: bool,
    #[serde(default = "default_true")]
    pub camera: bool,
    #[serde(default = "default_true")]
    pub microphone: bool,
    #[serde(default = "default_true")]
    pub screen_share: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            leave: true,
            chat: true,
            camera: true,
            microphone: true,
            screen_share: true,
        }
    }
}

impl ControlConfig {
    pub fn is_enabled(&self, control: Control) -> bool {
        match control {
            Control::Leave => self.leave,
            Control::Chat => self.chat,
            Control::Camera => self.camera,
            Control::Microphone => self.microphone,
            Control::ScreenShare => self.screen_share,
        }
    }

    /// Track kinds that get a controller lane.
    pub fn track_kinds(&self) -> Vec<TrackKind> {
        TrackKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(Control::from(*kind)))
            .collect()
    }
}
