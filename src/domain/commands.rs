//! Sphero command catalogue
//!
//! Typed application commands and their device/command identifiers. The
//! byte framing lives in `infrastructure::bluetooth::codec`.

use crate::domain::models::{ControlVector, Rgb};
use serde::{Deserialize, Serialize};

/// Virtual device addressed by a command packet.
pub mod device_id {
    pub const CORE: u8 = 0x00;
    pub const SPHERO: u8 = 0x02;
}

/// Command identifiers within each virtual device.
pub mod command_id {
    pub const PING: u8 = 0x01;
    pub const SET_HEADING: u8 = 0x01;
    pub const SET_STABILIZATION: u8 = 0x02;
    pub const SET_RGB_LED: u8 = 0x20;
    pub const SET_BACK_LED: u8 = 0x21;
    pub const ROLL: u8 = 0x30;
}

/// Groups commands for delivery-mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// High-frequency drive commands
    Motion,
    /// LED colour and brightness
    Lighting,
    /// Everything else (ping, heading, stabilisation)
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollState {
    Stop,
    Go,
}

impl RollState {
    fn as_byte(self) -> u8 {
        match self {
            Self::Stop => 0x00,
            Self::Go => 0x01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpheroCommand {
    /// Liveness check
    Ping,
    /// Redefine the current orientation as heading 0
    SetHeading(u16),
    /// Enable or disable the internal stabilisation loop
    SetStabilization(bool),
    /// Main LED colour; `persist` stores it as the user colour
    SetRgbLed { color: Rgb, persist: bool },
    /// Tail light brightness used for aiming
    SetBackLed(u8),
    /// Drive at `speed` (0-255) towards `heading` degrees
    Roll {
        speed: u8,
        heading: u16,
        state: RollState,
    },
}

impl SpheroCommand {
    pub fn device_id(&self) -> u8 {
        match self {
            Self::Ping => device_id::CORE,
            _ => device_id::SPHERO,
        }
    }

    pub fn command_id(&self) -> u8 {
        match self {
            Self::Ping => command_id::PING,
            Self::SetHeading(_) => command_id::SET_HEADING,
            Self::SetStabilization(_) => command_id::SET_STABILIZATION,
            Self::SetRgbLed { .. } => command_id::SET_RGB_LED,
            Self::SetBackLed(_) => command_id::SET_BACK_LED,
            Self::Roll { .. } => command_id::ROLL,
        }
    }

    /// Payload bytes; multi-byte fields are big-endian.
    pub fn payload(&self) -> Vec<u8> {
        match *self {
            Self::Ping => Vec::new(),
            Self::SetHeading(heading) => (heading % 360).to_be_bytes().to_vec(),
            Self::SetStabilization(enabled) => vec![u8::from(enabled)],
            Self::SetRgbLed { color, persist } => {
                vec![color.red, color.green, color.blue, u8::from(persist)]
            }
            Self::SetBackLed(brightness) => vec![brightness],
            Self::Roll {
                speed,
                heading,
                state,
            } => {
                let [hi, lo] = (heading % 360).to_be_bytes();
                vec![speed, hi, lo, state.as_byte()]
            }
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Roll { .. } => CommandKind::Motion,
            Self::SetRgbLed { .. } | Self::SetBackLed(_) => CommandKind::Lighting,
            Self::Ping | Self::SetHeading(_) | Self::SetStabilization(_) => CommandKind::System,
        }
    }

    pub fn color(color: Rgb) -> Self {
        Self::SetRgbLed {
            color,
            persist: false,
        }
    }
}

impl From<ControlVector> for SpheroCommand {
    fn from(vector: ControlVector) -> Self {
        if vector.stop {
            return Self::Roll {
                speed: 0,
                heading: 0,
                state: RollState::Stop,
            };
        }

        let speed = (vector.speed.clamp(0.0, 1.0) * 255.0).round() as u8;
        let heading = (vector.heading.round() as u16) % 360;
        Self::Roll {
            speed,
            heading,
            state: RollState::Go,
        }
    }
}
