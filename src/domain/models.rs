use crate::domain::commands::SpheroCommand;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a remote peripheral, as reported by the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(pub Uuid);

impl PeripheralId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Waking,
    Active,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A peripheral tracked by the connection manager's registry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralHandle {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub state: ConnectionState,
}

impl PeripheralHandle {
    pub fn new(id: PeripheralId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            rssi: None,
            state: ConnectionState::Idle,
        }
    }

    /// Name shown to the user, falling back to the identifier.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// Heading/speed pair derived from a touch on the control disc.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlVector {
    /// Degrees in `[0, 360)`.
    pub heading: f64,
    /// Magnitude in `[0, 1]`.
    pub speed: f64,
    pub stop: bool,
}

impl ControlVector {
    pub fn stop() -> Self {
        Self {
            heading: 0.0,
            speed: 0.0,
            stop: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Requests from the host application to the Bluetooth worker.
#[derive(Debug, Clone)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    Connect(PeripheralId),
    Disconnect,
    ListConnected,
    Drive(ControlVector),
    SetColor(Rgb),
    Send(SpheroCommand),
    Sleep,
    Wake,
    Shutdown,
}

/// Events published by the Bluetooth worker.
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(PeripheralHandle),
    ScanFinished,
    ConnectionState {
        peripheral: PeripheralId,
        state: ConnectionState,
    },
    ConnectedPeripherals(Vec<PeripheralHandle>),
    CommandSent {
        sequence: u8,
    },
    Response {
        peripheral: PeripheralId,
        bytes: Vec<u8>,
    },
    Failure(ProtocolError),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
