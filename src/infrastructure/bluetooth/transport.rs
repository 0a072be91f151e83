//! BLE transport boundary
//!
//! The host Bluetooth stack is reached through [`BleTransport`]. Requests
//! return as soon as they are queued; their outcomes arrive later as
//! [`TransportEvent`]s on the channel the transport was built with.

use crate::domain::models::{PeripheralHandle, PeripheralId};
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characteristic write delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    /// Acknowledged; a `WriteComplete` event reports the outcome
    WithResponse,
    /// Fire-and-forget; no completion event
    WithoutResponse,
}

/// Restricts a scan to peripherals advertising any of `services`.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peripheral: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Asynchronous notifications from the host stack.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Discovered(Advertisement),
    Connected(PeripheralId),
    Disconnected {
        peripheral: PeripheralId,
        error: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    WriteComplete {
        peripheral: PeripheralId,
        characteristic: Uuid,
        error: Option<String>,
    },
    Notification {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn peripheral(&self) -> PeripheralId {
        match self {
            Self::Discovered(adv) => adv.peripheral,
            Self::Connected(peripheral)
            | Self::Disconnected { peripheral, .. }
            | Self::ServicesDiscovered { peripheral, .. }
            | Self::CharacteristicsDiscovered { peripheral, .. }
            | Self::WriteComplete { peripheral, .. }
            | Self::Notification { peripheral, .. } => *peripheral,
        }
    }
}

/// Requests understood by the host Bluetooth stack.
pub trait BleTransport: Send + Sync {
    fn start_scan(&self, filter: &ScanFilter, allow_duplicates: bool)
        -> Result<(), TransportError>;

    fn stop_scan(&self) -> Result<(), TransportError>;

    fn connect(&self, peripheral: PeripheralId) -> Result<(), TransportError>;

    fn cancel_connection(&self, peripheral: PeripheralId) -> Result<(), TransportError>;

    /// Peripherals connected to this host, whoever initiated the connection.
    fn retrieve_connected(&self) -> Result<Vec<PeripheralHandle>, TransportError>;

    fn discover_services(&self, peripheral: PeripheralId) -> Result<(), TransportError>;

    fn discover_characteristics(
        &self,
        peripheral: PeripheralId,
        service: Uuid,
    ) -> Result<(), TransportError>;

    fn set_notify(
        &self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn write_value(
        &self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;
}
