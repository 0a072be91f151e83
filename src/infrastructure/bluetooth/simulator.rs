//! In-process Sphero simulator
//!
//! Implements [`BleTransport`] without any radio. Every request is answered
//! by pushing the matching [`TransportEvent`] onto the event channel, so the
//! caller sees the same asynchronous delivery a real stack gives. Used for
//! integration testing and by the demo binary.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::lock;
use super::protocol::{CharacteristicRole, CONTROL_SERVICE_UUID, RADIO_SERVICE_UUID};
use super::transport::{Advertisement, BleTransport, ScanFilter, TransportEvent, WriteMode};
use crate::domain::models::{ConnectionState, PeripheralHandle, PeripheralId};
use crate::error::TransportError;

/// Device information service present on every Sphero.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
const MANUFACTURER_NAME_UUID: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/// A simulated robot and its GATT layout.
#[derive(Debug, Clone)]
pub struct SimulatedSphero {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<(Uuid, Vec<Uuid>)>,
}

impl SimulatedSphero {
    /// A robot exposing the standard control, radio and device-info services.
    pub fn new(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::unnamed()
        }
    }

    /// A robot that advertises without a local name.
    pub fn unnamed() -> Self {
        let control = vec![
            CharacteristicRole::Commands.uuid(),
            CharacteristicRole::Response.uuid(),
        ];
        let radio = vec![
            CharacteristicRole::TxPower.uuid(),
            CharacteristicRole::DeepSleep.uuid(),
            CharacteristicRole::AntiDos.uuid(),
            CharacteristicRole::Wake.uuid(),
        ];
        Self {
            id: PeripheralId::new_random(),
            name: None,
            rssi: -58,
            services: vec![
                (CONTROL_SERVICE_UUID, control),
                (RADIO_SERVICE_UUID, radio),
                (DEVICE_INFO_SERVICE_UUID, vec![MANUFACTURER_NAME_UUID]),
            ],
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Removes `characteristic` from every service, e.g. to model firmware
    /// that lacks a power-management endpoint.
    pub fn without_characteristic(mut self, characteristic: Uuid) -> Self {
        for (_, characteristics) in &mut self.services {
            characteristics.retain(|c| *c != characteristic);
        }
        self
    }

    fn advertises(&self, filter: &ScanFilter) -> bool {
        filter.services.is_empty()
            || self
                .services
                .iter()
                .any(|(service, _)| filter.services.contains(service))
    }
}

/// A characteristic write as seen by the simulated robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub peripheral: PeripheralId,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub mode: WriteMode,
}

/// Requests received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    StartScan { allow_duplicates: bool },
    StopScan,
    Connect(PeripheralId),
    CancelConnection(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(PeripheralId, Uuid),
    SetNotify(PeripheralId, Uuid, bool),
    Write(RecordedWrite),
}

#[derive(Default)]
struct SimState {
    devices: Vec<SimulatedSphero>,
    connected: HashSet<PeripheralId>,
    scan_filter: Option<ScanFilter>,
    announced: HashSet<PeripheralId>,
    allow_duplicates: bool,
    discovered: HashSet<(PeripheralId, Uuid)>,
    failing: HashMap<Uuid, String>,
    calls: Vec<SimCall>,
}

impl SimState {
    fn device(&self, id: PeripheralId) -> Result<&SimulatedSphero, TransportError> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or(TransportError::UnknownPeripheral(id))
    }

    fn require_connected(&self, id: PeripheralId) -> Result<&SimulatedSphero, TransportError> {
        let device = self.device(id)?;
        if !self.connected.contains(&id) {
            return Err(TransportError::Rejected(format!("{id} is not connected")));
        }
        Ok(device)
    }
}

pub struct SimulatedTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Places a robot in range. It is announced at once if a scan is running.
    pub fn add_device(&self, device: SimulatedSphero) -> PeripheralId {
        let id = device.id;
        let mut state = lock(&self.state);
        state.devices.push(device);
        if let Some(filter) = state.scan_filter.clone() {
            self.announce(&mut state, &filter);
        }
        id
    }

    /// Acknowledged writes to `characteristic` will report `reason`.
    pub fn fail_writes_to(&self, characteristic: Uuid, reason: &str) {
        lock(&self.state)
            .failing
            .insert(characteristic, reason.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failing.clear();
    }

    /// Simulates the robot dropping the link on its own.
    pub fn drop_connection(&self, peripheral: PeripheralId) {
        let mut state = lock(&self.state);
        if state.connected.remove(&peripheral) {
            state.discovered.retain(|(id, _)| *id != peripheral);
            self.emit(TransportEvent::Disconnected {
                peripheral,
                error: Some("link supervision timeout".to_string()),
            });
        }
    }

    /// Marks a robot as connected by another application on this host.
    pub fn connect_externally(&self, peripheral: PeripheralId) {
        lock(&self.state).connected.insert(peripheral);
    }

    /// Sends bytes on a characteristic as a notification from the robot.
    pub fn notify(&self, peripheral: PeripheralId, characteristic: Uuid, value: &[u8]) {
        self.emit(TransportEvent::Notification {
            peripheral,
            characteristic,
            value: value.to_vec(),
        });
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scan_filter.is_some()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        lock(&self.state).calls.clone()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                SimCall::Write(write) => Some(write.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<RecordedWrite> {
        self.writes()
            .into_iter()
            .filter(|w| w.characteristic == characteristic)
            .collect()
    }

    pub fn scan_starts(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| matches!(c, SimCall::StartScan { .. }))
            .count()
    }

    fn emit(&self, event: TransportEvent) {
        trace!("Simulator event: {:?}", event);
        // receiver gone means nobody is listening any more
        let _ = self.events.send(event);
    }

    fn announce(&self, state: &mut SimState, filter: &ScanFilter) {
        let mut fresh = Vec::new();
        for device in state.devices.iter().filter(|d| d.advertises(filter)) {
            if state.allow_duplicates || !state.announced.contains(&device.id) {
                fresh.push(Advertisement {
                    peripheral: device.id,
                    name: device.name.clone(),
                    rssi: Some(device.rssi),
                });
            }
        }
        for adv in fresh {
            state.announced.insert(adv.peripheral);
            self.emit(TransportEvent::Discovered(adv));
        }
    }
}

impl BleTransport for SimulatedTransport {
    fn start_scan(
        &self,
        filter: &ScanFilter,
        allow_duplicates: bool,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(SimCall::StartScan { allow_duplicates });
        state.allow_duplicates = allow_duplicates;
        state.scan_filter = Some(filter.clone());
        self.announce(&mut state, filter);
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(SimCall::StopScan);
        state.scan_filter = None;
        state.announced.clear();
        Ok(())
    }

    fn connect(&self, peripheral: PeripheralId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(SimCall::Connect(peripheral));
        state.device(peripheral)?;
        state.connected.insert(peripheral);
        debug!("Simulated connection to {}", peripheral);
        self.emit(TransportEvent::Connected(peripheral));
        Ok(())
    }

    fn cancel_connection(&self, peripheral: PeripheralId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(SimCall::CancelConnection(peripheral));
        if state.connected.remove(&peripheral) {
            state.discovered.retain(|(id, _)| *id != peripheral);
            self.emit(TransportEvent::Disconnected {
                peripheral,
                error: None,
            });
        }
        Ok(())
    }

    fn retrieve_connected(&self) -> Result<Vec<PeripheralHandle>, TransportError> {
        let state = lock(&self.state);
        Ok(state
            .devices
            .iter()
            .filter(|d| state.connected.contains(&d.id))
            .map(|d| PeripheralHandle {
                id: d.id,
                name: d.name.clone(),
                rssi: Some(d.rssi),
                state: ConnectionState::Connected,
            })
            .collect())
    }

    fn discover_services(&self, peripheral: PeripheralId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(SimCall::DiscoverServices(peripheral));
        let services = state
            .require_connected(peripheral)?
            .services
            .iter()
            .map(|(service, _)| *service)
            .collect();
        self.emit(TransportEvent::ServicesDiscovered {
            peripheral,
            services,
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        peripheral: PeripheralId,
        service: Uuid,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(SimCall::DiscoverCharacteristics(peripheral, service));
        let characteristics = state
            .require_connected(peripheral)?
            .services
            .iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, characteristics)| characteristics.clone())
            .ok_or_else(|| TransportError::Rejected(format!("unknown service {service}")))?;
        for characteristic in &characteristics {
            state.discovered.insert((peripheral, *characteristic));
        }
        self.emit(TransportEvent::CharacteristicsDiscovered {
            peripheral,
            service,
            characteristics,
        });
        Ok(())
    }

    fn set_notify(
        &self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(SimCall::SetNotify(peripheral, characteristic, enabled));
        state.require_connected(peripheral)?;
        if !state.discovered.contains(&(peripheral, characteristic)) {
            return Err(TransportError::Rejected(format!(
                "characteristic {characteristic} not discovered"
            )));
        }
        Ok(())
    }

    fn write_value(
        &self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.require_connected(peripheral)?;
        if !state.discovered.contains(&(peripheral, characteristic)) {
            return Err(TransportError::Rejected(format!(
                "characteristic {characteristic} not discovered"
            )));
        }

        state.calls.push(SimCall::Write(RecordedWrite {
            peripheral,
            characteristic,
            value: value.to_vec(),
            mode,
        }));
        if mode == WriteMode::WithResponse {
            let error = state.failing.get(&characteristic).cloned();
            self.emit(TransportEvent::WriteComplete {
                peripheral,
                characteristic,
                error,
            });
        }
        Ok(())
    }
}
