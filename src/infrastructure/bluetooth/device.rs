//! Per-peripheral protocol state machine
//!
//! Drives one connected Sphero from the connect event through service and
//! characteristic discovery, the wake sequence, and command traffic. All
//! transitions happen in the `on_*` handlers, which are fed transport events
//! one at a time by the service loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::codec::CommandPacket;
use super::protocol::{CharacteristicRole, POWER_TOKEN, ROLE_TABLE, WAKE_SEQUENCE};
use super::transport::{BleTransport, TransportEvent, WriteMode};
use crate::domain::commands::SpheroCommand;
use crate::domain::models::{ConnectionState, PeripheralId};
use crate::domain::settings::DeliverySettings;
use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
    pub discovered: bool,
}

/// Services found on the peripheral, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: Vec<ServiceEntry>,
}

impl ServiceCatalog {
    /// Appends `uuid` unless already present. Returns whether it was new.
    pub fn add_service(&mut self, uuid: Uuid) -> bool {
        if self.contains_service(uuid) {
            return false;
        }
        self.services.push(ServiceEntry {
            uuid,
            characteristics: Vec::new(),
            discovered: false,
        });
        true
    }

    pub fn set_characteristics(
        &mut self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), ProtocolError> {
        let entry = self
            .services
            .iter_mut()
            .find(|s| s.uuid == service)
            .ok_or(ProtocolError::DiscoveryStale)?;
        entry.characteristics = characteristics.to_vec();
        entry.discovered = true;
        Ok(())
    }

    pub fn contains_service(&self, uuid: Uuid) -> bool {
        self.services.iter().any(|s| s.uuid == uuid)
    }

    pub fn contains_characteristic(&self, uuid: Uuid) -> bool {
        self.services
            .iter()
            .any(|s| s.characteristics.contains(&uuid))
    }

    /// True once every known service has reported its characteristics.
    pub fn all_discovered(&self) -> bool {
        self.services.iter().all(|s| s.discovered)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    WakeStep(usize),
    Sleep,
    Command(u8),
}

/// An acknowledged write still waiting for its `WriteComplete`.
#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    characteristic: Uuid,
    kind: WriteKind,
}

pub struct DeviceProtocol {
    peripheral: PeripheralId,
    transport: Arc<dyn BleTransport>,
    delivery: DeliverySettings,
    state: ConnectionState,
    catalog: ServiceCatalog,
    bindings: HashMap<CharacteristicRole, Uuid>,
    wake_step: usize,
    wake_halted: bool,
    pending: VecDeque<PendingWrite>,
    sequence: u8,
}

impl DeviceProtocol {
    /// Tracks a peripheral whose connection has been requested.
    pub fn new(
        peripheral: PeripheralId,
        transport: Arc<dyn BleTransport>,
        delivery: DeliverySettings,
    ) -> Self {
        Self {
            peripheral,
            transport,
            delivery,
            state: ConnectionState::Connecting,
            catalog: ServiceCatalog::default(),
            bindings: HashMap::new(),
            wake_step: 0,
            wake_halted: false,
            pending: VecDeque::new(),
            sequence: 0,
        }
    }

    pub fn peripheral(&self) -> PeripheralId {
        self.peripheral
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// Routes a transport event to its handler. Returns the bytes of a
    /// response-channel notification, if the event was one.
    pub fn handle_event(&mut self, event: TransportEvent) -> Result<Option<Vec<u8>>, ProtocolError> {
        if event.peripheral() != self.peripheral {
            return Err(ProtocolError::DiscoveryStale);
        }

        match event {
            TransportEvent::Discovered(_) => {}
            TransportEvent::Connected(_) => self.on_connected()?,
            TransportEvent::Disconnected { error, .. } => self.on_disconnected(error)?,
            TransportEvent::ServicesDiscovered { services, .. } => {
                self.on_services_discovered(&services)?
            }
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                ..
            } => self.on_characteristics_discovered(service, &characteristics)?,
            TransportEvent::WriteComplete {
                characteristic,
                error,
                ..
            } => self.on_write_complete(characteristic, error)?,
            TransportEvent::Notification {
                characteristic,
                value,
                ..
            } => return Ok(self.on_notification(characteristic, value)),
        }
        Ok(None)
    }

    pub fn on_connected(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Idle => {}
            _ => return Err(ProtocolError::DiscoveryStale),
        }

        info!("Connected to {}, discovering services", self.peripheral);
        self.state = ConnectionState::Connected;
        self.transport.discover_services(self.peripheral)?;
        self.state = ConnectionState::DiscoveringServices;
        Ok(())
    }

    pub fn on_services_discovered(&mut self, services: &[Uuid]) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::DiscoveringServices | ConnectionState::DiscoveringCharacteristics => {}
            _ => return Err(ProtocolError::DiscoveryStale),
        }

        let fresh: Vec<Uuid> = services
            .iter()
            .copied()
            .filter(|uuid| self.catalog.add_service(*uuid))
            .collect();
        debug!(
            "Discovered {} services ({} new) on {}",
            services.len(),
            fresh.len(),
            self.peripheral
        );

        if !self.catalog.is_empty() {
            self.state = ConnectionState::DiscoveringCharacteristics;
        }
        for service in fresh {
            self.transport
                .discover_characteristics(self.peripheral, service)?;
        }
        Ok(())
    }

    pub fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), ProtocolError> {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Disconnecting
        ) {
            return Err(ProtocolError::DiscoveryStale);
        }
        self.catalog.set_characteristics(service, characteristics)?;

        for characteristic in characteristics {
            if let Some(role) = CharacteristicRole::lookup(service, *characteristic) {
                debug!("Bound {:?} to {}", role, characteristic);
                self.bindings.insert(role, *characteristic);
            }
        }

        if self.state != ConnectionState::DiscoveringCharacteristics {
            return Ok(());
        }
        if self.all_roles_bound() {
            self.enable_responses()?;
            return self.start_wake();
        }
        if self.catalog.all_discovered() {
            warn!(
                "{} lacks required characteristics; it cannot be woken",
                self.peripheral
            );
            return Err(ProtocolError::ProtocolNotReady { state: self.state });
        }
        Ok(())
    }

    pub fn on_write_complete(
        &mut self,
        characteristic: Uuid,
        error: Option<String>,
    ) -> Result<(), ProtocolError> {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Disconnecting
        ) {
            return Err(ProtocolError::DiscoveryStale);
        }

        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.characteristic == characteristic)
        else {
            trace!("Unmatched write completion for {}", characteristic);
            return Ok(());
        };
        let write = self.pending.remove(index).ok_or(ProtocolError::DiscoveryStale)?;

        let failure = |reason: String| ProtocolError::WriteFailed {
            characteristic,
            reason,
        };

        match write.kind {
            WriteKind::WakeStep(step) => {
                if self.state != ConnectionState::Waking || step != self.wake_step {
                    debug!("Ignoring acknowledgement for abandoned wake step {}", step);
                    return Ok(());
                }
                if let Some(reason) = error {
                    warn!("Wake step {} failed: {}", step, reason);
                    self.wake_halted = true;
                    return Err(failure(reason));
                }
                self.wake_step += 1;
                if self.wake_step == WAKE_SEQUENCE.len() {
                    info!("{} is awake", self.peripheral);
                    self.state = ConnectionState::Active;
                    Ok(())
                } else {
                    self.issue_wake_step()
                }
            }
            WriteKind::Sleep => match error {
                Some(reason) => {
                    if self.state == ConnectionState::Connected {
                        self.state = ConnectionState::Active;
                    }
                    Err(failure(reason))
                }
                None => {
                    info!("{} is asleep", self.peripheral);
                    Ok(())
                }
            },
            WriteKind::Command(sequence) => match error {
                Some(reason) => {
                    warn!("Command #{} failed: {}", sequence, reason);
                    Err(failure(reason))
                }
                None => Ok(()),
            },
        }
    }

    /// Bytes from the response channel; anything else is dropped.
    pub fn on_notification(&self, characteristic: Uuid, value: Vec<u8>) -> Option<Vec<u8>> {
        if self.bindings.get(&CharacteristicRole::Response) == Some(&characteristic) {
            trace!("Response: {:02X?}", value);
            Some(value)
        } else {
            None
        }
    }

    /// Encodes and writes `command`. Returns the sequence number used.
    pub fn send(&mut self, command: &SpheroCommand) -> Result<u8, ProtocolError> {
        if self.state != ConnectionState::Active {
            return Err(ProtocolError::ProtocolNotReady { state: self.state });
        }

        let sequence = self.sequence;
        let mode = self.delivery.mode_for(command.kind());
        let packet = CommandPacket::build(command, sequence, mode.into())?;
        trace!("Sending {:?} as {:02X?}", command, packet.as_bytes());
        self.write_role(
            CharacteristicRole::Commands,
            packet.as_bytes(),
            mode,
            WriteKind::Command(sequence),
        )?;
        self.sequence = sequence.wrapping_add(1);
        Ok(sequence)
    }

    /// Puts an active robot into deep sleep while keeping the link.
    pub fn sleep(&mut self) -> Result<(), ProtocolError> {
        if self.state != ConnectionState::Active {
            return Err(ProtocolError::ProtocolNotReady { state: self.state });
        }
        self.write_role(
            CharacteristicRole::DeepSleep,
            POWER_TOKEN,
            WriteMode::WithResponse,
            WriteKind::Sleep,
        )?;
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Wakes a dormant robot, or resumes a halted wake sequence at the step
    /// that failed.
    pub fn wake(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Connected if self.all_roles_bound() => self.start_wake(),
            ConnectionState::Waking if self.wake_halted => {
                info!("Resuming wake sequence at step {}", self.wake_step);
                self.wake_halted = false;
                self.issue_wake_step()
            }
            state => Err(ProtocolError::ProtocolNotReady { state }),
        }
    }

    /// Abandons in-flight writes and the catalog ahead of a teardown.
    pub fn begin_disconnect(&mut self) {
        debug!("Tearing down {} from {}", self.peripheral, self.state);
        self.reset();
        self.state = ConnectionState::Disconnecting;
    }

    pub fn finish_disconnect(&mut self) {
        if self.state == ConnectionState::Disconnecting {
            self.state = ConnectionState::Idle;
        }
    }

    pub fn on_disconnected(&mut self, error: Option<String>) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Idle => Ok(()),
            // requested by begin_disconnect; the grace period finishes it
            ConnectionState::Disconnecting => Ok(()),
            ConnectionState::Active => {
                warn!(
                    "Lost connection to {}: {}",
                    self.peripheral,
                    error.as_deref().unwrap_or("no reason given")
                );
                self.reset();
                self.state = ConnectionState::Idle;
                Err(ProtocolError::ConnectionLost(self.peripheral))
            }
            state => {
                warn!("{} disconnected while {}", self.peripheral, state);
                self.reset();
                self.state = ConnectionState::Idle;
                Ok(())
            }
        }
    }

    fn all_roles_bound(&self) -> bool {
        ROLE_TABLE
            .iter()
            .all(|binding| self.bindings.contains_key(&binding.role))
    }

    fn enable_responses(&self) -> Result<(), ProtocolError> {
        let characteristic = self.characteristic(CharacteristicRole::Response)?;
        self.transport
            .set_notify(self.peripheral, characteristic, true)?;
        Ok(())
    }

    fn start_wake(&mut self) -> Result<(), ProtocolError> {
        info!("Waking {}", self.peripheral);
        self.state = ConnectionState::Waking;
        self.wake_step = 0;
        self.wake_halted = false;
        self.issue_wake_step()
    }

    fn issue_wake_step(&mut self) -> Result<(), ProtocolError> {
        let (role, value) = WAKE_SEQUENCE[self.wake_step];
        let result = self.write_role(
            role,
            value,
            WriteMode::WithResponse,
            WriteKind::WakeStep(self.wake_step),
        );
        if result.is_err() {
            self.wake_halted = true;
        }
        result
    }

    fn characteristic(&self, role: CharacteristicRole) -> Result<Uuid, ProtocolError> {
        self.bindings
            .get(&role)
            .copied()
            .filter(|uuid| self.catalog.contains_characteristic(*uuid))
            .ok_or(ProtocolError::ProtocolNotReady { state: self.state })
    }

    fn write_role(
        &mut self,
        role: CharacteristicRole,
        value: &[u8],
        mode: WriteMode,
        kind: WriteKind,
    ) -> Result<(), ProtocolError> {
        let characteristic = self.characteristic(role)?;
        self.transport
            .write_value(self.peripheral, characteristic, value, mode)?;
        if mode == WriteMode::WithResponse {
            self.pending.push_back(PendingWrite {
                characteristic,
                kind,
            });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.catalog.clear();
        self.bindings.clear();
        self.wake_step = 0;
        self.wake_halted = false;
    }
}
