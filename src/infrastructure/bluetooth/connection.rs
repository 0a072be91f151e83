//! BLE Connection Module
//!
//! Peripheral registry, scanning, connection requests and graceful teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::lock;
use super::scanner::{BleScanner, Discoveries};
use super::transport::{Advertisement, BleTransport, ScanFilter};
use crate::domain::models::{ConnectionState, PeripheralHandle, PeripheralId};
use crate::domain::settings::Settings;
use crate::error::{ProtocolError, TransportError};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a scan runs before stopping on its own
    pub scan_timeout: Duration,
    /// Delay between requesting a disconnect and releasing the handle
    pub disconnect_grace: Duration,
    pub scan_filter: ScanFilter,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            scan_timeout: settings.scan_timeout(),
            disconnect_grace: settings.disconnect_grace(),
            scan_filter: ScanFilter {
                services: settings.scan_service_filter.clone(),
            },
        }
    }
}

/// Owns the transport handle and every peripheral seen this session.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    scanner: BleScanner,
    registry: Arc<Mutex<HashMap<PeripheralId, PeripheralHandle>>>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn BleTransport>, config: ConnectionConfig) -> Self {
        Self {
            scanner: BleScanner::new(transport.clone(), config.scan_filter.clone()),
            transport,
            registry: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn BleTransport> {
        self.transport.clone()
    }

    /// Scan with the configured timeout.
    pub fn scan(&self) -> Result<Discoveries, TransportError> {
        self.scan_for(self.config.scan_timeout)
    }

    /// A fresh session forgets idle peripherals from earlier scans; a
    /// restart keeps them.
    pub fn scan_for(&self, timeout: Duration) -> Result<Discoveries, TransportError> {
        let fresh = !self.scanner.is_scanning();
        let discoveries = self.scanner.start(timeout)?;
        if fresh {
            lock(&self.registry).retain(|_, handle| handle.state != ConnectionState::Idle);
        }
        Ok(discoveries)
    }

    pub fn stop_scan(&self) {
        self.scanner.stop();
    }

    /// `Scanning` while a scan session is live, otherwise `Idle`.
    pub fn state(&self) -> ConnectionState {
        if self.scanner.is_scanning() {
            ConnectionState::Scanning
        } else {
            ConnectionState::Idle
        }
    }

    /// Records an advertisement. Returns the handle if it is new to the
    /// running scan and should be shown to the user.
    pub fn on_discovered(&self, advertisement: Advertisement) -> Option<PeripheralHandle> {
        let handle = {
            let mut registry = lock(&self.registry);
            let handle = registry
                .entry(advertisement.peripheral)
                .or_insert_with(|| PeripheralHandle::new(advertisement.peripheral, None));
            if advertisement.name.is_some() {
                handle.name = advertisement.name;
            }
            handle.rssi = advertisement.rssi.or(handle.rssi);
            handle.clone()
        };

        if self.scanner.on_discovered(&handle) {
            debug!(
                "Found {} ({:?} dBm)",
                handle.display_name(),
                handle.rssi
            );
            Some(handle)
        } else {
            None
        }
    }

    /// Requests a connection; a `Connected` event follows on success.
    pub fn connect(&self, peripheral: PeripheralId) -> Result<(), ProtocolError> {
        let previous = {
            let mut registry = lock(&self.registry);
            let handle = registry
                .get_mut(&peripheral)
                .ok_or(ProtocolError::UnknownPeripheral(peripheral))?;
            info!("Connecting to {}", handle.display_name());
            std::mem::replace(&mut handle.state, ConnectionState::Connecting)
        };

        if let Err(e) = self.transport.connect(peripheral) {
            self.set_state(peripheral, previous);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn on_connected(&self, peripheral: PeripheralId) {
        let mut registry = lock(&self.registry);
        registry
            .entry(peripheral)
            .or_insert_with(|| PeripheralHandle::new(peripheral, None))
            .state = ConnectionState::Connected;
    }

    /// Drops the handle of a lost link. Requested teardowns keep theirs
    /// until the grace period ends.
    pub fn on_disconnected(&self, peripheral: PeripheralId) {
        let mut registry = lock(&self.registry);
        if registry
            .get(&peripheral)
            .is_some_and(|handle| handle.state != ConnectionState::Disconnecting)
        {
            registry.remove(&peripheral);
            debug!("Released lost peripheral {}", peripheral);
        }
    }

    /// Mirrors a protocol state change into the registry.
    pub fn set_state(&self, peripheral: PeripheralId, state: ConnectionState) {
        if let Some(handle) = lock(&self.registry).get_mut(&peripheral) {
            handle.state = state;
        }
    }

    /// All peripherals connected to this host, including connections made by
    /// other applications.
    pub fn list_connected_peripherals(&self) -> Result<Vec<PeripheralHandle>, TransportError> {
        let connected = self.transport.retrieve_connected()?;
        let mut registry = lock(&self.registry);
        Ok(connected
            .into_iter()
            .map(|found| {
                let handle = registry.entry(found.id).or_insert_with(|| found.clone());
                if handle.name.is_none() {
                    handle.name = found.name;
                }
                if handle.state == ConnectionState::Idle {
                    handle.state = found.state;
                }
                handle.clone()
            })
            .collect())
    }

    /// Requests teardown, waits `grace`, then releases the handle.
    ///
    /// Unknown handles and teardowns already in progress are no-ops.
    pub async fn disconnect(
        &self,
        peripheral: PeripheralId,
        grace: Duration,
    ) -> Result<(), ProtocolError> {
        let previous = {
            let mut registry = lock(&self.registry);
            match registry.get_mut(&peripheral) {
                None => {
                    debug!("Disconnect for released peripheral {}", peripheral);
                    return Ok(());
                }
                Some(handle) if handle.state == ConnectionState::Disconnecting => {
                    debug!("Disconnect of {} already pending", peripheral);
                    return Ok(());
                }
                Some(handle) => {
                    std::mem::replace(&mut handle.state, ConnectionState::Disconnecting)
                }
            }
        };

        info!("Disconnecting from {}", peripheral);
        if let Err(e) = self.transport.cancel_connection(peripheral) {
            warn!("Failed to cancel connection to {}: {}", peripheral, e);
            self.set_state(peripheral, previous);
            return Err(e.into());
        }

        tokio::time::sleep(grace).await;
        lock(&self.registry).remove(&peripheral);
        info!("Released {}", peripheral);
        Ok(())
    }

    pub fn peripheral(&self, peripheral: PeripheralId) -> Option<PeripheralHandle> {
        lock(&self.registry).get(&peripheral).cloned()
    }
}
