//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection, the device protocol
//! and command traffic for a Sphero. `run` is the single event loop every
//! state transition goes through.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::commands::SpheroCommand;
use crate::domain::models::{
    AppEvent, BluetoothCommand, ConnectionState, ControlVector, MessageSeverity, PeripheralId,
    Rgb, StatusMessage,
};
use crate::domain::settings::{DeliverySettings, Settings};
use crate::error::{ProtocolError, TransportError};
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, ConnectionManager},
    device::DeviceProtocol,
    transport::{BleTransport, TransportEvent},
};

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub connection: ConnectionConfig,
    pub delivery: DeliverySettings,
}

impl From<&Settings> for ServiceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            connection: ConnectionConfig::from(settings),
            delivery: settings.delivery,
        }
    }
}

/// Completions of work spawned off the event loop.
#[derive(Debug)]
enum Signal {
    Released(PeripheralId),
}

/// Main Bluetooth service coordinating all BLE operations
pub struct SpheroService {
    manager: ConnectionManager,
    delivery: DeliverySettings,
    device: Option<DeviceProtocol>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: Option<mpsc::UnboundedReceiver<Signal>>,
    scan_forwarder: Option<JoinHandle<()>>,
}

impl SpheroService {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        config: ServiceConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            manager: ConnectionManager::new(transport, config.connection),
            delivery: config.delivery,
            device: None,
            event_sender,
            signal_tx,
            signal_rx: Some(signal_rx),
            scan_forwarder: None,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// State of the tracked device, or of the scanner when there is none.
    pub fn state(&self) -> ConnectionState {
        self.device
            .as_ref()
            .map(DeviceProtocol::state)
            .unwrap_or_else(|| self.manager.state())
    }

    /// Process host commands and transport events until `Shutdown` or until
    /// the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let Some(mut signals) = self.signal_rx.take() else {
            error!("Sphero service started twice");
            return;
        };
        info!("Sphero service started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = events.recv() => {
                    let result = self.handle_transport_event(event);
                    self.dispatch(result);
                }
                Some(signal) = signals.recv() => self.handle_signal(signal),
            }
        }

        self.shutdown();
    }

    /// Returns false when the loop should stop.
    pub fn handle_command(&mut self, command: BluetoothCommand) -> bool {
        debug!("Command: {:?}", command);
        let result = match command {
            BluetoothCommand::StartScan => self.start_scan(),
            BluetoothCommand::StopScan => {
                self.stop_scan();
                Ok(())
            }
            BluetoothCommand::Connect(peripheral) => self.connect(peripheral),
            BluetoothCommand::Disconnect => self.disconnect(),
            BluetoothCommand::ListConnected => self.list_connected(),
            BluetoothCommand::Drive(vector) => self.drive(vector).map(|_| ()),
            BluetoothCommand::SetColor(color) => self.set_color(color).map(|_| ()),
            BluetoothCommand::Send(command) => self.send(command).map(|_| ()),
            BluetoothCommand::Sleep => self.sleep(),
            BluetoothCommand::Wake => self.wake(),
            BluetoothCommand::Shutdown => return false,
        };
        self.dispatch(result);
        true
    }

    /// Start scanning; discoveries are published as `DeviceFound` and the
    /// end of the session as `ScanFinished`. Fails with
    /// `TransportError::Unavailable` outside a Tokio runtime.
    pub fn start_scan(&mut self) -> Result<(), ProtocolError> {
        let mut discoveries = self.manager.scan()?;
        if let Some(previous) = self.scan_forwarder.take() {
            previous.abort();
        }

        self.send_log("Scanning for Sphero...", MessageSeverity::Info);
        let sender = self.event_sender.clone();
        self.scan_forwarder = Some(tokio::spawn(async move {
            while let Some(handle) = discoveries.next().await {
                let _ = sender.send(AppEvent::DeviceFound(handle));
            }
            let _ = sender.send(AppEvent::ScanFinished);
        }));
        Ok(())
    }

    pub fn stop_scan(&mut self) {
        self.manager.stop_scan();
    }

    /// Connect to a discovered peripheral. Scanning stops first.
    pub fn connect(&mut self, peripheral: PeripheralId) -> Result<(), ProtocolError> {
        if let Some(device) = &self.device {
            return Err(ProtocolError::ProtocolNotReady {
                state: device.state(),
            });
        }

        self.manager.stop_scan();
        self.manager.connect(peripheral)?;
        self.device = Some(DeviceProtocol::new(
            peripheral,
            self.manager.transport(),
            self.delivery,
        ));
        self.emit_state(peripheral, ConnectionState::Connecting);
        self.send_log("Connecting to device...", MessageSeverity::Info);
        Ok(())
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), ProtocolError> {
        let peripheral = event.peripheral();
        match &event {
            TransportEvent::Discovered(advertisement) => {
                self.manager.on_discovered(advertisement.clone());
                return Ok(());
            }
            TransportEvent::Connected(_) => self.manager.on_connected(peripheral),
            TransportEvent::Disconnected { .. } => self.manager.on_disconnected(peripheral),
            _ => {}
        }

        if self.device.as_ref().map(DeviceProtocol::peripheral) != Some(peripheral) {
            return Err(ProtocolError::DiscoveryStale);
        }
        let response = self.with_device(|device| device.handle_event(event))?;
        if let Some(bytes) = response {
            let _ = self
                .event_sender
                .send(AppEvent::Response { peripheral, bytes });
        }
        Ok(())
    }

    /// Encode and write `command`; returns its sequence number.
    pub fn send(&mut self, command: SpheroCommand) -> Result<u8, ProtocolError> {
        let sequence = self.with_device(|device| device.send(&command))?;
        let _ = self.event_sender.send(AppEvent::CommandSent { sequence });
        Ok(sequence)
    }

    pub fn drive(&mut self, vector: ControlVector) -> Result<u8, ProtocolError> {
        self.send(SpheroCommand::from(vector))
    }

    pub fn set_color(&mut self, color: Rgb) -> Result<u8, ProtocolError> {
        self.send(SpheroCommand::color(color))
    }

    pub fn sleep(&mut self) -> Result<(), ProtocolError> {
        self.with_device(DeviceProtocol::sleep)
    }

    pub fn wake(&mut self) -> Result<(), ProtocolError> {
        self.with_device(DeviceProtocol::wake)
    }

    /// Tear down the current connection. The device reaches `Idle` once the
    /// grace period has elapsed. The grace timer runs on the current Tokio
    /// runtime; without one nothing is torn down.
    pub fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Unavailable(format!("no Tokio runtime: {}", e)))?;
        let device = self
            .device
            .as_ref()
            .ok_or(ProtocolError::NoActivePeripheral)?;
        if device.state() == ConnectionState::Disconnecting {
            return Ok(());
        }
        let peripheral = device.peripheral();

        self.with_device(|device| {
            device.begin_disconnect();
            Ok(())
        })?;

        let manager = self.manager.clone();
        let grace = manager.config().disconnect_grace;
        let signals = self.signal_tx.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.disconnect(peripheral, grace).await {
                warn!("Disconnect of {} failed: {}", peripheral, e);
            }
            let _ = signals.send(Signal::Released(peripheral));
        });
        Ok(())
    }

    pub fn list_connected(&mut self) -> Result<(), ProtocolError> {
        let peripherals = self.manager.list_connected_peripherals()?;
        let _ = self
            .event_sender
            .send(AppEvent::ConnectedPeripherals(peripherals));
        Ok(())
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Released(peripheral) => {
                if self.device.as_ref().map(DeviceProtocol::peripheral) != Some(peripheral) {
                    return;
                }
                let _ = self.with_device(|device| {
                    device.finish_disconnect();
                    Ok(())
                });
                info!("Disconnected from device");
                self.send_log("Disconnected from device", MessageSeverity::Info);
            }
        }
    }

    /// Runs `f` against the tracked device, publishing any state change and
    /// dropping the device once it is back to `Idle`.
    fn with_device<T>(
        &mut self,
        f: impl FnOnce(&mut DeviceProtocol) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let device = self
            .device
            .as_mut()
            .ok_or(ProtocolError::NoActivePeripheral)?;
        let peripheral = device.peripheral();
        let before = device.state();
        let result = f(&mut *device);
        let after = device.state();

        if before != after {
            // the manager moves the registry to Disconnecting itself
            if after != ConnectionState::Disconnecting {
                self.manager.set_state(peripheral, after);
            }
            self.emit_state(peripheral, after);
            if after == ConnectionState::Active {
                self.send_log("Sphero is ready", MessageSeverity::Success);
            }
        }
        if after == ConnectionState::Idle {
            self.device = None;
        }
        result
    }

    /// Publishes a failure to the host. Stale callbacks are only logged.
    fn dispatch(&self, result: Result<(), ProtocolError>) {
        match result {
            Ok(()) => {}
            Err(ProtocolError::DiscoveryStale) => debug!("Ignoring stale callback"),
            Err(e) => {
                warn!("{}", e);
                let severity = match e {
                    ProtocolError::ConnectionLost(_) | ProtocolError::WriteFailed { .. } => {
                        MessageSeverity::Error
                    }
                    _ => MessageSeverity::Warning,
                };
                self.send_log(&e.to_string(), severity);
                let _ = self.event_sender.send(AppEvent::Failure(e));
            }
        }
    }

    fn emit_state(&self, peripheral: PeripheralId, state: ConnectionState) {
        info!("{} -> {}", peripheral, state);
        let _ = self
            .event_sender
            .send(AppEvent::ConnectionState { peripheral, state });
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }

    fn shutdown(&mut self) {
        self.manager.stop_scan();
        if let Some(forwarder) = self.scan_forwarder.take() {
            forwarder.abort();
        }
        if let Some(device) = self.device.take() {
            if let Err(e) = self.manager.transport().cancel_connection(device.peripheral()) {
                warn!("Failed to cancel connection on shutdown: {}", e);
            }
        }
        info!("Sphero service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::CharacteristicRole;
    use crate::infrastructure::bluetooth::simulator::{SimCall, SimulatedSphero, SimulatedTransport};
    use crate::infrastructure::bluetooth::transport::WriteMode;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    struct Running {
        sim: Arc<SimulatedTransport>,
        commands: mpsc::UnboundedSender<BluetoothCommand>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        task: JoinHandle<()>,
    }

    impl Running {
        fn start() -> Self {
            let (transport_tx, transport_rx) = mpsc::unbounded_channel();
            let (event_tx, events) = mpsc::unbounded_channel();
            let (commands, command_rx) = mpsc::unbounded_channel();
            let sim = Arc::new(SimulatedTransport::new(transport_tx));
            let service = SpheroService::new(sim.clone(), ServiceConfig::default(), event_tx);
            let task = tokio::spawn(service.run(command_rx, transport_rx));
            Self {
                sim,
                commands,
                events,
                task,
            }
        }

        fn send(&self, command: BluetoothCommand) {
            self.commands.send(command).unwrap();
        }

        /// Next event matching `pred`, skipping everything else.
        async fn wait_for(&mut self, pred: impl Fn(&AppEvent) -> bool) -> AppEvent {
            timeout(Duration::from_secs(60), async {
                loop {
                    let event = self.events.recv().await.expect("service stopped");
                    if pred(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("event never arrived")
        }

        async fn wait_for_state(&mut self, wanted: ConnectionState) {
            self.wait_for(|e| matches!(e, AppEvent::ConnectionState { state, .. } if *state == wanted))
                .await;
        }

        async fn connect(&mut self, name: &str) -> PeripheralId {
            let id = self.sim.add_device(SimulatedSphero::new(name));
            self.send(BluetoothCommand::StartScan);
            let found = self
                .wait_for(|e| matches!(e, AppEvent::DeviceFound(_)))
                .await;
            let AppEvent::DeviceFound(handle) = found else {
                unreachable!()
            };
            assert_eq!(handle.id, id);
            self.send(BluetoothCommand::Connect(id));
            id
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_connect_drive_disconnect() {
        let mut app = Running::start();
        let id = app.connect("Sphero-RWG").await;
        app.wait_for_state(ConnectionState::Active).await;

        app.send(BluetoothCommand::Drive(ControlVector {
            heading: 90.0,
            speed: 0.5,
            stop: false,
        }));
        app.send(BluetoothCommand::SetColor(Rgb::new(255, 0, 0)));
        let sent = app
            .wait_for(|e| matches!(e, AppEvent::CommandSent { sequence: 1 }))
            .await;
        assert!(matches!(sent, AppEvent::CommandSent { sequence: 1 }));

        let writes = app.sim.writes_to(CharacteristicRole::Commands.uuid());
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.mode == WriteMode::WithoutResponse));
        assert_eq!(&writes[0].value[6..10], &[128, 0, 90, 1]);

        let started = Instant::now();
        app.send(BluetoothCommand::Disconnect);
        app.wait_for_state(ConnectionState::Disconnecting).await;
        app.wait_for_state(ConnectionState::Idle).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(!app
            .sim
            .retrieve_connected()
            .unwrap()
            .iter()
            .any(|p| p.id == id));
        let cancels = app
            .sim
            .calls()
            .iter()
            .filter(|c| **c == SimCall::CancelConnection(id))
            .count();
        assert_eq!(cancels, 1);

        app.send(BluetoothCommand::Shutdown);
        app.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_wake_never_activates() {
        let mut app = Running::start();
        let wake = CharacteristicRole::Wake.uuid();
        app.sim.fail_writes_to(wake, "write not permitted");
        app.connect("Sphero-BYO").await;

        app.wait_for_state(ConnectionState::Waking).await;
        let failure = app
            .wait_for(|e| matches!(e, AppEvent::Failure(_)))
            .await;
        assert!(matches!(
            failure,
            AppEvent::Failure(ProtocolError::WriteFailed { characteristic, .. }) if characteristic == wake
        ));

        app.send(BluetoothCommand::Send(SpheroCommand::Ping));
        let failure = app
            .wait_for(|e| matches!(e, AppEvent::Failure(_)))
            .await;
        assert!(matches!(
            failure,
            AppEvent::Failure(ProtocolError::ProtocolNotReady {
                state: ConnectionState::Waking
            })
        ));

        // a manual retry finishes the sequence
        app.sim.clear_failures();
        app.send(BluetoothCommand::Wake);
        app.wait_for_state(ConnectionState::Active).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_devices_finishes() {
        let mut app = Running::start();
        let started = Instant::now();

        app.send(BluetoothCommand::StartScan);
        let event = app
            .wait_for(|e| matches!(e, AppEvent::DeviceFound(_) | AppEvent::ScanFinished))
            .await;
        assert!(matches!(event, AppEvent::ScanFinished));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!app.sim.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_is_reported() {
        let mut app = Running::start();
        let id = app.connect("Sphero-GRP").await;
        app.wait_for_state(ConnectionState::Active).await;

        app.sim.drop_connection(id);
        app.wait_for_state(ConnectionState::Idle).await;
        let status = app
            .wait_for(|e| matches!(e, AppEvent::LogMessage(_)))
            .await;
        assert!(matches!(
            status,
            AppEvent::LogMessage(StatusMessage {
                severity: MessageSeverity::Error,
                ..
            })
        ));
        let failure = app
            .wait_for(|e| matches!(e, AppEvent::Failure(_)))
            .await;
        assert!(matches!(
            failure,
            AppEvent::Failure(ProtocolError::ConnectionLost(lost)) if lost == id
        ));

        app.send(BluetoothCommand::Drive(ControlVector::stop()));
        let status = app
            .wait_for(|e| matches!(e, AppEvent::LogMessage(_)))
            .await;
        assert!(matches!(
            status,
            AppEvent::LogMessage(StatusMessage {
                severity: MessageSeverity::Warning,
                ..
            })
        ));
        let failure = app
            .wait_for(|e| matches!(e, AppEvent::Failure(_)))
            .await;
        assert!(matches!(
            failure,
            AppEvent::Failure(ProtocolError::NoActivePeripheral)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_and_wake_round_trip() {
        let mut app = Running::start();
        app.connect("Sphero-OYR").await;
        app.wait_for_state(ConnectionState::Active).await;

        app.send(BluetoothCommand::Sleep);
        app.wait_for_state(ConnectionState::Connected).await;
        app.send(BluetoothCommand::Wake);
        app.wait_for_state(ConnectionState::Waking).await;
        app.wait_for_state(ConnectionState::Active).await;
        assert_eq!(
            app.sim
                .writes_to(CharacteristicRole::DeepSleep.uuid())
                .len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_connected_publishes_peripherals() {
        let mut app = Running::start();
        let foreign = app.sim.add_device(SimulatedSphero::new("Sphero-WOW"));
        app.sim.connect_externally(foreign);

        app.send(BluetoothCommand::ListConnected);
        let event = app
            .wait_for(|e| matches!(e, AppEvent::ConnectedPeripherals(_)))
            .await;
        let AppEvent::ConnectedPeripherals(peripherals) = event else {
            unreachable!()
        };
        assert_eq!(peripherals.len(), 1);
        assert_eq!(peripherals[0].id, foreign);
    }

    #[test]
    fn test_timers_outside_runtime_are_refused() {
        let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
        let (event_tx, _events) = mpsc::unbounded_channel();
        let sim = Arc::new(SimulatedTransport::new(transport_tx));
        let id = sim.add_device(SimulatedSphero::new("Sphero-YYO"));
        sim.connect_externally(id);
        let mut service = SpheroService::new(sim.clone(), ServiceConfig::default(), event_tx);

        assert!(matches!(
            service.start_scan(),
            Err(ProtocolError::Transport(TransportError::Unavailable(_)))
        ));
        assert!(!sim.is_scanning());

        service.list_connected().unwrap();
        service.connect(id).unwrap();
        assert!(matches!(
            service.disconnect(),
            Err(ProtocolError::Transport(TransportError::Unavailable(_)))
        ));
        assert_eq!(service.state(), ConnectionState::Connecting);
        assert!(!sim.calls().contains(&SimCall::CancelConnection(id)));
    }

    #[tokio::test]
    async fn test_run_stops_when_commands_close() {
        let app = Running::start();
        drop(app.commands);
        timeout(Duration::from_secs(5), app.task)
            .await
            .unwrap()
            .unwrap();
    }
}
