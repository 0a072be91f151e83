use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sphero_controller::domain::input::{ControlDisc, InputMapper, Point};
use sphero_controller::domain::models::{AppEvent, BluetoothCommand, ConnectionState, Rgb};
use sphero_controller::domain::settings::SettingsService;
use sphero_controller::infrastructure::bluetooth::service::ServiceConfig;
use sphero_controller::infrastructure::bluetooth::simulator::{SimulatedSphero, SimulatedTransport};
use sphero_controller::infrastructure::bluetooth::SpheroService;
use sphero_controller::infrastructure::logging;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DISC_CENTER: Point = Point::new(100.0, 100.0);
const DISC_RADIUS: f64 = 50.0;

/// Traces one lap around the control disc, then lifts the finger.
async fn drive_lap(commands: &mpsc::UnboundedSender<BluetoothCommand>) -> Result<()> {
    let mut mapper = InputMapper::new(ControlDisc::new(DISC_CENTER, DISC_RADIUS)?);
    commands.send(BluetoothCommand::SetColor(Rgb::new(0, 128, 255)))?;

    for step in 0..36 {
        let angle = f64::from(step * 10).to_radians();
        let touch = Point::new(
            DISC_CENTER.x + 0.8 * DISC_RADIUS * angle.cos(),
            DISC_CENTER.y + 0.8 * DISC_RADIUS * angle.sin(),
        );
        let sample = mapper.touch(touch);
        commands.send(BluetoothCommand::Drive(sample.vector))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    commands.send(BluetoothCommand::Drive(mapper.release().vector))?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting Sphero Controller (settings: {})", settings.path().display());

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let transport = Arc::new(SimulatedTransport::new(transport_tx));
    transport.add_device(SimulatedSphero::new("Sphero-RPB").with_rssi(-47));

    let service = SpheroService::new(transport, ServiceConfig::from(settings.get()), event_tx);
    let worker = tokio::spawn(service.run(command_rx, transport_rx));

    command_tx.send(BluetoothCommand::StartScan)?;
    let mut target = None;
    let mut driven = false;

    while let Some(event) = events.recv().await {
        match event {
            AppEvent::DeviceFound(handle) if target.is_none() => {
                info!("Found {}", handle.display_name());
                target = Some(handle.id);
                command_tx.send(BluetoothCommand::Connect(handle.id))?;
            }
            AppEvent::ScanFinished if target.is_none() => {
                warn!("No Sphero found");
                break;
            }
            AppEvent::ConnectionState { peripheral, state } => match state {
                ConnectionState::Active if !driven => {
                    driven = true;
                    if let Err(e) = settings.remember_peripheral(peripheral) {
                        warn!("Failed to save settings: {}", e);
                    }
                    drive_lap(&command_tx).await?;
                    command_tx.send(BluetoothCommand::Sleep)?;
                    command_tx.send(BluetoothCommand::Disconnect)?;
                }
                ConnectionState::Idle => break,
                _ => {}
            },
            AppEvent::CommandSent { sequence } => debug!("Command #{} sent", sequence),
            AppEvent::Response { bytes, .. } => debug!("Response: {:02X?}", bytes),
            AppEvent::Failure(e) => error!("{}", e),
            AppEvent::LogMessage(status) => info!("{}", status.message),
            _ => {}
        }
    }

    // the worker may already have stopped
    let _ = command_tx.send(BluetoothCommand::Shutdown);
    worker.await?;
    info!("Bye");
    Ok(())
}
