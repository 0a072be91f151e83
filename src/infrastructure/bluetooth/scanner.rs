//! BLE Scanner Module
//!
//! Scan sessions with an auto-stop timer. Discoveries are fanned out to every
//! subscriber of the running session through a broadcast channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lock;
use super::transport::{BleTransport, ScanFilter};
use crate::domain::models::{PeripheralHandle, PeripheralId};
use crate::error::TransportError;

const DISCOVERY_CAPACITY: usize = 64;

struct ScanSession {
    /// Token of the timer allowed to end this session
    timer_token: u64,
    sender: broadcast::Sender<PeripheralHandle>,
    seen: HashSet<PeripheralId>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ScanState {
    session: Option<ScanSession>,
    timers: u64,
}

/// Peripherals reported by one scan session, in discovery order.
pub struct Discoveries {
    receiver: broadcast::Receiver<PeripheralHandle>,
}

impl Discoveries {
    /// Next named peripheral, or `None` once the session has ended.
    pub async fn next(&mut self) -> Option<PeripheralHandle> {
        loop {
            match self.receiver.recv().await {
                Ok(handle) => return Some(handle),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Discovery stream lagged, skipped {} peripherals", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// BLE Scanner for discovering Sphero robots
#[derive(Clone)]
pub struct BleScanner {
    transport: Arc<dyn BleTransport>,
    filter: ScanFilter,
    state: Arc<Mutex<ScanState>>,
}

impl BleScanner {
    pub fn new(transport: Arc<dyn BleTransport>, filter: ScanFilter) -> Self {
        Self {
            transport,
            filter,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    /// Start scanning, stopping automatically after `timeout`.
    ///
    /// If a session is already running the transport scan is left alone; the
    /// auto-stop timer is replaced and a new subscriber to the same session
    /// is returned.
    ///
    /// Needs a Tokio runtime for the timer; without one the scan is not
    /// started and `TransportError::Unavailable` is returned.
    pub fn start(&self, timeout: Duration) -> Result<Discoveries, TransportError> {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Unavailable(format!("no Tokio runtime: {}", e)))?;
        let mut state = lock(&self.state);

        let mut session = match state.session.take() {
            Some(mut session) => {
                debug!("Scan already running, restarting its {:?} timer", timeout);
                if let Some(timer) = session.timer.take() {
                    timer.abort();
                }
                session
            }
            None => {
                info!("Starting BLE scan for {:?}", timeout);
                self.transport.start_scan(&self.filter, false)?;
                let (sender, _) = broadcast::channel(DISCOVERY_CAPACITY);
                ScanSession {
                    timer_token: 0,
                    sender,
                    seen: HashSet::new(),
                    timer: None,
                }
            }
        };

        // a replaced timer that already woke must not end this session
        state.timers += 1;
        session.timer_token = state.timers;

        let receiver = session.sender.subscribe();
        let scanner = self.clone();
        let token = session.timer_token;
        session.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            scanner.finish(token);
        }));
        state.session = Some(session);

        Ok(Discoveries { receiver })
    }

    /// Stop scanning. Safe to call at any time, any number of times.
    pub fn stop(&self) {
        let session = lock(&self.state).session.take();
        if let Some(mut session) = session {
            if let Some(timer) = session.timer.take() {
                timer.abort();
            }
            info!("Stopping BLE scan...");
            if let Err(e) = self.transport.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        }
    }

    /// Publishes `handle` to the running session. Returns false when nothing
    /// is scanning, the peripheral has no name, or it was already reported.
    pub fn on_discovered(&self, handle: &PeripheralHandle) -> bool {
        let mut state = lock(&self.state);
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        if handle.name.is_none() || !session.seen.insert(handle.id) {
            return false;
        }
        // no subscribers left is fine; the session still ends on its timer
        let _ = session.sender.send(handle.clone());
        true
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        lock(&self.state).session.is_some()
    }

    fn finish(&self, token: u64) {
        let mut state = lock(&self.state);
        if state.session.as_ref().map(|s| s.timer_token) != Some(token) {
            return;
        }
        state.session = None;
        drop(state);

        info!("Scan timed out");
        if let Err(e) = self.transport.stop_scan() {
            warn!("Failed to stop scan: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulator::{SimCall, SimulatedTransport};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn scanner() -> (BleScanner, Arc<SimulatedTransport>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sim = Arc::new(SimulatedTransport::new(tx));
        (BleScanner::new(sim.clone(), ScanFilter::default()), sim)
    }

    fn named(name: &str) -> PeripheralHandle {
        PeripheralHandle::new(PeripheralId::new_random(), Some(name.to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_scan_is_harmless() {
        let (scanner, sim) = scanner();
        scanner.stop();
        scanner.stop();
        assert!(!scanner.is_scanning());
        assert!(sim.calls().is_empty());

        let _discoveries = scanner.start(Duration::from_secs(5)).unwrap();
        scanner.stop();
        scanner.stop();
        let stops = sim
            .calls()
            .iter()
            .filter(|c| **c == SimCall::StopScan)
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_times_out_with_empty_stream() {
        let (scanner, sim) = scanner();
        let started = Instant::now();

        let mut discoveries = scanner.start(Duration::from_secs(10)).unwrap();
        assert!(scanner.is_scanning());
        assert!(sim.is_scanning());

        assert_eq!(discoveries.next().await, None);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!scanner.is_scanning());
        assert!(!sim.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_and_unnamed_are_suppressed() {
        let (scanner, _sim) = scanner();
        let handle = named("Sphero-BRR");
        let unnamed = PeripheralHandle::new(PeripheralId::new_random(), None);

        assert!(!scanner.on_discovered(&handle));

        let mut discoveries = scanner.start(Duration::from_secs(1)).unwrap();
        assert!(scanner.on_discovered(&handle));
        assert!(!scanner.on_discovered(&handle));
        assert!(!scanner.on_discovered(&unnamed));

        assert_eq!(discoveries.next().await, Some(handle));
        assert_eq!(discoveries.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_replaces_timer_and_shares_session() {
        let (scanner, sim) = scanner();
        let started = Instant::now();

        let mut first = scanner.start(Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut second = scanner.start(Duration::from_secs(2)).unwrap();
        assert_eq!(sim.scan_starts(), 1);

        let handle = named("Sphero-GOB");
        assert!(scanner.on_discovered(&handle));
        assert_eq!(first.next().await, Some(handle.clone()));
        assert_eq!(second.next().await, Some(handle));

        assert_eq!(first.next().await, None);
        assert!(started.elapsed() >= Duration::from_millis(2500));
        assert_eq!(second.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_timer_cannot_end_restarted_scan() {
        let (scanner, sim) = scanner();
        let _first = scanner.start(Duration::from_secs(1)).unwrap();
        let replaced = lock(&scanner.state)
            .session
            .as_ref()
            .map(|s| s.timer_token)
            .unwrap();

        let _second = scanner.start(Duration::from_secs(5)).unwrap();
        // the old timer fires after losing the race with the restart
        scanner.finish(replaced);
        assert!(scanner.is_scanning());
        assert!(sim.is_scanning());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn test_start_outside_runtime_fails_cleanly() {
        let (scanner, sim) = scanner();
        assert!(matches!(
            scanner.start(Duration::from_secs(1)),
            Err(TransportError::Unavailable(_))
        ));
        assert!(!scanner.is_scanning());
        assert!(sim.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_outstanding_streams() {
        let (scanner, _sim) = scanner();
        let mut discoveries = scanner.start(Duration::from_secs(30)).unwrap();
        let started = Instant::now();

        scanner.stop();
        assert_eq!(discoveries.next().await, None);
        assert!(started.elapsed() < Duration::from_secs(1));

        // a new session starts cleanly afterwards
        let handle = named("Sphero-YOW");
        let mut again = scanner.start(Duration::from_secs(1)).unwrap();
        assert!(scanner.on_discovered(&handle));
        assert_eq!(again.next().await, Some(handle));
    }
}
