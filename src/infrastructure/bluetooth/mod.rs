//! Bluetooth Module
//!
//! Drives a Sphero robotic ball over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SpheroService                        │
//! │   (event loop - one logical thread for every transition) │
//! └──────────────┬──────────────────────────┬───────────────┘
//!                │                          │
//!                ▼                          ▼
//! ┌──────────────────────────┐   ┌─────────────────────────┐
//! │    ConnectionManager     │   │     DeviceProtocol      │
//! │                          │   │                         │
//! │ - Scanner (timer)        │   │ - Service catalog       │
//! │ - Peripheral registry    │   │ - Wake / sleep          │
//! │ - Disconnect grace       │   │ - Command writes        │
//! └────────────┬─────────────┘   └────────────┬────────────┘
//!              │                              │ codec, protocol
//!              ▼                              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              BleTransport  /  TransportEvent             │
//! │        (host BLE stack, or the in-process simulator)     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Abstract host stack: requests and asynchronous events
//! - [`codec`] - Command packet framing and checksum
//! - [`protocol`] - Role → UUID table and wake/sleep tokens
//! - [`device`] - Per-peripheral discovery / wake / command state machine
//! - [`scanner`] - Scan sessions with auto-stop timer
//! - [`connection`] - Peripheral registry, connect and disconnect
//! - [`service`] - Main coordinator
//! - [`simulator`] - In-process Sphero used by tests and the demo binary

pub mod codec;
pub mod connection;
pub mod device;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulator;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export main service for convenience
pub use service::SpheroService;

/// Locks shared BLE state, recovering the guard from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
