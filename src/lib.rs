//! Sphero controller
//!
//! Discovers, connects to, wakes and drives a Sphero robotic ball over
//! Bluetooth Low Energy. Touches on a circular control disc are mapped to
//! heading/speed roll commands.

pub mod domain;
pub mod error;
pub mod infrastructure;
