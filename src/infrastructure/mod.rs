//! Platform-facing services: BLE links and logging.

pub mod bluetooth;
pub mod logging;
