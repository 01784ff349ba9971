//! Beacon Locator
//!
//! Locates a mobile BLE unit relative to two fixed beacons. The unit (the
//! *primary*) tells us the beacons' names over a text handshake; we then keep
//! one connection per radio, sample RSSI on each, and turn the filtered
//! signal strengths into a planar position.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{BeaconRole, CloseReason, LocatorEvent, PositionUpdate};
pub use domain::settings::{Settings, SettingsService};
pub use error::{AdapterFault, LocatorError, RadioError};
pub use infrastructure::bluetooth::radio::Radio;
pub use infrastructure::bluetooth::session::SessionHandle;
pub use infrastructure::bluetooth::BeaconLocator;
