//! Bluetooth Module
//!
//! Beacon discovery, link management and the tracking session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     BeaconLocator                        │
//! │   (entry point - begin_discovery → SessionHandle)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌────────────────┐          ┌────────────────┐
//! │   Discovery    │ ───────► │    Session     │
//! │ - scans        │  links   │ - engine       │
//! │ - handshake    │          │ - RSSI polling │
//! └───────┬────────┘          └───────┬────────┘
//!         │                           │
//!         └─────────────┬─────────────┘
//!                       ▼
//!                ┌────────────┐      ┌──────────┐
//!                │    Link    │ ───► │  Radio   │
//!                │ (per role) │      │  (trait) │
//!                └────────────┘      └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers, handshake requests, command encoding
//! - [`radio`] - The BLE stack interface consumed by the locator
//! - [`link`] - Per-radio connection state machine
//! - [`discovery`] - Scanning, handshake and connection of all three radios
//! - [`session`] - Session supervisor and teardown
//! - [`service`] - Main entry point

pub mod discovery;
pub mod link;
pub mod protocol;
pub mod radio;
pub mod service;
pub mod session;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::BeaconLocator;
