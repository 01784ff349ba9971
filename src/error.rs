//! Unified error types for the beacon locator.
//!
//! Discovery failures are surfaced once to the caller as a [`LocatorError`];
//! radio backends report request failures as [`RadioError`].

use crate::domain::models::BeaconRole;
use thiserror::Error;

/// Why the local Bluetooth adapter cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdapterFault {
    /// No Bluetooth adapter is present at all.
    #[error("no Bluetooth adapter available")]
    NoService,
    /// An adapter exists but offers no Bluetooth LE support.
    #[error("Bluetooth LE is not supported by the adapter")]
    NoBleService,
}

/// Failure reported synchronously by a radio request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio unavailable: {0}")]
    Unavailable(AdapterFault),
    #[error("unknown connection handle {0}")]
    UnknownHandle(u64),
    #[error("radio backend error: {0}")]
    Backend(String),
}

/// Top-level error type for discovery and session operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocatorError {
    /// A scan did not see the requested advertiser(s) in time.
    #[error("device not found")]
    DeviceNotFound,

    /// Surfaced before discovery starts.
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(AdapterFault),

    /// A connected radio disconnected unexpectedly.
    #[error("{0} link lost")]
    LinkLost(BeaconRole),

    /// Non-finite evaluation result or a malformed handshake reply.
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    /// A bounded wait (connect, handshake reply) expired.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Radio(#[from] RadioError),

    /// The session was already torn down.
    #[error("session closed")]
    SessionClosed,
}

impl LocatorError {
    /// Stable error code handed to the shell.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound => "device_not_found",
            Self::AdapterUnavailable(AdapterFault::NoService) => "no_service",
            Self::AdapterUnavailable(AdapterFault::NoBleService) => "no_ble_service",
            Self::LinkLost(_) => "link_lost",
            Self::ProtocolFault(_) => "protocol_fault",
            Self::Timeout(_) => "timeout",
            Self::Radio(_) => "radio_error",
            Self::SessionClosed => "session_closed",
        }
    }
}

impl From<AdapterFault> for LocatorError {
    fn from(fault: AdapterFault) -> Self {
        LocatorError::AdapterUnavailable(fault)
    }
}
