//! Radio Interface
//!
//! The narrow surface the locator consumes from a BLE stack. Every request
//! returns immediately; its completion arrives later as a [`RadioEvent`] on
//! the [`EventSink`] handed to [`Radio::connect`].

use crate::domain::models::BeaconRole;
use crate::error::{AdapterFault, RadioError};
use crate::infrastructure::bluetooth::protocol::GattTarget;
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;

/// Opaque identifier of an advertiser (address or platform device id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub device_id: DeviceId,
    pub name: Option<String>,
    /// Advertised TX power, used as calibration power when configured.
    pub tx_power: Option<i16>,
    pub rssi: i16,
}

/// Token for one radio connection, issued by [`Radio::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceInfo {
    pub uuid: String,
    pub characteristics: Vec<String>,
}

/// Completions and unsolicited events for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Connected,
    Disconnected,
    ServicesDiscovered(Vec<GattServiceInfo>),
    /// A descriptor write finished; carries the descriptor UUID.
    DescriptorWritten(String),
    CharacteristicChanged(Vec<u8>),
    WriteComplete,
    RssiRead(i16),
    /// A request failed in the radio stack; the connection is unusable.
    Failed(String),
}

/// A [`RadioEvent`] tagged with the role of the link it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub role: BeaconRole,
    pub event: RadioEvent,
}

/// Where a connection delivers its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    role: BeaconRole,
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl EventSink {
    pub fn new(role: BeaconRole, sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { role, sender }
    }

    pub fn role(&self) -> BeaconRole {
        self.role
    }

    /// Deliver `event`. Events for an owner that has gone away are dropped.
    pub fn emit(&self, event: RadioEvent) {
        if self
            .sender
            .send(LinkEvent {
                role: self.role,
                event,
            })
            .is_err()
        {
            trace!("Dropping event for closed {} link", self.role);
        }
    }
}

/// Name filter applied to advertisements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub names: Vec<String>,
}

impl ScanFilter {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, adv: &Advertisement) -> bool {
        adv.name
            .as_deref()
            .is_some_and(|name| self.names.iter().any(|n| n == name))
    }
}

/// A running scan. Dropping it stops the scan.
pub struct ScanSubscription {
    receiver: mpsc::UnboundedReceiver<Advertisement>,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl ScanSubscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Advertisement>,
        stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            stop: Some(Box::new(stop)),
        }
    }

    /// Next advertisement, or `None` once the backend ended the scan.
    pub async fn next(&mut self) -> Option<Advertisement> {
        self.receiver.recv().await
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for ScanSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// BLE central operations the locator needs.
pub trait Radio: Send + Sync {
    /// Fails when no adapter or no LE support is present.
    fn check_adapter(&self) -> Result<(), AdapterFault>;

    fn scan(&self, filter: ScanFilter) -> Result<ScanSubscription, RadioError>;

    /// Start connecting. Produces [`RadioEvent::Connected`] on success.
    fn connect(&self, device: &DeviceId, sink: EventSink) -> Result<ConnectionHandle, RadioError>;

    /// Produces [`RadioEvent::ServicesDiscovered`].
    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), RadioError>;

    /// Subscribe to notifications; produces [`RadioEvent::DescriptorWritten`].
    fn enable_notification(
        &self,
        handle: ConnectionHandle,
        target: &GattTarget,
    ) -> Result<(), RadioError>;

    /// Write to the target characteristic; produces [`RadioEvent::WriteComplete`].
    fn write(&self, handle: ConnectionHandle, bytes: &[u8]) -> Result<(), RadioError>;

    /// Produces [`RadioEvent::RssiRead`].
    fn read_rssi(&self, handle: ConnectionHandle) -> Result<(), RadioError>;

    /// Release the connection. No further events are expected afterwards.
    fn close(&self, handle: ConnectionHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn adv(name: Option<&str>) -> Advertisement {
        Advertisement {
            device_id: DeviceId("AA".into()),
            name: name.map(str::to_string),
            tx_power: None,
            rssi: -70,
        }
    }

    #[test]
    fn test_filter_matches_any_name() {
        let filter = ScanFilter::names(["beaconA", "beaconB"]);
        assert!(filter.matches(&adv(Some("beaconB"))));
        assert!(!filter.matches(&adv(Some("beaconC"))));
        assert!(!filter.matches(&adv(None)));
    }

    #[test]
    fn test_subscription_stops_once_on_drop() {
        let stopped = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = mpsc::unbounded_channel();
        let flag = stopped.clone();
        let mut sub = ScanSubscription::new(rx, move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        sub.stop();
        drop(sub);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sink_tolerates_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(BeaconRole::Left, tx);
        drop(rx);
        sink.emit(RadioEvent::WriteComplete);
        assert_eq!(sink.role(), BeaconRole::Left);
    }
}
