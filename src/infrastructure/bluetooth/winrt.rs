//! WinRT Radio Backend
//!
//! [`Radio`] on top of `Windows.Devices.Bluetooth`. Requests are spawned on
//! the tokio runtime and report back through the connection's [`EventSink`].
//!
//! WinRT exposes no RSSI read for a connected device, so a background
//! advertisement watcher records the latest signal strength per address and
//! [`Radio::read_rssi`] reports from that table. Entries older than the
//! configured maximum age are not reported.

use crate::error::{AdapterFault, RadioError};
use crate::infrastructure::bluetooth::protocol::GattTarget;
use crate::infrastructure::bluetooth::radio::{
    Advertisement, ConnectionHandle, DeviceId, EventSink, GattServiceInfo, Radio, RadioEvent,
    ScanFilter, ScanSubscription,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattSession, GattValueChangedEventArgs,
    GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

const RSSI_RETRY_DELAY: Duration = Duration::from_millis(20);

struct Connection {
    address: u64,
    sink: EventSink,
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    services: Vec<GattDeviceService>,
    characteristic: Option<GattCharacteristic>,
}

type Connections = Arc<Mutex<HashMap<u64, Connection>>>;
type RssiTable = Arc<Mutex<HashMap<u64, (i16, Instant)>>>;

pub struct WinRtRadio {
    runtime: Handle,
    adapter: Result<(), AdapterFault>,
    next_handle: AtomicU64,
    connections: Connections,
    rssi: RssiTable,
    rssi_max_age: Duration,
    rssi_watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl WinRtRadio {
    /// Probe the default adapter and start the RSSI watcher. Readings older
    /// than `rssi_max_age` are treated as missing.
    pub async fn new(runtime: Handle, rssi_max_age: Duration) -> Self {
        let adapter = probe_adapter().await;
        let rssi: RssiTable = Arc::default();
        let rssi_watcher = match adapter {
            Ok(()) => match start_rssi_watcher(rssi.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("RSSI watcher unavailable: {}", e);
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            runtime,
            adapter,
            next_handle: AtomicU64::new(1),
            connections: Arc::default(),
            rssi,
            rssi_max_age,
            rssi_watcher,
        }
    }

    fn with_connection<T>(
        &self,
        handle: ConnectionHandle,
        f: impl FnOnce(&mut Connection) -> T,
    ) -> Result<T, RadioError> {
        let mut connections = lock(&self.connections)?;
        let connection = connections
            .get_mut(&handle.0)
            .ok_or(RadioError::UnknownHandle(handle.0))?;
        Ok(f(connection))
    }
}

async fn probe_adapter() -> Result<(), AdapterFault> {
    let adapter = match BluetoothAdapter::GetDefaultAsync() {
        Ok(op) => op.await,
        Err(e) => Err(e),
    };
    match adapter {
        Ok(adapter) => {
            if adapter.IsLowEnergySupported().unwrap_or(false) {
                Ok(())
            } else {
                warn!("Default adapter has no LE support");
                Err(AdapterFault::NoBleService)
            }
        }
        Err(e) => {
            warn!("No Bluetooth adapter: {}", e);
            Err(AdapterFault::NoService)
        }
    }
}

fn start_rssi_watcher(table: RssiTable) -> windows::core::Result<BluetoothLEAdvertisementWatcher> {
    let watcher = BluetoothLEAdvertisementWatcher::new()?;
    watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;
    let handler = TypedEventHandler::new(
        move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
              args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
            if let Some(args) = args.as_ref() {
                let address = args.BluetoothAddress()?;
                let rssi = args.RawSignalStrengthInDBm()?;
                if let Ok(mut table) = table.lock() {
                    table.insert(address, (rssi, Instant::now()));
                }
            }
            Ok(())
        },
    );
    watcher.Received(&handler)?;
    watcher.Start()?;
    Ok(watcher)
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, RadioError> {
    mutex
        .lock()
        .map_err(|_| RadioError::Backend("connection table poisoned".into()))
}

fn backend(e: windows::core::Error) -> RadioError {
    RadioError::Backend(e.to_string())
}

fn parse_address(device: &DeviceId) -> Result<u64, RadioError> {
    u64::from_str_radix(device.0.trim_start_matches("0x"), 16)
        .map_err(|_| RadioError::Backend(format!("invalid device address {}", device)))
}

fn parse_uuid(uuid: &str) -> Result<GUID, RadioError> {
    let hex = uuid.replace('-', "");
    let invalid = || RadioError::Backend(format!("invalid UUID {}", uuid));
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(invalid());
    }
    let d1 = u32::from_str_radix(&hex[0..8], 16).map_err(|_| invalid())?;
    let d2 = u16::from_str_radix(&hex[8..12], 16).map_err(|_| invalid())?;
    let d3 = u16::from_str_radix(&hex[12..16], 16).map_err(|_| invalid())?;
    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }
    Ok(GUID::from_values(d1, d2, d3, d4))
}

fn format_uuid(guid: &GUID) -> String {
    let d = guid.data4;
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        guid.data1, guid.data2, guid.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
    )
}

/// Sink of `handle`, if it is still open.
fn sink_of(connections: &Connections, handle: u64) -> Option<EventSink> {
    connections
        .lock()
        .ok()
        .and_then(|c| c.get(&handle).map(|c| c.sink.clone()))
}

/// Report a failed request so the owning link tears down with a fault.
fn fail(connections: &Connections, handle: u64, what: &str, detail: impl std::fmt::Display) {
    error!("{} failed on connection {}: {}", what, handle, detail);
    if let Some(sink) = sink_of(connections, handle) {
        sink.emit(RadioEvent::Failed(format!("{} failed: {}", what, detail)));
    }
}

/// The recorded reading if it is no older than `max_age` at `now`.
fn fresh_rssi(entry: Option<(i16, Instant)>, now: Instant, max_age: Duration) -> Option<i16> {
    let (rssi, seen) = entry?;
    (now.saturating_duration_since(seen) <= max_age).then_some(rssi)
}

impl Radio for WinRtRadio {
    fn check_adapter(&self) -> Result<(), AdapterFault> {
        self.adapter
    }

    fn scan(&self, filter: ScanFilter) -> Result<ScanSubscription, RadioError> {
        self.adapter.map_err(RadioError::Unavailable)?;
        info!("Starting BLE scan for {:?}", filter.names);

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(backend)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(backend)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let adv = Advertisement {
                        device_id: DeviceId(format!("{:012X}", args.BluetoothAddress()?)),
                        name: (!name.is_empty()).then_some(name),
                        tx_power: args
                            .TransmitPowerLevelInDBm()
                            .ok()
                            .and_then(|p| p.Value().ok()),
                        rssi: args.RawSignalStrengthInDBm()?,
                    };
                    if filter.matches(&adv) {
                        let _ = sender.send(adv);
                    }
                }
                Ok(())
            },
        );
        watcher.Received(&handler).map_err(backend)?;
        watcher.Start().map_err(backend)?;

        Ok(ScanSubscription::new(receiver, move || {
            info!("Stopping BLE scan...");
            let _ = watcher.Stop();
        }))
    }

    fn connect(&self, device: &DeviceId, sink: EventSink) -> Result<ConnectionHandle, RadioError> {
        self.adapter.map_err(RadioError::Unavailable)?;
        let address = parse_address(device)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.connections)?.insert(
            handle,
            Connection {
                address,
                sink: sink.clone(),
                device: None,
                session: None,
                services: Vec::new(),
                characteristic: None,
            },
        );

        let connections = self.connections.clone();
        self.runtime.spawn(async move {
            let result: windows::core::Result<(BluetoothLEDevice, Option<GattSession>)> = async {
                let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
                let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await
                {
                    Ok(session) => {
                        session.SetMaintainConnection(true)?;
                        Some(session)
                    }
                    Err(e) => {
                        warn!("Failed to create GattSession, continuing anyway: {}", e);
                        None
                    }
                };

                let status_sink = sink.clone();
                let status_handler =
                    TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                        if let Some(dev) = dev.as_ref() {
                            if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                                status_sink.emit(RadioEvent::Disconnected);
                            }
                        }
                        Ok(())
                    });
                device.ConnectionStatusChanged(&status_handler)?;
                Ok((device, session))
            }
            .await;

            match result {
                Ok((device, session)) => {
                    let attached = connections
                        .lock()
                        .ok()
                        .and_then(|mut c| {
                            c.get_mut(&handle).map(|c| {
                                c.device = Some(device.clone());
                                c.session = session;
                            })
                        })
                        .is_some();
                    if attached {
                        info!("Device {:012X} connected", address);
                        sink.emit(RadioEvent::Connected);
                    } else {
                        // Closed while the connect was in progress
                        let _ = device.Close();
                    }
                }
                Err(e) => fail(&connections, handle, "Connect", e),
            }
        });
        Ok(ConnectionHandle(handle))
    }

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), RadioError> {
        let device = self
            .with_connection(handle, |c| c.device.clone())?
            .ok_or_else(|| RadioError::Backend("device not connected".into()))?;
        let connections = self.connections.clone();
        self.runtime.spawn(async move {
            let result: windows::core::Result<(Vec<GattDeviceService>, Vec<GattServiceInfo>)> =
                async {
                    let services_result = device.GetGattServicesAsync()?.await?;
                    if services_result.Status()? != GattCommunicationStatus::Success {
                        return Ok((Vec::new(), Vec::new()));
                    }
                    let mut services = Vec::new();
                    let mut infos = Vec::new();
                    for service in services_result.Services()? {
                        let chars = service.GetCharacteristicsAsync()?.await?;
                        let mut characteristics = Vec::new();
                        if chars.Status()? == GattCommunicationStatus::Success {
                            for c in chars.Characteristics()? {
                                characteristics.push(format_uuid(&c.Uuid()?));
                            }
                        }
                        infos.push(GattServiceInfo {
                            uuid: format_uuid(&service.Uuid()?),
                            characteristics,
                        });
                        services.push(service);
                    }
                    Ok((services, infos))
                }
                .await;

            match result {
                Ok((services, infos)) => {
                    debug!("Connection {} exposes {} services", handle.0, infos.len());
                    let sink = connections.lock().ok().and_then(|mut c| {
                        c.get_mut(&handle.0).map(|c| {
                            c.services = services;
                            c.sink.clone()
                        })
                    });
                    if let Some(sink) = sink {
                        sink.emit(RadioEvent::ServicesDiscovered(infos));
                    }
                }
                Err(e) => fail(&connections, handle.0, "Service discovery", e),
            }
        });
        Ok(())
    }

    fn enable_notification(
        &self,
        handle: ConnectionHandle,
        target: &GattTarget,
    ) -> Result<(), RadioError> {
        let service_uuid = parse_uuid(&target.service)?;
        let char_uuid = parse_uuid(&target.characteristic)?;
        let descriptor = target.descriptor.clone();
        let (services, sink) = self.with_connection(handle, |c| (c.services.clone(), c.sink.clone()))?;
        let connections = self.connections.clone();

        self.runtime.spawn(async move {
            let result: windows::core::Result<Option<GattCharacteristic>> = async {
                for service in services {
                    if service.Uuid()? != service_uuid {
                        continue;
                    }
                    let chars = service.GetCharacteristicsForUuidAsync(char_uuid)?.await?;
                    if chars.Status()? != GattCommunicationStatus::Success {
                        continue;
                    }
                    for characteristic in chars.Characteristics()? {
                        let status = characteristic
                            .WriteClientCharacteristicConfigurationDescriptorAsync(
                                GattClientCharacteristicConfigurationDescriptorValue::Notify,
                            )?
                            .await?;
                        if status != GattCommunicationStatus::Success {
                            warn!("Notification subscription returned status: {:?}", status);
                            return Ok(None);
                        }

                        let data_sink = sink.clone();
                        let data_handler = TypedEventHandler::new(
                            move |_: windows::core::Ref<GattCharacteristic>,
                                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                                if let Some(args) = args.as_ref() {
                                    let value = args.CharacteristicValue()?;
                                    let reader = DataReader::FromBuffer(&value)?;
                                    let mut bytes = vec![0u8; value.Length()? as usize];
                                    reader.ReadBytes(&mut bytes)?;
                                    data_sink.emit(RadioEvent::CharacteristicChanged(bytes));
                                }
                                Ok(())
                            },
                        );
                        characteristic.ValueChanged(&data_handler)?;
                        return Ok(Some(characteristic));
                    }
                }
                Ok(None)
            }
            .await;

            match result {
                Ok(Some(characteristic)) => {
                    info!("Notifications enabled successfully");
                    if let Ok(mut c) = connections.lock() {
                        if let Some(c) = c.get_mut(&handle.0) {
                            c.characteristic = Some(characteristic);
                        }
                    }
                    sink.emit(RadioEvent::DescriptorWritten(descriptor));
                }
                Ok(None) => fail(&connections, handle.0, "Notification subscription", "characteristic unavailable"),
                Err(e) => fail(&connections, handle.0, "Notification subscription", e),
            }
        });
        Ok(())
    }

    fn write(&self, handle: ConnectionHandle, bytes: &[u8]) -> Result<(), RadioError> {
        let (characteristic, sink) =
            self.with_connection(handle, |c| (c.characteristic.clone(), c.sink.clone()))?;
        let characteristic = characteristic
            .ok_or_else(|| RadioError::Backend("characteristic not subscribed".into()))?;

        let writer = DataWriter::new().map_err(backend)?;
        writer.WriteBytes(bytes).map_err(backend)?;
        let buffer = writer.DetachBuffer().map_err(backend)?;

        let connections = self.connections.clone();
        self.runtime.spawn(async move {
            let result = async {
                characteristic
                    .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse)?
                    .await
            }
            .await;
            match result {
                Ok(GattCommunicationStatus::Success) => sink.emit(RadioEvent::WriteComplete),
                Ok(status) => fail(&connections, handle.0, "Write", format!("{:?}", status)),
                Err(e) => fail(&connections, handle.0, "Write", e),
            }
        });
        Ok(())
    }

    fn read_rssi(&self, handle: ConnectionHandle) -> Result<(), RadioError> {
        let address = self.with_connection(handle, |c| c.address)?;
        let connections = self.connections.clone();
        let table = self.rssi.clone();
        let max_age = self.rssi_max_age;
        self.runtime.spawn(async move {
            let mut stale_reported = false;
            loop {
                let Some(sink) = sink_of(&connections, handle.0) else {
                    return;
                };
                let entry = table.lock().ok().and_then(|t| t.get(&address).copied());
                if let Some(value) = fresh_rssi(entry, Instant::now(), max_age) {
                    sink.emit(RadioEvent::RssiRead(value));
                    return;
                }
                if entry.is_some() && !stale_reported {
                    warn!("RSSI for {:012X} is older than {:?}, waiting", address, max_age);
                    stale_reported = true;
                }
                tokio::time::sleep(RSSI_RETRY_DELAY).await;
            }
        });
        Ok(())
    }

    fn close(&self, handle: ConnectionHandle) {
        let removed = match self.connections.lock() {
            Ok(mut c) => c.remove(&handle.0),
            Err(_) => None,
        };
        if let Some(connection) = removed {
            if let Some(session) = connection.session {
                let _ = session.Close();
            }
            for service in connection.services {
                let _ = service.Close();
            }
            if let Some(device) = connection.device {
                let _ = device.Close();
            }
            info!("Closed connection {}", handle.0);
        }
    }
}

impl Drop for WinRtRadio {
    fn drop(&mut self) {
        if let Some(watcher) = self.rssi_watcher.take() {
            let _ = watcher.Stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;

    #[test]
    fn test_uuid_text_round_trip() {
        let guid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(guid.data1, 0x0000ffe0);
        assert_eq!(format_uuid(&guid), SERVICE_UUID);
    }

    #[test]
    fn test_stale_rssi_is_not_reported() {
        let seen = Instant::now();
        let max_age = Duration::from_millis(150);
        assert_eq!(fresh_rssi(Some((-60, seen)), seen, max_age), Some(-60));
        assert_eq!(
            fresh_rssi(Some((-60, seen)), seen + Duration::from_millis(150), max_age),
            Some(-60)
        );
        assert_eq!(
            fresh_rssi(Some((-60, seen)), seen + Duration::from_millis(151), max_age),
            None
        );
        assert_eq!(fresh_rssi(None, seen, max_age), None);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address(&DeviceId("0000AABBCCDD".into())).unwrap(), 0xAABBCCDD);
        assert!(parse_address(&DeviceId("zz".into())).is_err());
    }
}
