//! In-memory radio that answers every request immediately, the way a
//! cooperative BLE stack would, and records what it was asked to do.

#![allow(dead_code)]

use beacon_locator::domain::models::LocatorEvent;
use beacon_locator::error::{AdapterFault, RadioError};
use beacon_locator::infrastructure::bluetooth::protocol::{
    GattTarget, CHARACTERISTIC_UUID, SERVICE_UUID,
};
use beacon_locator::infrastructure::bluetooth::radio::{
    Advertisement, ConnectionHandle, DeviceId, EventSink, GattServiceInfo, Radio, RadioEvent,
    ScanFilter, ScanSubscription,
};
use beacon_locator::{BeaconLocator, LocatorError, SessionHandle, Settings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub const PRIMARY: &str = "unit-1";
pub const LEFT: &str = "beaconA";
pub const RIGHT: &str = "beaconB";

struct Connection {
    device: DeviceId,
    sink: EventSink,
}

#[derive(Default)]
struct State {
    adapter: Option<AdapterFault>,
    advertisers: Vec<Advertisement>,
    replies: HashMap<String, String>,
    rssi: HashMap<DeviceId, i16>,
    connections: HashMap<u64, Connection>,
    next_handle: u64,
    connects: Vec<DeviceId>,
    writes: Vec<(DeviceId, Vec<u8>)>,
    closes: HashMap<DeviceId, usize>,
    hold_writes: bool,
    // Senders stay alive so a scan only ends by timing out
    scans: Vec<mpsc::UnboundedSender<Advertisement>>,
}

#[derive(Default)]
pub struct ScriptedRadio {
    state: Mutex<State>,
    scans_stopped: Arc<AtomicUsize>,
}

pub fn device_id(name: &str) -> DeviceId {
    DeviceId(format!("addr-{}", name))
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// A primary that answers the handshake with [`LEFT`] / [`RIGHT`], and
    /// all three advertising at their reference powers.
    pub fn standard() -> Self {
        Self::new()
            .advertiser(PRIMARY, -52)
            .advertiser(LEFT, -60)
            .advertiser(RIGHT, -60)
            .reply("OK", "OK\r\n")
            .reply("GL", &format!("{}\n", LEFT))
            .reply("GR", &format!("{}\n", RIGHT))
    }

    pub fn advertiser(self, name: &str, rssi: i16) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.advertisers.push(Advertisement {
                device_id: device_id(name),
                name: Some(name.to_string()),
                tx_power: None,
                rssi,
            });
            state.rssi.insert(device_id(name), rssi);
        }
        self
    }

    pub fn reply(self, request: &str, reply: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert(request.to_string(), reply.to_string());
        self
    }

    pub fn without_adapter(self, fault: AdapterFault) -> Self {
        self.state.lock().unwrap().adapter = Some(fault);
        self
    }

    /// Stop acknowledging writes until [`complete_write`](Self::complete_write).
    pub fn hold_writes(&self) {
        self.state.lock().unwrap().hold_writes = true;
    }

    pub fn complete_write(&self, name: &str) {
        self.emit(name, RadioEvent::WriteComplete);
    }

    pub fn disconnect(&self, name: &str) {
        self.emit(name, RadioEvent::Disconnected);
    }

    pub fn set_rssi(&self, name: &str, rssi: i16) {
        self.state.lock().unwrap().rssi.insert(device_id(name), rssi);
    }

    pub fn connects(&self) -> Vec<DeviceId> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn writes_to(&self, name: &str) -> Vec<Vec<u8>> {
        let id = device_id(name);
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(device, _)| *device == id)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn close_count(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.closes.get(&device_id(name)).copied().unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn scans_stopped(&self) -> usize {
        self.scans_stopped.load(Ordering::SeqCst)
    }

    fn emit(&self, name: &str, event: RadioEvent) {
        let id = device_id(name);
        let state = self.state.lock().unwrap();
        for connection in state.connections.values().filter(|c| c.device == id) {
            connection.sink.emit(event.clone());
        }
    }

    fn with_connection<T>(
        &self,
        handle: ConnectionHandle,
        f: impl FnOnce(&mut State, &Connection) -> T,
    ) -> Result<T, RadioError> {
        let mut state = self.state.lock().unwrap();
        let connection = state
            .connections
            .remove(&handle.0)
            .ok_or(RadioError::UnknownHandle(handle.0))?;
        let out = f(&mut state, &connection);
        state.connections.insert(handle.0, connection);
        Ok(out)
    }
}

impl Radio for ScriptedRadio {
    fn check_adapter(&self) -> Result<(), AdapterFault> {
        match self.state.lock().unwrap().adapter {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn scan(&self, _filter: ScanFilter) -> Result<ScanSubscription, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        for adv in &state.advertisers {
            let _ = tx.send(adv.clone());
        }
        // The locator filters for itself; unrelated advertisers must not matter
        let _ = tx.send(Advertisement {
            device_id: DeviceId("addr-stranger".into()),
            name: Some("stranger".into()),
            tx_power: None,
            rssi: -90,
        });
        state.scans.push(tx);
        drop(state);

        let stopped = self.scans_stopped.clone();
        Ok(ScanSubscription::new(rx, move || {
            stopped.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn connect(&self, device: &DeviceId, sink: EventSink) -> Result<ConnectionHandle, RadioError> {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.connects.push(device.clone());
        sink.emit(RadioEvent::Connected);
        state.connections.insert(
            handle,
            Connection {
                device: device.clone(),
                sink,
            },
        );
        Ok(ConnectionHandle(handle))
    }

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), RadioError> {
        self.with_connection(handle, |_, c| {
            c.sink.emit(RadioEvent::ServicesDiscovered(vec![GattServiceInfo {
                uuid: SERVICE_UUID.to_uppercase(),
                characteristics: vec![CHARACTERISTIC_UUID.to_string()],
            }]))
        })
    }

    fn enable_notification(
        &self,
        handle: ConnectionHandle,
        target: &GattTarget,
    ) -> Result<(), RadioError> {
        self.with_connection(handle, |_, c| {
            c.sink
                .emit(RadioEvent::DescriptorWritten(target.descriptor.clone()))
        })
    }

    fn write(&self, handle: ConnectionHandle, bytes: &[u8]) -> Result<(), RadioError> {
        self.with_connection(handle, |state, c| {
            state.writes.push((c.device.clone(), bytes.to_vec()));
            if !state.hold_writes {
                c.sink.emit(RadioEvent::WriteComplete);
            }
            let request = String::from_utf8_lossy(bytes).to_string();
            if let Some(reply) = state.replies.get(&request) {
                c.sink
                    .emit(RadioEvent::CharacteristicChanged(reply.as_bytes().to_vec()));
            }
        })
    }

    fn read_rssi(&self, handle: ConnectionHandle) -> Result<(), RadioError> {
        self.with_connection(handle, |state, c| {
            let rssi = state.rssi.get(&c.device).copied().unwrap_or(-100);
            c.sink.emit(RadioEvent::RssiRead(rssi));
        })
    }

    fn close(&self, handle: ConnectionHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(connection) = state.connections.remove(&handle.0) {
            *state.closes.entry(connection.device).or_insert(0) += 1;
        }
    }
}

pub fn locator(radio: &Arc<ScriptedRadio>, settings: &Settings) -> BeaconLocator {
    let radio: Arc<dyn Radio> = radio.clone();
    BeaconLocator::new(radio, settings, Handle::current())
}

/// Run discovery for [`PRIMARY`] against `radio` with default settings.
pub async fn discover(
    radio: &Arc<ScriptedRadio>,
) -> (
    Result<SessionHandle, LocatorError>,
    mpsc::UnboundedReceiver<LocatorEvent>,
) {
    discover_with(radio, &Settings::default()).await
}

pub async fn discover_with(
    radio: &Arc<ScriptedRadio>,
    settings: &Settings,
) -> (
    Result<SessionHandle, LocatorError>,
    mpsc::UnboundedReceiver<LocatorEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let result = locator(radio, settings).begin_discovery(PRIMARY, tx).await;
    (result, rx)
}

/// Discovery that is expected to succeed.
pub async fn connected_session(
    radio: &Arc<ScriptedRadio>,
) -> (SessionHandle, mpsc::UnboundedReceiver<LocatorEvent>) {
    connected_session_with(radio, &Settings::default()).await
}

pub async fn connected_session_with(
    radio: &Arc<ScriptedRadio>,
    settings: &Settings,
) -> (SessionHandle, mpsc::UnboundedReceiver<LocatorEvent>) {
    let (result, rx) = discover_with(radio, settings).await;
    (result.expect("discovery should succeed"), rx)
}

/// Collect events until the channel closes.
pub async fn drain(events: &mut mpsc::UnboundedReceiver<LocatorEvent>) -> Vec<LocatorEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.recv().await {
        out.push(event);
    }
    out
}
