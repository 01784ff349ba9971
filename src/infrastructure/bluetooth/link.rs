//! BLE Link Module
//!
//! Per-radio connection lifecycle. One state machine serves every role; the
//! primary variant adds GATT setup, the text channel and the serialized write
//! path.
//!
//! ```text
//! Idle ─► Connecting ─┬──────────────────────────────────────────► Ready  (left/right)
//!                     └► DiscoveringServices ─► EnablingNotifications ─► Ready  (primary)
//! any non-idle state ─► Lost  (disconnect or setup fault, terminal)
//! ```

use crate::domain::mailbox::CommandMailbox;
use crate::domain::models::{BeaconRole, CloseReason};
use crate::error::{LocatorError, RadioError};
use crate::infrastructure::bluetooth::protocol::{self, GattTarget};
use crate::infrastructure::bluetooth::radio::{
    ConnectionHandle, DeviceId, EventSink, GattServiceInfo, Radio, RadioEvent,
};
use crate::infrastructure::bluetooth::session::TeardownToken;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    DiscoveringServices,
    EnablingNotifications,
    Ready,
    Lost,
}

/// Why a link entered [`LinkState::Lost`].
#[derive(Debug, Clone, PartialEq)]
pub enum LossCause {
    Disconnected,
    /// GATT setup or a radio request failed.
    Fault(String),
}

/// What a radio event means to the link's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutput {
    Ready,
    /// Reported exactly once per link.
    Lost(LossCause),
    /// A text line arrived on the primary characteristic.
    Line(String),
    Rssi(i16),
}

/// Write path of the primary link.
struct PrimaryChannel {
    target: GattTarget,
    mailbox: Arc<CommandMailbox>,
    /// Text frames waiting for the write slot; sent before mailbox content.
    outbound: VecDeque<Vec<u8>>,
    write_in_flight: bool,
}

enum Channel {
    Primary(PrimaryChannel),
    Secondary,
}

pub struct Link {
    role: BeaconRole,
    state: LinkState,
    radio: Arc<dyn Radio>,
    handle: Option<ConnectionHandle>,
    channel: Channel,
    rssi_in_flight: bool,
    teardown: Option<TeardownToken>,
}

impl Link {
    /// Primary link writing to `target` and draining `mailbox`.
    pub fn primary(radio: Arc<dyn Radio>, target: GattTarget, mailbox: Arc<CommandMailbox>) -> Self {
        Self::with_channel(
            BeaconRole::Primary,
            radio,
            Channel::Primary(PrimaryChannel {
                target,
                mailbox,
                outbound: VecDeque::new(),
                write_in_flight: false,
            }),
        )
    }

    /// RSSI-only link for a fixed beacon.
    pub fn secondary(role: BeaconRole, radio: Arc<dyn Radio>) -> Self {
        debug_assert!(!role.is_primary());
        Self::with_channel(role, radio, Channel::Secondary)
    }

    fn with_channel(role: BeaconRole, radio: Arc<dyn Radio>, channel: Channel) -> Self {
        Self {
            role,
            state: LinkState::Idle,
            radio,
            handle: None,
            channel,
            rssi_in_flight: false,
            teardown: None,
        }
    }

    pub fn role(&self) -> BeaconRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready && self.handle.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state != LinkState::Idle && self.handle.is_none()
    }

    /// Signal `token` when this link is lost.
    pub fn attach_teardown(&mut self, token: TeardownToken) {
        self.teardown = Some(token);
    }

    /// `Idle → Connecting`.
    pub fn connect(&mut self, device: &DeviceId, sink: EventSink) -> Result<(), LocatorError> {
        if self.state != LinkState::Idle {
            return Err(LocatorError::ProtocolFault(format!(
                "{} link already started",
                self.role
            )));
        }
        info!("Connecting {} link to {}", self.role, device);
        let handle = self.radio.connect(device, sink)?;
        self.handle = Some(handle);
        self.set_state(LinkState::Connecting);
        Ok(())
    }

    /// Apply one radio event. Events for a lost or closed link are ignored.
    pub fn handle_event(&mut self, event: RadioEvent) -> Option<LinkOutput> {
        let handle = match self.handle {
            Some(handle) if self.state != LinkState::Lost => handle,
            _ => {
                trace!("Ignoring {:?} on inactive {} link", event, self.role);
                return None;
            }
        };

        match event {
            RadioEvent::Disconnected => {
                if self.state == LinkState::Idle {
                    return None;
                }
                self.mark_lost(LossCause::Disconnected)
            }
            RadioEvent::Failed(detail) => self.mark_lost(LossCause::Fault(detail)),
            RadioEvent::Connected if self.state == LinkState::Connecting => {
                match self.channel {
                    Channel::Secondary => self.become_ready(),
                    Channel::Primary(_) => {
                        self.set_state(LinkState::DiscoveringServices);
                        match self.radio.discover_services(handle) {
                            Ok(()) => None,
                            Err(e) => self.mark_lost(LossCause::Fault(e.to_string())),
                        }
                    }
                }
            }
            RadioEvent::ServicesDiscovered(services)
                if self.state == LinkState::DiscoveringServices =>
            {
                self.on_services_discovered(handle, &services)
            }
            RadioEvent::DescriptorWritten(uuid) if self.state == LinkState::EnablingNotifications => {
                let Channel::Primary(primary) = &self.channel else {
                    return None;
                };
                if !protocol::uuid_eq(&uuid, &primary.target.descriptor) {
                    debug!("Ignoring write of unrelated descriptor {}", uuid);
                    return None;
                }
                let ready = self.become_ready();
                match self.pump() {
                    Ok(()) => ready,
                    Err(cause) => self.mark_lost(cause),
                }
            }
            RadioEvent::CharacteristicChanged(payload) => {
                if !matches!(self.channel, Channel::Primary(_)) || self.state != LinkState::Ready {
                    return None;
                }
                match protocol::decode_line(&payload) {
                    Some(line) => {
                        debug!("{} link received line {:?}", self.role, line);
                        Some(LinkOutput::Line(line))
                    }
                    None => {
                        warn!("Dropping non-text notification ({} bytes)", payload.len());
                        None
                    }
                }
            }
            RadioEvent::WriteComplete => {
                if let Channel::Primary(primary) = &mut self.channel {
                    primary.write_in_flight = false;
                }
                match self.pump() {
                    Ok(()) => None,
                    Err(cause) => self.mark_lost(cause),
                }
            }
            RadioEvent::RssiRead(value) => {
                self.rssi_in_flight = false;
                (self.state == LinkState::Ready).then_some(LinkOutput::Rssi(value))
            }
            other => {
                debug!("Unexpected {:?} on {} link in {:?}", other, self.role, self.state);
                None
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        handle: ConnectionHandle,
        services: &[GattServiceInfo],
    ) -> Option<LinkOutput> {
        let Channel::Primary(primary) = &self.channel else {
            return None;
        };
        let target = primary.target.clone();
        let found = services
            .iter()
            .filter(|s| protocol::uuid_eq(&s.uuid, &target.service))
            .any(|s| {
                s.characteristics
                    .iter()
                    .any(|c| protocol::uuid_eq(c, &target.characteristic))
            });
        if !found {
            return self.mark_lost(LossCause::Fault(format!(
                "service {} / characteristic {} not found",
                target.service, target.characteristic
            )));
        }

        info!("Found primary service, enabling notifications");
        self.set_state(LinkState::EnablingNotifications);
        match self.radio.enable_notification(handle, &target) {
            Ok(()) => None,
            Err(e) => self.mark_lost(LossCause::Fault(e.to_string())),
        }
    }

    /// Queue a text frame on the primary channel.
    pub fn send_text(&mut self, text: &str) -> Result<(), LocatorError> {
        if self.state == LinkState::Lost || self.is_closed() {
            return Err(LocatorError::LinkLost(self.role));
        }
        let Channel::Primary(primary) = &mut self.channel else {
            return Err(LocatorError::ProtocolFault(format!(
                "{} link has no text channel",
                self.role
            )));
        };
        debug!("{} link sending {:?}", self.role, text);
        primary.outbound.push_back(text.as_bytes().to_vec());
        self.pump_or_lose()
    }

    /// Send the mailbox content if the write slot is free.
    pub fn drain_mailbox(&mut self) -> Result<(), LocatorError> {
        if !matches!(self.channel, Channel::Primary(_)) {
            return Ok(());
        }
        self.pump_or_lose()
    }

    /// Issue one RSSI read unless one is already outstanding.
    pub fn request_rssi(&mut self) -> Result<(), LocatorError> {
        if !self.is_ready() || self.rssi_in_flight {
            return Ok(());
        }
        let Some(handle) = self.handle else {
            return Ok(());
        };
        match self.radio.read_rssi(handle) {
            Ok(()) => {
                self.rssi_in_flight = true;
                Ok(())
            }
            Err(e) => {
                self.lose_on_error(&e);
                Err(e.into())
            }
        }
    }

    /// Release the radio handle. Safe to call repeatedly and from any state.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Closing {} link", self.role);
            self.radio.close(handle);
        }
        if let Channel::Primary(primary) = &mut self.channel {
            primary.outbound.clear();
            primary.write_in_flight = false;
        }
        self.rssi_in_flight = false;
    }

    fn pump_or_lose(&mut self) -> Result<(), LocatorError> {
        match self.pump() {
            Ok(()) => Ok(()),
            Err(cause) => {
                self.mark_lost(cause);
                Err(LocatorError::LinkLost(self.role))
            }
        }
    }

    /// Start the next write if the link is ready and nothing is in flight.
    /// Write completion is the only other caller, so at most one write is
    /// ever outstanding.
    fn pump(&mut self) -> Result<(), LossCause> {
        let ready = self.is_ready();
        let Some(handle) = self.handle else {
            return Ok(());
        };
        let Channel::Primary(primary) = &mut self.channel else {
            return Ok(());
        };
        if !ready || primary.write_in_flight {
            return Ok(());
        }

        let frame = match primary.outbound.pop_front() {
            Some(text) => text,
            None => match primary.mailbox.take() {
                Some(command) => {
                    trace!("Sending command {:?}", command);
                    protocol::encode_command(&command).to_vec()
                }
                None => return Ok(()),
            },
        };

        self.radio
            .write(handle, &frame)
            .map_err(|e| LossCause::Fault(e.to_string()))?;
        primary.write_in_flight = true;
        Ok(())
    }

    fn lose_on_error(&mut self, error: &RadioError) {
        warn!("{} link request failed: {}", self.role, error);
        self.mark_lost(LossCause::Fault(error.to_string()));
    }

    fn become_ready(&mut self) -> Option<LinkOutput> {
        self.set_state(LinkState::Ready);
        Some(LinkOutput::Ready)
    }

    fn mark_lost(&mut self, cause: LossCause) -> Option<LinkOutput> {
        if self.state == LinkState::Lost {
            return None;
        }
        warn!("{} link lost: {:?}", self.role, cause);
        self.set_state(LinkState::Lost);
        if let Some(token) = &self.teardown {
            let reason = match &cause {
                LossCause::Disconnected => CloseReason::LinkLost(self.role),
                LossCause::Fault(detail) => CloseReason::ProtocolFault(detail.clone()),
            };
            token.signal(reason);
        }
        Some(LinkOutput::Lost(cause))
    }

    fn set_state(&mut self, state: LinkState) {
        debug!("{} link {:?} -> {:?}", self.role, self.state, state);
        self.state = state;
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterFault;
    use crate::infrastructure::bluetooth::radio::{ScanFilter, ScanSubscription};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect,
        DiscoverServices,
        EnableNotification,
        Write(Vec<u8>),
        ReadRssi,
        Close,
    }

    #[derive(Default)]
    struct RecordingRadio {
        calls: Mutex<Vec<Call>>,
        fail_writes: bool,
    }

    impl RecordingRadio {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &Call) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Write(bytes) => Some(bytes),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Radio for RecordingRadio {
        fn check_adapter(&self) -> Result<(), AdapterFault> {
            Ok(())
        }
        fn scan(&self, _filter: ScanFilter) -> Result<ScanSubscription, RadioError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(ScanSubscription::new(rx, || {}))
        }
        fn connect(&self, _device: &DeviceId, _sink: EventSink) -> Result<ConnectionHandle, RadioError> {
            self.record(Call::Connect);
            Ok(ConnectionHandle(1))
        }
        fn discover_services(&self, _handle: ConnectionHandle) -> Result<(), RadioError> {
            self.record(Call::DiscoverServices);
            Ok(())
        }
        fn enable_notification(
            &self,
            _handle: ConnectionHandle,
            _target: &GattTarget,
        ) -> Result<(), RadioError> {
            self.record(Call::EnableNotification);
            Ok(())
        }
        fn write(&self, _handle: ConnectionHandle, bytes: &[u8]) -> Result<(), RadioError> {
            if self.fail_writes {
                return Err(RadioError::Backend("write rejected".into()));
            }
            self.record(Call::Write(bytes.to_vec()));
            Ok(())
        }
        fn read_rssi(&self, _handle: ConnectionHandle) -> Result<(), RadioError> {
            self.record(Call::ReadRssi);
            Ok(())
        }
        fn close(&self, _handle: ConnectionHandle) {
            self.record(Call::Close);
        }
    }

    fn sink(role: BeaconRole) -> EventSink {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        EventSink::new(role, tx)
    }

    fn ffe0_services() -> Vec<GattServiceInfo> {
        vec![GattServiceInfo {
            uuid: protocol::SERVICE_UUID.to_string(),
            characteristics: vec![protocol::CHARACTERISTIC_UUID.to_string()],
        }]
    }

    fn ready_primary(radio: &Arc<RecordingRadio>, mailbox: Arc<CommandMailbox>) -> Link {
        let mut link = Link::primary(radio.clone(), GattTarget::default(), mailbox);
        link.connect(&DeviceId("P".into()), sink(BeaconRole::Primary)).unwrap();
        assert_eq!(link.handle_event(RadioEvent::Connected), None);
        assert_eq!(link.handle_event(RadioEvent::ServicesDiscovered(ffe0_services())), None);
        assert_eq!(
            link.handle_event(RadioEvent::DescriptorWritten(protocol::DESCRIPTOR_UUID.into())),
            Some(LinkOutput::Ready)
        );
        link
    }

    #[test]
    fn test_primary_setup_sequence() {
        let radio = Arc::new(RecordingRadio::default());
        let link = ready_primary(&radio, Arc::new(CommandMailbox::new()));
        assert_eq!(link.state(), LinkState::Ready);
        assert_eq!(
            radio.calls(),
            vec![Call::Connect, Call::DiscoverServices, Call::EnableNotification]
        );
    }

    #[test]
    fn test_secondary_is_ready_on_connect() {
        let radio = Arc::new(RecordingRadio::default());
        let mut link = Link::secondary(BeaconRole::Left, radio.clone());
        link.connect(&DeviceId("L".into()), sink(BeaconRole::Left)).unwrap();
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(link.handle_event(RadioEvent::Connected), Some(LinkOutput::Ready));
        assert_eq!(radio.count(&Call::DiscoverServices), 0);
    }

    #[test]
    fn test_missing_service_loses_link() {
        let radio = Arc::new(RecordingRadio::default());
        let mut link = Link::primary(radio.clone(), GattTarget::default(), Arc::default());
        link.connect(&DeviceId("P".into()), sink(BeaconRole::Primary)).unwrap();
        link.handle_event(RadioEvent::Connected);
        let out = link.handle_event(RadioEvent::ServicesDiscovered(vec![]));
        assert!(matches!(out, Some(LinkOutput::Lost(LossCause::Fault(_)))));
        assert_eq!(link.state(), LinkState::Lost);
    }

    #[test]
    fn test_at_most_one_write_in_flight() {
        let radio = Arc::new(RecordingRadio::default());
        let mailbox = Arc::new(CommandMailbox::new());
        let mut link = ready_primary(&radio, mailbox.clone());

        mailbox.push(0.1, 0.0, 0.0);
        link.drain_mailbox().unwrap();
        assert_eq!(radio.writes().len(), 1);

        mailbox.push(0.2, 0.0, 0.0);
        link.drain_mailbox().unwrap();
        mailbox.push(0.3, 0.0, 0.0);
        link.drain_mailbox().unwrap();
        assert_eq!(radio.writes().len(), 1);

        assert_eq!(link.handle_event(RadioEvent::WriteComplete), None);
        let writes = radio.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(protocol::decode_command(&writes[1]).unwrap(), [300, 0, 0]);

        link.handle_event(RadioEvent::WriteComplete);
        assert_eq!(radio.writes().len(), 2);
    }

    #[test]
    fn test_text_goes_before_mailbox() {
        let radio = Arc::new(RecordingRadio::default());
        let mailbox = Arc::new(CommandMailbox::new());
        let mut link = ready_primary(&radio, mailbox.clone());

        link.send_text("OK").unwrap();
        mailbox.push(1.0, 1.0, 1.0);
        link.send_text("GL").unwrap();
        link.handle_event(RadioEvent::WriteComplete);
        link.handle_event(RadioEvent::WriteComplete);
        let writes = radio.writes();
        assert_eq!(writes[0], b"OK");
        assert_eq!(writes[1], b"GL");
        assert_eq!(&writes[2][..2], b"CX");
    }

    #[test]
    fn test_text_before_ready_is_flushed_on_ready() {
        let radio = Arc::new(RecordingRadio::default());
        let mut link = Link::primary(radio.clone(), GattTarget::default(), Arc::default());
        link.connect(&DeviceId("P".into()), sink(BeaconRole::Primary)).unwrap();
        link.send_text("OK").unwrap();
        assert!(radio.writes().is_empty());
        link.handle_event(RadioEvent::Connected);
        link.handle_event(RadioEvent::ServicesDiscovered(ffe0_services()));
        link.handle_event(RadioEvent::DescriptorWritten(protocol::DESCRIPTOR_UUID.into()));
        assert_eq!(radio.writes(), vec![b"OK".to_vec()]);
    }

    #[test]
    fn test_lines_are_emitted() {
        let radio = Arc::new(RecordingRadio::default());
        let mut link = ready_primary(&radio, Arc::default());
        assert_eq!(
            link.handle_event(RadioEvent::CharacteristicChanged(b"beaconA\n".to_vec())),
            Some(LinkOutput::Line("beaconA".into()))
        );
    }

    #[test]
    fn test_rssi_reads_are_sequential() {
        let radio = Arc::new(RecordingRadio::default());
        let mut link = Link::secondary(BeaconRole::Right, radio.clone());
        link.connect(&DeviceId("R".into()), sink(BeaconRole::Right)).unwrap();
        link.request_rssi().unwrap();
        assert_eq!(radio.count(&Call::ReadRssi), 0, "not ready yet");

        link.handle_event(RadioEvent::Connected);
        link.request_rssi().unwrap();
        link.request_rssi().unwrap();
        assert_eq!(radio.count(&Call::ReadRssi), 1);
        assert_eq!(
            link.handle_event(RadioEvent::RssiRead(-61)),
            Some(LinkOutput::Rssi(-61))
        );
        link.request_rssi().unwrap();
        assert_eq!(radio.count(&Call::ReadRssi), 2);
    }

    #[test]
    fn test_lost_is_reported_once_and_link_goes_inert() {
        let radio = Arc::new(RecordingRadio::default());
        let mut link = Link::secondary(BeaconRole::Left, radio.clone());
        link.connect(&DeviceId("L".into()), sink(BeaconRole::Left)).unwrap();
        link.handle_event(RadioEvent::Connected);

        assert_eq!(
            link.handle_event(RadioEvent::Disconnected),
            Some(LinkOutput::Lost(LossCause::Disconnected))
        );
        assert_eq!(link.handle_event(RadioEvent::Disconnected), None);
        assert_eq!(link.handle_event(RadioEvent::RssiRead(-50)), None);
        link.request_rssi().unwrap();
        assert_eq!(radio.count(&Call::ReadRssi), 0);
        assert!(link.send_text("OK").is_err());
    }

    #[test]
    fn test_close_is_idempotent_and_runs_on_drop() {
        let radio = Arc::new(RecordingRadio::default());
        let mut link = Link::secondary(BeaconRole::Left, radio.clone());
        link.connect(&DeviceId("L".into()), sink(BeaconRole::Left)).unwrap();
        link.close();
        link.close();
        assert!(link.is_closed());
        assert_eq!(link.handle_event(RadioEvent::Connected), None);
        drop(link);
        assert_eq!(radio.count(&Call::Close), 1);
    }

    #[test]
    fn test_loss_signals_teardown_token() {
        let radio = Arc::new(RecordingRadio::default());
        let token = TeardownToken::new();
        let mut link = Link::secondary(BeaconRole::Right, radio);
        link.attach_teardown(token.clone());
        link.connect(&DeviceId("R".into()), sink(BeaconRole::Right)).unwrap();
        link.handle_event(RadioEvent::Connected);
        link.handle_event(RadioEvent::Disconnected);
        assert_eq!(token.reason(), Some(CloseReason::LinkLost(BeaconRole::Right)));
    }

    #[test]
    fn test_radio_failure_is_a_protocol_fault() {
        let radio = Arc::new(RecordingRadio::default());
        let token = TeardownToken::new();
        let mut link = ready_primary(&radio, Arc::default());
        link.attach_teardown(token.clone());

        let output = link.handle_event(RadioEvent::Failed("GATT write failed".into()));
        assert_eq!(
            output,
            Some(LinkOutput::Lost(LossCause::Fault("GATT write failed".into())))
        );
        assert_eq!(link.state(), LinkState::Lost);
        assert_eq!(
            token.reason(),
            Some(CloseReason::ProtocolFault("GATT write failed".into()))
        );
        // A later disconnect does not overwrite the first reason
        link.handle_event(RadioEvent::Disconnected);
        assert_eq!(
            token.reason(),
            Some(CloseReason::ProtocolFault("GATT write failed".into()))
        );
    }

    #[test]
    fn test_failed_write_loses_link() {
        let radio = Arc::new(RecordingRadio {
            fail_writes: true,
            ..Default::default()
        });
        let mut link = ready_primary(&radio, Arc::default());
        assert_eq!(
            link.send_text("OK"),
            Err(LocatorError::LinkLost(BeaconRole::Primary))
        );
        assert_eq!(link.state(), LinkState::Lost);
    }
}
