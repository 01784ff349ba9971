//! Discovery Coordinator
//!
//! Turns one operator-supplied name into three connected links:
//!
//! 1. scan for the primary unit by name
//! 2. connect it through full GATT setup
//! 3. run the `OK` / `GL` / `GR` handshake to learn the secondary names
//! 4. scan for both secondary beacons
//! 5. connect them
//!
//! Any failure drops every link opened so far (which closes them) and is
//! reported once. Nothing is retried.

use crate::domain::mailbox::CommandMailbox;
use crate::domain::models::{BeaconRole, LocatorEvent, MessageSeverity, RoleMap, StatusMessage};
use crate::domain::settings::LocatorSettings;
use crate::error::LocatorError;
use crate::infrastructure::bluetooth::link::{Link, LinkOutput, LossCause};
use crate::infrastructure::bluetooth::protocol::{
    GattTarget, HandshakeRequest, HANDSHAKE_SEQUENCE,
};
use crate::infrastructure::bluetooth::radio::{
    Advertisement, EventSink, LinkEvent, Radio, ScanFilter,
};
use crate::infrastructure::bluetooth::session::BeaconNames;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Everything a session needs, handed over once discovery succeeds.
pub struct Discovered {
    pub names: BeaconNames,
    pub links: RoleMap<Link>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    pub reference_power: RoleMap<i16>,
    pub mailbox: Arc<CommandMailbox>,
}

pub struct DiscoveryCoordinator<'a> {
    radio: Arc<dyn Radio>,
    settings: &'a LocatorSettings,
    target: &'a GattTarget,
    shell: mpsc::UnboundedSender<LocatorEvent>,
    mailbox: Arc<CommandMailbox>,
    sender: mpsc::UnboundedSender<LinkEvent>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl<'a> DiscoveryCoordinator<'a> {
    pub fn new(
        radio: Arc<dyn Radio>,
        settings: &'a LocatorSettings,
        target: &'a GattTarget,
        shell: mpsc::UnboundedSender<LocatorEvent>,
    ) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            radio,
            settings,
            target,
            shell,
            mailbox: Arc::new(CommandMailbox::new()),
            sender,
            events,
        }
    }

    pub async fn run(mut self, name: &str) -> Result<Discovered, LocatorError> {
        self.radio.check_adapter()?;

        // Step 1: find the primary unit
        self.send_log(&format!("Scanning for {}...", name), MessageSeverity::Info);
        let primary_adv = self.scan_for(&[name], &mut []).await?.remove(0);
        info!(
            "Found primary {} at {} ({} dBm)",
            name, primary_adv.device_id, primary_adv.rssi
        );

        // Step 2: connect and wait for GATT setup
        let mut primary = Link::primary(self.radio.clone(), self.target.clone(), self.mailbox.clone());
        primary.connect(&primary_adv.device_id, self.sink(BeaconRole::Primary))?;
        let deadline = Instant::now() + self.settings.connect_timeout();
        self.await_ready(&mut [&mut primary], deadline, "connecting primary")
            .await?;
        self.send_log("Primary connected", MessageSeverity::Info);

        // Step 3: handshake
        let (left_name, right_name) = self.handshake(&mut primary).await?;
        self.send_log(
            &format!("Beacons: left={} right={}", left_name, right_name),
            MessageSeverity::Info,
        );

        // Step 4: find both secondary beacons
        let mut found = self
            .scan_for(&[left_name.as_str(), right_name.as_str()], &mut [&mut primary])
            .await?;
        let right_adv = found.remove(1);
        let left_adv = found.remove(0);
        info!(
            "Found beacons {} ({} dBm) and {} ({} dBm)",
            left_name, left_adv.rssi, right_name, right_adv.rssi
        );

        // Step 5: connect them
        let mut left = Link::secondary(BeaconRole::Left, self.radio.clone());
        let mut right = Link::secondary(BeaconRole::Right, self.radio.clone());
        left.connect(&left_adv.device_id, self.sink(BeaconRole::Left))?;
        right.connect(&right_adv.device_id, self.sink(BeaconRole::Right))?;
        let deadline = Instant::now() + self.settings.connect_timeout();
        self.await_ready(
            &mut [&mut primary, &mut left, &mut right],
            deadline,
            "connecting beacons",
        )
        .await?;

        let calibration = &self.settings.calibration;
        let reference_power = RoleMap::new(
            calibration.resolve(BeaconRole::Primary, primary_adv.tx_power),
            calibration.resolve(BeaconRole::Left, left_adv.tx_power),
            calibration.resolve(BeaconRole::Right, right_adv.tx_power),
        );

        Ok(Discovered {
            names: BeaconNames {
                primary: name.to_string(),
                left: left_name,
                right: right_name,
            },
            links: RoleMap::new(primary, left, right),
            events: self.events,
            reference_power,
            mailbox: self.mailbox,
        })
    }

    /// Resolve the left and right beacon names over the primary text channel.
    async fn handshake(&mut self, primary: &mut Link) -> Result<(String, String), LocatorError> {
        let mut left = String::new();
        let mut right = String::new();
        for request in HANDSHAKE_SEQUENCE {
            let reply = self.request(primary, request).await?;
            match request {
                HandshakeRequest::Ack => {}
                HandshakeRequest::LeftName => left = reply,
                HandshakeRequest::RightName => right = reply,
            }
        }

        if left.is_empty() || right.is_empty() {
            return Err(LocatorError::ProtocolFault(format!(
                "empty beacon name in handshake (left={:?}, right={:?})",
                left, right
            )));
        }
        if left == right {
            return Err(LocatorError::ProtocolFault(format!(
                "left and right beacons share the name {:?}",
                left
            )));
        }
        Ok((left, right))
    }

    /// One request/response exchange: the first line after the send is the reply.
    async fn request(
        &mut self,
        primary: &mut Link,
        request: HandshakeRequest,
    ) -> Result<String, LocatorError> {
        // Lines that arrived before this request belong to nobody.
        self.drain_pending(&mut [&mut *primary])?;

        primary.send_text(request.as_str())?;
        let deadline = Instant::now() + self.settings.handshake_timeout();
        loop {
            let (_, output) = self
                .next_output(&mut [&mut *primary], deadline, "waiting for handshake reply")
                .await?;
            if let LinkOutput::Line(reply) = output {
                info!("Handshake {} -> {:?}", request.as_str(), reply);
                return Ok(reply);
            }
        }
    }

    /// Scan until every name in `names` has been seen once, returning their
    /// advertisements in the same order. Links in `watched` keep being
    /// serviced so a loss during the scan is noticed.
    async fn scan_for(
        &mut self,
        names: &[&str],
        watched: &mut [&mut Link],
    ) -> Result<Vec<Advertisement>, LocatorError> {
        let filter = ScanFilter::names(names.iter().copied());
        let mut scan = self.radio.scan(filter.clone())?;
        debug!("Scan started for {:?}", names);

        let mut found: Vec<Option<Advertisement>> = vec![None; names.len()];
        let deadline = Instant::now() + self.settings.scan_timeout();

        let result = tokio::time::timeout_at(deadline, async {
            loop {
                tokio::select! {
                    adv = scan.next() => {
                        let Some(adv) = adv else {
                            return Err(LocatorError::DeviceNotFound);
                        };
                        if !filter.matches(&adv) {
                            continue;
                        }
                        let name = adv.name.as_deref().unwrap_or_default();
                        if let Some(i) = names.iter().position(|n| *n == name) {
                            if found[i].is_none() {
                                debug!("Scan matched {} ({})", name, adv.device_id);
                                found[i] = Some(adv);
                            }
                        }
                        if found.iter().all(Option::is_some) {
                            return Ok(());
                        }
                    }
                    Some(event) = self.events.recv() => {
                        if let Err(e) = route(watched, event) {
                            return Err(e);
                        }
                    }
                }
            }
        })
        .await;

        scan.stop();
        match result {
            Ok(Ok(())) => Ok(found.into_iter().flatten().collect()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Scan for {:?} timed out", names);
                Err(LocatorError::DeviceNotFound)
            }
        }
    }

    /// Wait until every link in `links` reports ready.
    async fn await_ready(
        &mut self,
        links: &mut [&mut Link],
        deadline: Instant,
        stage: &'static str,
    ) -> Result<(), LocatorError> {
        while !links.iter().all(|l| l.is_ready()) {
            self.next_output(links, deadline, stage).await?;
        }
        Ok(())
    }

    /// Next output from any of `links`, failing on loss or at `deadline`.
    async fn next_output(
        &mut self,
        links: &mut [&mut Link],
        deadline: Instant,
        stage: &'static str,
    ) -> Result<(BeaconRole, LinkOutput), LocatorError> {
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(LocatorError::ProtocolFault("event channel closed".into())),
                Err(_) => {
                    warn!("Timed out while {}", stage);
                    return Err(LocatorError::Timeout(stage));
                }
            };
            if let Some(output) = route(links, event)? {
                return Ok(output);
            }
        }
    }

    /// Apply every event already queued without waiting for more.
    fn drain_pending(&mut self, links: &mut [&mut Link]) -> Result<(), LocatorError> {
        while let Ok(event) = self.events.try_recv() {
            if let Some((role, LinkOutput::Line(line))) = route(links, event)? {
                debug!("Discarding unsolicited line from {}: {:?}", role, line);
            }
        }
        Ok(())
    }

    fn sink(&self, role: BeaconRole) -> EventSink {
        EventSink::new(role, self.sender.clone())
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.shell.send(LocatorEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Hand `event` to the link it belongs to. Loss becomes an error.
fn route(
    links: &mut [&mut Link],
    LinkEvent { role, event }: LinkEvent,
) -> Result<Option<(BeaconRole, LinkOutput)>, LocatorError> {
    let Some(link) = links.iter_mut().find(|l| l.role() == role) else {
        debug!("Ignoring event for {} link outside this stage", role);
        return Ok(None);
    };
    match link.handle_event(event) {
        Some(LinkOutput::Lost(LossCause::Disconnected)) => Err(LocatorError::LinkLost(role)),
        Some(LinkOutput::Lost(LossCause::Fault(detail))) => Err(LocatorError::ProtocolFault(detail)),
        Some(output) => Ok(Some((role, output))),
        None => Ok(None),
    }
}
