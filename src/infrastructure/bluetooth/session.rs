//! Session Supervisor
//!
//! Owns the three links and the trilateration engine once discovery has
//! succeeded. Everything runs on one driver task: radio events, shell
//! controls and RSSI poll timers are all handled there, so no handler ever
//! blocks or races another. The only state shared with the shell is the
//! command mailbox.

use crate::domain::mailbox::CommandMailbox;
use crate::domain::models::{
    BeaconRole, CloseReason, ConnectionStatus, LocatorEvent, MessageSeverity, RoleMap,
    StatusMessage,
};
use crate::domain::settings::{LocatorSettings, RssiPollPolicy};
use crate::domain::trilateration::TrilaterationEngine;
use crate::error::LocatorError;
use crate::infrastructure::bluetooth::discovery::Discovered;
use crate::infrastructure::bluetooth::link::{Link, LinkOutput};
use crate::infrastructure::bluetooth::radio::LinkEvent;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One-shot teardown signal shared by the links of a session.
///
/// The first [`signal`](Self::signal) wins; later calls are ignored, so the
/// fan-out that follows happens once no matter how many links report loss.
#[derive(Debug, Clone)]
pub struct TeardownToken {
    inner: Arc<watch::Sender<Option<CloseReason>>>,
}

impl TeardownToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            inner: Arc::new(sender),
        }
    }

    /// Returns `true` only for the call that actually fired the token.
    pub fn signal(&self, reason: CloseReason) -> bool {
        self.inner.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_signalled(&self) -> bool {
        self.inner.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.inner.borrow().clone()
    }

    /// Resolves once the token has fired.
    pub async fn signalled(&self) -> CloseReason {
        let mut receiver = self.inner.subscribe();
        loop {
            if let Some(reason) = receiver.borrow_and_update().clone() {
                return reason;
            }
            if receiver.changed().await.is_err() {
                return CloseReason::Requested;
            }
        }
    }
}

impl Default for TeardownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Names the handshake resolved for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconNames {
    pub primary: String,
    pub left: String,
    pub right: String,
}

#[derive(Debug)]
enum Control {
    Enable,
    Disable,
    /// The mailbox was armed; send it if the write slot is free.
    Drain,
}

/// Shell-facing handle to a live session.
///
/// Dropping the handle closes the session.
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Control>,
    mailbox: Arc<CommandMailbox>,
    token: TeardownToken,
    task: JoinHandle<()>,
    names: BeaconNames,
}

impl SessionHandle {
    /// Start continuous RSSI sampling and position evaluation.
    pub fn enable(&self) -> Result<(), LocatorError> {
        self.send(Control::Enable)
    }

    pub fn disable(&self) -> Result<(), LocatorError> {
        self.send(Control::Disable)
    }

    /// Queue a manual motion command. Replaces any command not yet sent.
    pub fn command(&self, x: f64, y: f64, z: f64) -> Result<(), LocatorError> {
        self.ensure_open()?;
        self.mailbox.push(x, y, z);
        self.send(Control::Drain)
    }

    fn send(&self, control: Control) -> Result<(), LocatorError> {
        self.ensure_open()?;
        self.control
            .send(control)
            .map_err(|_| LocatorError::SessionClosed)
    }

    fn ensure_open(&self) -> Result<(), LocatorError> {
        if self.token.is_signalled() {
            debug!("Rejecting control for closed session");
            return Err(LocatorError::SessionClosed);
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.token.signal(CloseReason::Requested) {
            info!("Session close requested");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_signalled()
    }

    pub fn beacons(&self) -> &BeaconNames {
        &self.names
    }

    /// Wait until the session has fully torn down.
    pub async fn closed(self) -> CloseReason {
        let token = self.token.clone();
        let reason = token.signalled().await;
        let _ = self.task.await;
        reason
    }
}

/// Spawn the session driver for a successfully discovered set of links.
pub(crate) fn activate(
    discovered: Discovered,
    settings: &LocatorSettings,
    shell: mpsc::UnboundedSender<LocatorEvent>,
    runtime: &Handle,
) -> SessionHandle {
    let Discovered {
        names,
        mut links,
        events,
        reference_power,
        mailbox,
    } = discovered;

    let token = TeardownToken::new();
    for role in BeaconRole::ALL {
        links[role].attach_teardown(token.clone());
    }

    info!(
        "Session active: primary={} left={} right={} (reference power {:?})",
        names.primary, names.left, names.right, reference_power
    );
    let _ = shell.send(LocatorEvent::ConnectionStatus(ConnectionStatus::Connected));
    let _ = shell.send(LocatorEvent::LogMessage(StatusMessage {
        message: format!("Tracking with {} / {}", names.left, names.right),
        severity: MessageSeverity::Success,
    }));

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let driver = SessionDriver {
        links,
        engine: TrilaterationEngine::new(settings, reference_power),
        mailbox: mailbox.clone(),
        link_events: events,
        control: control_rx,
        shell,
        token: token.clone(),
        polls: JoinSet::new(),
        poll_pending: RoleMap::default(),
        poll_policy: settings.rssi_poll,
        echo_distances: settings.echo_distances,
    };
    let task = runtime.spawn(driver.run());

    SessionHandle {
        control: control_tx,
        mailbox,
        token,
        task,
        names,
    }
}

struct SessionDriver {
    links: RoleMap<Link>,
    engine: TrilaterationEngine,
    mailbox: Arc<CommandMailbox>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    shell: mpsc::UnboundedSender<LocatorEvent>,
    token: TeardownToken,
    /// Pending RSSI poll delays; each resolves to the role it is for.
    polls: JoinSet<BeaconRole>,
    /// A poll is scheduled or a read is outstanding for the role.
    poll_pending: RoleMap<bool>,
    poll_policy: RssiPollPolicy,
    echo_distances: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                biased;
                reason = self.token.signalled() => break reason,
                Some(event) = self.link_events.recv() => self.on_link_event(event),
                control = self.control.recv() => match control {
                    Some(control) => self.on_control(control),
                    None => {
                        self.token.signal(CloseReason::Requested);
                    }
                },
                Some(result) = self.polls.join_next(), if !self.polls.is_empty() => {
                    if let Ok(role) = result {
                        self.on_poll_due(role);
                    }
                }
            }
        };
        self.teardown(reason);
    }

    fn on_link_event(&mut self, LinkEvent { role, event }: LinkEvent) {
        let Some(output) = self.links[role].handle_event(event) else {
            return;
        };
        match output {
            LinkOutput::Rssi(value) => self.on_rssi(role, value),
            LinkOutput::Line(line) => {
                let _ = self.shell.send(LocatorEvent::StatusLine(line));
            }
            // The link already fired the teardown token.
            LinkOutput::Lost(cause) => debug!("{} link lost: {:?}", role, cause),
            LinkOutput::Ready => {}
        }
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Enable => {
                info!("Automatic tracking enabled");
                self.engine.enable();
                for role in BeaconRole::ALL {
                    self.schedule_poll(role);
                }
            }
            Control::Disable => {
                info!("Automatic tracking disabled");
                self.engine.disable();
            }
            Control::Drain => {
                let _ = self.links.primary.drain_mailbox();
            }
        }
    }

    fn on_rssi(&mut self, role: BeaconRole, value: i16) {
        self.poll_pending[role] = false;

        match self.engine.record(role, value, Instant::now()) {
            Ok(Some(update)) => {
                let _ = self.shell.send(LocatorEvent::Position(update));
                if self.echo_distances {
                    self.mailbox.push(
                        update.distance_left,
                        update.distance_center,
                        update.distance_right,
                    );
                    let _ = self.links.primary.drain_mailbox();
                }
            }
            Ok(None) => {}
            Err(fault) => {
                error!("Evaluation failed, closing session: {}", fault);
                self.token.signal(CloseReason::ProtocolFault(fault.to_string()));
                return;
            }
        }

        if self.engine.is_enabled() {
            self.schedule_poll(role);
        }
    }

    fn schedule_poll(&mut self, role: BeaconRole) {
        if self.poll_pending[role] {
            return;
        }
        self.poll_pending[role] = true;
        let delay = self.poll_policy.delay_for(role);
        self.polls.spawn(async move {
            tokio::time::sleep(delay).await;
            role
        });
    }

    fn on_poll_due(&mut self, role: BeaconRole) {
        if !self.engine.is_enabled() || !self.links[role].is_ready() {
            self.poll_pending[role] = false;
            return;
        }
        if let Err(e) = self.links[role].request_rssi() {
            warn!("RSSI request on {} link failed: {}", role, e);
        }
    }

    /// Close every link and cancel timers. Runs once, after the token fired.
    fn teardown(&mut self, reason: CloseReason) {
        info!("Tearing down session: {}", reason);
        self.polls.abort_all();
        self.engine.disable();
        for role in BeaconRole::ALL {
            self.links[role].close();
        }
        self.link_events.close();
        let _ = self
            .shell
            .send(LocatorEvent::ConnectionStatus(ConnectionStatus::Disconnected));
        let _ = self.shell.send(LocatorEvent::Closed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_wins() {
        let token = TeardownToken::new();
        let other = token.clone();
        assert!(token.signal(CloseReason::LinkLost(BeaconRole::Left)));
        assert!(!other.signal(CloseReason::LinkLost(BeaconRole::Right)));
        assert!(!token.signal(CloseReason::Requested));
        assert_eq!(other.reason(), Some(CloseReason::LinkLost(BeaconRole::Left)));
    }

    #[tokio::test]
    async fn test_signalled_resolves_after_signal() {
        let token = TeardownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.signalled().await })
        };
        tokio::task::yield_now().await;
        token.signal(CloseReason::Requested);
        assert_eq!(waiter.await.unwrap(), CloseReason::Requested);
        // Already-fired tokens resolve immediately.
        assert_eq!(token.signalled().await, CloseReason::Requested);
    }
}
