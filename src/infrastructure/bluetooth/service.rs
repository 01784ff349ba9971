//! Beacon Locator Service
//!
//! Public entry point: runs discovery and, on success, hands the links to a
//! new session.

use crate::domain::models::{ConnectionStatus, LocatorEvent, MessageSeverity, StatusMessage};
use crate::domain::settings::{LocatorSettings, Settings};
use crate::error::LocatorError;
use crate::infrastructure::bluetooth::discovery::DiscoveryCoordinator;
use crate::infrastructure::bluetooth::protocol::GattTarget;
use crate::infrastructure::bluetooth::radio::Radio;
use crate::infrastructure::bluetooth::session::{self, SessionHandle};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct BeaconLocator {
    radio: Arc<dyn Radio>,
    settings: LocatorSettings,
    target: GattTarget,
    runtime: Handle,
}

impl BeaconLocator {
    /// Create a locator whose sessions run on `runtime`.
    pub fn new(radio: Arc<dyn Radio>, settings: &Settings, runtime: Handle) -> Self {
        Self {
            radio,
            settings: settings.locator.clone(),
            target: GattTarget::from(&settings.ble),
            runtime,
        }
    }

    /// Discover and connect the primary unit named `name` and its two beacons.
    ///
    /// Events for the resulting session (and progress messages during
    /// discovery) are sent to `events`.
    pub async fn begin_discovery(
        &self,
        name: &str,
        events: mpsc::UnboundedSender<LocatorEvent>,
    ) -> Result<SessionHandle, LocatorError> {
        info!("Starting discovery for {}", name);
        let _ = events.send(LocatorEvent::ConnectionStatus(ConnectionStatus::Connecting));

        let coordinator =
            DiscoveryCoordinator::new(self.radio.clone(), &self.settings, &self.target, events.clone());
        match coordinator.run(name).await {
            Ok(discovered) => Ok(session::activate(
                discovered,
                &self.settings,
                events,
                &self.runtime,
            )),
            Err(e) => {
                error!("Discovery for {} failed: {}", name, e);
                let _ = events.send(LocatorEvent::LogMessage(StatusMessage {
                    message: format!("Connection failed: {}", e),
                    severity: MessageSeverity::Error,
                }));
                let _ = events.send(LocatorEvent::ConnectionStatus(ConnectionStatus::Disconnected));
                Err(e)
            }
        }
    }
}
