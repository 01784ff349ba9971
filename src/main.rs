use anyhow::{anyhow, Context};
use beacon_locator::domain::mailbox::Command;
use beacon_locator::domain::models::{LocatorEvent, MessageSeverity};
use beacon_locator::infrastructure::logging;
use beacon_locator::{
    BeaconLocator, LocatorError, Radio, SessionHandle, Settings, SettingsService,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// One line of operator input.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Operator {
    Auto,
    Manual,
    Cmd(f64, f64, f64),
    Stick(f64, f64),
    Quit,
}

impl Operator {
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args = words
            .map(|w| w.parse::<f64>().map_err(|_| format!("not a number: {}", w)))
            .collect::<Result<Vec<_>, _>>()?;
        let op = match (verb, args.as_slice()) {
            ("auto", []) => Self::Auto,
            ("manual", []) => Self::Manual,
            ("cmd", [x, y, z]) => Self::Cmd(*x, *y, *z),
            ("stick", [angle, strength]) => Self::Stick(*angle, *strength),
            ("quit" | "exit", []) => Self::Quit,
            _ => {
                return Err(format!(
                    "unknown command {:?} (auto | manual | cmd x y z | stick angle strength | quit)",
                    line.trim()
                ))
            }
        };
        Ok(Some(op))
    }
}

#[cfg(windows)]
async fn platform_radio(settings: &Settings) -> Result<Arc<dyn Radio>, LocatorError> {
    use beacon_locator::infrastructure::bluetooth::winrt::WinRtRadio;
    let max_age = settings.locator.filter_window();
    Ok(Arc::new(WinRtRadio::new(Handle::current(), max_age).await))
}

#[cfg(not(windows))]
async fn platform_radio(_settings: &Settings) -> Result<Arc<dyn Radio>, LocatorError> {
    Err(LocatorError::AdapterUnavailable(
        beacon_locator::AdapterFault::NoBleService,
    ))
}

/// Print an event; returns `true` once the session has closed.
fn report(event: LocatorEvent) -> bool {
    match event {
        LocatorEvent::Position(p) => {
            println!(
                "x={:.6} y={:.6} left={:.6} center={:.6} right={:.6}",
                p.x, p.y, p.distance_left, p.distance_center, p.distance_right
            );
        }
        LocatorEvent::StatusLine(line) => println!("< {}", line),
        LocatorEvent::ConnectionStatus(status) => info!("Connection status: {:?}", status),
        LocatorEvent::LogMessage(msg) => match msg.severity {
            MessageSeverity::Error => error!("{}", msg.message),
            MessageSeverity::Warning => warn!("{}", msg.message),
            _ => info!("{}", msg.message),
        },
        LocatorEvent::Closed(reason) => {
            println!("Session closed: {}", reason);
            return true;
        }
    }
    false
}

fn apply(session: &SessionHandle, op: Operator) -> Result<(), LocatorError> {
    match op {
        Operator::Auto => session.enable(),
        Operator::Manual => session.disable(),
        Operator::Cmd(x, y, z) => session.command(x, y, z),
        Operator::Stick(angle, strength) => {
            let c = Command::from_stick(angle, strength);
            session.command(c.x, c.y, c.z)
        }
        Operator::Quit => {
            session.close();
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new().context("Failed to load settings")?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    let name = std::env::args()
        .nth(1)
        .or_else(|| settings_service.get().last_primary_name.clone())
        .ok_or_else(|| anyhow!("usage: beacon-locator <primary-name>"))?;

    info!("Starting Beacon Locator for {}", name);
    let radio = platform_radio(settings_service.get()).await?;
    let locator = BeaconLocator::new(radio, settings_service.get(), Handle::current());

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let discovery = locator.begin_discovery(&name, events_tx);
    tokio::pin!(discovery);
    let session = loop {
        tokio::select! {
            result = &mut discovery => match result {
                Ok(session) => break session,
                Err(e) => {
                    while let Ok(event) = events.try_recv() {
                        report(event);
                    }
                    let context = format!("Discovery of {} failed ({})", name, e.code());
                    return Err(anyhow!(e).context(context));
                }
            },
            Some(event) = events.recv() => {
                report(event);
            }
        }
    };

    if let Err(e) = settings_service.remember_primary(&name) {
        warn!("Failed to save settings: {}", e);
    }
    let names = session.beacons();
    println!(
        "Connected to {} (left {}, right {}). Type 'auto' to start tracking.",
        names.primary, names.left, names.right
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if report(event) {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match Operator::parse(&line) {
                    Ok(Some(op)) => {
                        if let Err(e) = apply(&session, op) {
                            eprintln!("{} ({})", e, e.code());
                        }
                    }
                    Ok(None) => {}
                    Err(message) => eprintln!("{}", message),
                },
                Ok(None) => {
                    stdin_open = false;
                    session.close();
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                    session.close();
                }
            },
        }
    }

    session.closed().await;
    Ok(())
}
