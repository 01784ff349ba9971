//! Single-slot outbound command buffer.
//!
//! Producers (manual commands from the shell, engine echo) and the consumer
//! (the primary link's write-completion path) touch the slot from different
//! call sites, so every access goes through one mutex.

use std::sync::{Mutex, MutexGuard};

/// A 3-axis motion command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Command {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Joystick position to command. `angle` is in degrees with 0 pointing
    /// right and counting counter-clockwise; `strength` ranges 0-100 and
    /// anything below 10 is treated as centred.
    pub fn from_stick(angle: f64, strength: f64) -> Self {
        let power = if strength < 10.0 { 0.0 } else { 0.8 };
        let heading = (360.0 - (angle + 270.0).rem_euclid(360.0)).to_radians();
        Self::new(heading.sin() * power, heading.cos() * power, 0.5)
    }
}

/// Holds at most one pending [`Command`]; a newer push replaces an unsent one.
#[derive(Debug, Default)]
pub struct CommandMailbox {
    slot: Mutex<Option<Command>>,
}

impl CommandMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot with `(x, y, z)`, overwriting any command not yet taken.
    pub fn push(&self, x: f64, y: f64, z: f64) {
        *self.lock() = Some(Command::new(x, y, z));
    }

    /// Read and disarm the slot in one step.
    pub fn take(&self) -> Option<Command> {
        self.lock().take()
    }

    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Command>> {
        // The slot is plain data; a panic elsewhere cannot leave it torn.
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
