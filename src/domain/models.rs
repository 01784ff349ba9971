use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// One of the three radios taking part in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconRole {
    /// Mounted on the tracked unit; carries the text and command channel.
    Primary,
    Left,
    Right,
}

impl BeaconRole {
    pub const ALL: [BeaconRole; 3] = [BeaconRole::Primary, BeaconRole::Left, BeaconRole::Right];

    pub fn is_primary(self) -> bool {
        self == BeaconRole::Primary
    }
}

impl fmt::Display for BeaconRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BeaconRole::Primary => "primary",
            BeaconRole::Left => "left",
            BeaconRole::Right => "right",
        };
        f.write_str(name)
    }
}

/// Fixed-size map keyed by [`BeaconRole`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleMap<T> {
    pub primary: T,
    pub left: T,
    pub right: T,
}

impl<T> RoleMap<T> {
    pub fn new(primary: T, left: T, right: T) -> Self {
        Self {
            primary,
            left,
            right,
        }
    }

    pub fn from_fn(mut f: impl FnMut(BeaconRole) -> T) -> Self {
        Self {
            primary: f(BeaconRole::Primary),
            left: f(BeaconRole::Left),
            right: f(BeaconRole::Right),
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> RoleMap<U> {
        RoleMap {
            primary: f(self.primary),
            left: f(self.left),
            right: f(self.right),
        }
    }
}

impl<T> Index<BeaconRole> for RoleMap<T> {
    type Output = T;

    fn index(&self, role: BeaconRole) -> &T {
        match role {
            BeaconRole::Primary => &self.primary,
            BeaconRole::Left => &self.left,
            BeaconRole::Right => &self.right,
        }
    }
}

impl<T> IndexMut<BeaconRole> for RoleMap<T> {
    fn index_mut(&mut self, role: BeaconRole) -> &mut T {
        match role {
            BeaconRole::Primary => &mut self.primary,
            BeaconRole::Left => &mut self.left,
            BeaconRole::Right => &mut self.right,
        }
    }
}

/// Position estimate plus the smoothed relative distances it was computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionUpdate {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub distance_left: f64,
    pub distance_center: f64,
    pub distance_right: f64,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// The operator (or the owning shell) closed the session.
    Requested,
    LinkLost(BeaconRole),
    /// Evaluation went non-finite or a radio request failed.
    ProtocolFault(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed by request"),
            CloseReason::LinkLost(role) => write!(f, "{} link lost", role),
            CloseReason::ProtocolFault(detail) => write!(f, "protocol fault: {}", detail),
        }
    }
}

/// Events delivered to the shell.
#[derive(Debug, Clone, PartialEq)]
pub enum LocatorEvent {
    Position(PositionUpdate),
    /// Text the primary unit sent after the handshake.
    StatusLine(String),
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
    /// Emitted exactly once per session.
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_map_indexing() {
        let mut map = RoleMap::from_fn(|role| role.to_string());
        assert_eq!(map[BeaconRole::Left], "left");
        map[BeaconRole::Right].push('!');
        assert_eq!(map.right, "right!");
        assert_eq!(map.map(|s| s.len()).primary, 7);
    }
}
