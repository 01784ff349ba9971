//! Primary Unit Protocol
//!
//! GATT identifiers, the text handshake, and the binary motion command
//! spoken over the primary unit's serial characteristic.

use crate::domain::mailbox::Command;
use crate::domain::settings::BleSettings;
use anyhow::Result;

/// Serial service exposed by the primary unit
pub const SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";

/// Read/write/notify characteristic inside [`SERVICE_UUID`]
pub const CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// Client Characteristic Configuration descriptor (notification enable)
pub const DESCRIPTOR_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// Handshake requests, sent in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRequest {
    /// Liveness check; the reply content is ignored
    Ack,
    /// Ask for the left beacon's advertised name
    LeftName,
    /// Ask for the right beacon's advertised name
    RightName,
}

impl HandshakeRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "OK",
            Self::LeftName => "GL",
            Self::RightName => "GR",
        }
    }
}

/// Standard handshake sequence
pub const HANDSHAKE_SEQUENCE: [HandshakeRequest; 3] = [
    HandshakeRequest::Ack,
    HandshakeRequest::LeftName,
    HandshakeRequest::RightName,
];

/// Service/characteristic/descriptor the primary link subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattTarget {
    pub service: String,
    pub characteristic: String,
    pub descriptor: String,
}

impl Default for GattTarget {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID.to_string(),
            characteristic: CHARACTERISTIC_UUID.to_string(),
            descriptor: DESCRIPTOR_UUID.to_string(),
        }
    }
}

impl From<&BleSettings> for GattTarget {
    fn from(s: &BleSettings) -> Self {
        Self {
            service: s.service_uuid.clone(),
            characteristic: s.characteristic_uuid.clone(),
            descriptor: s.descriptor_uuid.clone(),
        }
    }
}

/// Compare two UUID strings ignoring case and dashes
pub fn uuid_eq(a: &str, b: &str) -> bool {
    let strip = |s: &str| {
        s.chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect::<String>()
    };
    strip(a) == strip(b)
}

/// Encoded motion command length
pub const COMMAND_LEN: usize = 8;

/// Encode a command as the 8-byte `CX` frame
///
/// # Frame Structure (8 bytes, little-endian)
///
/// ```text
/// [0]   : 'C'
/// [1]   : 'X'
/// [2-3] : x * 1000 (i16)
/// [4-5] : y * 1000 (i16)
/// [6-7] : z * 1000 (i16)
/// ```
///
/// Values are truncated toward zero, saturated to the i32 range, then
/// wrapped into 16 bits.
pub fn encode_command(command: &Command) -> [u8; COMMAND_LEN] {
    let mut frame = [0u8; COMMAND_LEN];
    frame[0] = b'C';
    frame[1] = b'X';
    for (i, value) in [command.x, command.y, command.z].into_iter().enumerate() {
        let fixed = fixed_point(value);
        frame[2 + i * 2..4 + i * 2].copy_from_slice(&fixed.to_le_bytes());
    }
    frame
}

fn fixed_point(value: f64) -> i16 {
    (value * 1000.0) as i32 as i16
}

/// Decode a `CX` frame back into its three fixed-point fields
pub fn decode_command(bytes: &[u8]) -> Result<[i16; 3]> {
    if bytes.len() != COMMAND_LEN {
        return Err(anyhow::anyhow!("Invalid command size: {}", bytes.len()));
    }
    if bytes[0] != b'C' || bytes[1] != b'X' {
        return Err(anyhow::anyhow!(
            "Invalid command tag: {:02X} {:02X}",
            bytes[0],
            bytes[1]
        ));
    }
    Ok([
        i16::from_le_bytes([bytes[2], bytes[3]]),
        i16::from_le_bytes([bytes[4], bytes[5]]),
        i16::from_le_bytes([bytes[6], bytes[7]]),
    ])
}

/// Decode a notification payload as one text line
///
/// Returns `None` for payloads that are not UTF-8.
pub fn decode_line(payload: &[u8]) -> Option<String> {
    std::str::from_utf8(payload)
        .ok()
        .map(|s| s.trim_end_matches(['\r', '\n', '\0']).trim().to_string())
}
