use crate::domain::models::{BeaconRole, RoleMap};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "beacon_locator".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Calibration of the left/right beacon triangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Forward offset of the secondary baseline (`a`).
    #[serde(default = "default_forward_offset")]
    pub forward_offset: f64,
    /// Half the distance between the left and right beacons (`b`).
    #[serde(default = "default_half_baseline")]
    pub half_baseline: f64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            forward_offset: default_forward_offset(),
            half_baseline: default_half_baseline(),
        }
    }
}

fn default_forward_offset() -> f64 {
    0.20
}
fn default_half_baseline() -> f64 {
    0.306 / 2.0
}

/// Reference power (RSSI at one distance unit) per beacon role.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    #[serde(default = "default_primary_power")]
    pub primary: i16,
    #[serde(default = "default_secondary_power")]
    pub left: i16,
    #[serde(default = "default_secondary_power")]
    pub right: i16,
    /// Prefer the TX power carried in the advertisement when there is one.
    #[serde(default = "default_false")]
    pub use_advertised_power: bool,
}

impl CalibrationSettings {
    pub fn configured(&self) -> RoleMap<i16> {
        RoleMap::new(self.primary, self.left, self.right)
    }

    /// Pick the reference power for `role`, given what the scan advertised.
    pub fn resolve(&self, role: BeaconRole, advertised: Option<i16>) -> i16 {
        match advertised {
            Some(power) if self.use_advertised_power => power,
            _ => self.configured()[role],
        }
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            primary: default_primary_power(),
            left: default_secondary_power(),
            right: default_secondary_power(),
            use_advertised_power: false,
        }
    }
}

fn default_primary_power() -> i16 {
    -52
}
fn default_secondary_power() -> i16 {
    -60
}

/// How long a link waits before re-reading RSSI after a read completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RssiPollPolicy {
    /// Same short delay for every role.
    Fixed { delay_ms: u64 },
    /// Separate rate per role.
    PerRole {
        primary_ms: u64,
        left_ms: u64,
        right_ms: u64,
    },
}

impl RssiPollPolicy {
    pub fn delay_for(&self, role: BeaconRole) -> Duration {
        let ms = match *self {
            RssiPollPolicy::Fixed { delay_ms } => delay_ms,
            RssiPollPolicy::PerRole {
                primary_ms,
                left_ms,
                right_ms,
            } => RoleMap::new(primary_ms, left_ms, right_ms)[role],
        };
        Duration::from_millis(ms)
    }
}

impl Default for RssiPollPolicy {
    fn default() -> Self {
        RssiPollPolicy::Fixed { delay_ms: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorSettings {
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,
    #[serde(default = "default_filter_window_ms")]
    pub filter_window_ms: u64,
    #[serde(default = "default_filter_capacity")]
    pub filter_capacity: usize,
    #[serde(default)]
    pub geometry: Geometry,
    #[serde(default)]
    pub calibration: CalibrationSettings,
    #[serde(default)]
    pub rssi_poll: RssiPollPolicy,
    /// Send the smoothed distances back to the unit as a command after each evaluation.
    #[serde(default = "default_false")]
    pub echo_distances: bool,
}

impl LocatorSettings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn filter_window(&self) -> Duration {
        Duration::from_millis(self.filter_window_ms)
    }
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            evaluation_interval_ms: default_evaluation_interval_ms(),
            filter_window_ms: default_filter_window_ms(),
            filter_capacity: default_filter_capacity(),
            geometry: Geometry::default(),
            calibration: CalibrationSettings::default(),
            rssi_poll: RssiPollPolicy::default(),
            echo_distances: false,
        }
    }
}

fn default_scan_timeout_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_evaluation_interval_ms() -> u64 {
    50
}
fn default_filter_window_ms() -> u64 {
    150
}
fn default_filter_capacity() -> usize {
    256
}

/// GATT identifiers of the primary unit's serial service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,
    #[serde(default = "default_descriptor_uuid")]
    pub descriptor_uuid: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            descriptor_uuid: default_descriptor_uuid(),
        }
    }
}

fn default_service_uuid() -> String {
    "0000ffe0-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_characteristic_uuid() -> String {
    "0000ffe1-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_descriptor_uuid() -> String {
    "00002902-0000-1000-8000-00805f9b34fb".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Tracking Settings
    #[serde(default)]
    pub locator: LocatorSettings,

    // Advanced BLE Settings
    #[serde(default)]
    pub ble: BleSettings,

    /// Primary beacon name used on the previous run.
    #[serde(default)]
    pub last_primary_name: Option<String>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from `path`, falling back to defaults when it is missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BeaconLocator");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_primary(&mut self, name: &str) -> anyhow::Result<()> {
        if self.settings.last_primary_name.as_deref() != Some(name) {
            self.settings.last_primary_name = Some(name.to_string());
            self.save()?;
        }
        Ok(())
    }
}
