use crate::domain::commands::CommandKind;
use crate::domain::models::PeripheralId;
use crate::infrastructure::bluetooth::transport::WriteMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
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
    #[serde(default = "default_false")]
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
            show_file_line: default_false(),
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
    "sphero_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Write mode used for each kind of command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySettings {
    #[serde(default = "default_unacknowledged")]
    pub motion: WriteMode,
    #[serde(default = "default_unacknowledged")]
    pub lighting: WriteMode,
    #[serde(default = "default_acknowledged")]
    pub system: WriteMode,
}

impl DeliverySettings {
    pub fn mode_for(&self, kind: CommandKind) -> WriteMode {
        match kind {
            CommandKind::Motion => self.motion,
            CommandKind::Lighting => self.lighting,
            CommandKind::System => self.system,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            motion: default_unacknowledged(),
            lighting: default_unacknowledged(),
            system: default_acknowledged(),
        }
    }
}

fn default_unacknowledged() -> WriteMode {
    WriteMode::WithoutResponse
}
fn default_acknowledged() -> WriteMode {
    WriteMode::WithResponse
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Timing
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,

    #[serde(default)]
    pub delivery: DeliverySettings,

    // Advanced BLE Settings
    /// Services a peripheral must advertise to be reported; empty reports all
    #[serde(default)]
    pub scan_service_filter: Vec<Uuid>,

    #[serde(default)]
    pub known_peripherals: Vec<PeripheralId>,
    #[serde(default)]
    pub last_connected: Option<PeripheralId>,
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            scan_timeout_ms: default_scan_timeout_ms(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            delivery: DeliverySettings::default(),
            scan_service_filter: Vec::new(),
            known_peripherals: Vec::new(),
            last_connected: None,
        }
    }
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_disconnect_grace_ms() -> u64 {
    1_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Loads from `path`, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("SpheroController");
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

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Records a successful connection and persists it.
    pub fn remember_peripheral(&mut self, id: PeripheralId) -> anyhow::Result<()> {
        if !self.settings.known_peripherals.contains(&id) {
            self.settings.known_peripherals.push(id);
        }
        self.settings.last_connected = Some(id);
        self.save()
    }
}
