use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::warn;
use repeater_core::RepeaterConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// What a DTMF command code does.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "action", content = "text", rename_all = "snake_case")]
pub enum CommandAction {
    /// Announce UTC time.
    Time,
    /// Announce the station callsign.
    StationId,
    /// Send a fixed message.
    Message(String),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyLineKind {
    /// No hardware keying; the radio keys on its own VOX.
    #[default]
    None,
    /// Run an external program for key on / key off.
    Command,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct KeyLineConfig {
    #[serde(default)]
    pub kind: KeyLineKind,
    /// Program and arguments run to key the transmitter.
    #[serde(default)]
    pub key_on: Vec<String>,
    /// Program and arguments run to unkey the transmitter.
    #[serde(default)]
    pub key_off: Vec<String>,
}

/// Saving of record-and-replay recordings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct RecordingsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Target directory; the platform data directory when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl RecordingsConfig {
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir.clone().or_else(|| {
            ProjectDirs::from("org", "softrepeater", "softrepeater")
                .map(|dirs| dirs.data_dir().join("recordings"))
        })
    }
}

/// Application configuration, persisted as JSON.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_device")]
    pub input_device: String,
    #[serde(default = "default_device")]
    pub output_device: String,
    #[serde(default = "default_callsign")]
    pub callsign: String,
    #[serde(default = "default_morse_wpm")]
    pub morse_wpm: u32,
    #[serde(default = "default_morse_tone_hz")]
    pub morse_tone_hz: f32,
    #[serde(default = "default_morse_volume")]
    pub morse_volume: f32,
    #[serde(default)]
    pub key_line: KeyLineConfig,
    #[serde(default = "default_commands")]
    pub commands: BTreeMap<String, CommandAction>,
    #[serde(default)]
    pub recordings: RecordingsConfig,
    #[serde(default)]
    pub repeater: RepeaterConfig,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_callsign() -> String {
    "N0CALL".to_string()
}

fn default_morse_wpm() -> u32 {
    20
}

fn default_morse_tone_hz() -> f32 {
    800.0
}

fn default_morse_volume() -> f32 {
    0.5
}

fn default_commands() -> BTreeMap<String, CommandAction> {
    let mut commands = BTreeMap::new();
    commands.insert("0000".to_string(), CommandAction::StationId);
    commands.insert("0002".to_string(), CommandAction::Time);
    for n in 1..=8 {
        commands.insert(
            format!("{:04}", n + 2),
            CommandAction::Message(format!("Custom message {}", n)),
        );
    }
    commands
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_device: default_device(),
            output_device: default_device(),
            callsign: default_callsign(),
            morse_wpm: default_morse_wpm(),
            morse_tone_hz: default_morse_tone_hz(),
            morse_volume: default_morse_volume(),
            key_line: KeyLineConfig::default(),
            commands: default_commands(),
            recordings: RecordingsConfig::default(),
            repeater: RepeaterConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path` (or the platform default), falling
    /// back to defaults when the file is missing or invalid.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path.map(Path::to_path_buf).or_else(config_path) else {
            return Self::default();
        };
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("Ignoring invalid config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Saves configuration in JSON format.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(config_path)
            .context("No configuration directory available")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "softrepeater", "softrepeater")
        .map(|dirs| dirs.config_dir().join("config.json"))
}
