// Configuration management for Hindsight

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tauri::{AppHandle, Manager};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the rotating segment files
    pub buffer_path: PathBuf,

    /// Directory where exported clips are written
    pub export_path: PathBuf,

    /// Nominal segment length in seconds
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u32,

    /// Maximum total buffered duration in seconds
    #[serde(default = "default_max_buffer_secs")]
    pub max_buffer_secs: u32,

    /// Capture frame rate
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Capture quality preset
    #[serde(default)]
    pub quality: QualityPreset,

    /// Whether to also capture system audio alongside video
    #[serde(default)]
    pub capture_audio: bool,

    /// Whether the adaptive frame-rate controller is enabled
    #[serde(default = "default_true")]
    pub adaptive_frame_rate: bool,

    /// Seconds without user input before the adaptive controller
    /// starts checking for a static screen
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u32,

    /// Frame rate used while the screen is confirmed static
    #[serde(default = "default_idle_frame_rate")]
    pub idle_frame_rate: u32,

    /// Whether to show a notification when an export completes
    #[serde(default = "default_true")]
    pub notify_export_complete: bool,

    /// Whether to show a notification on capture errors
    #[serde(default = "default_true")]
    pub notify_capture_error: bool,
}

/// Capture quality preset, mapped to an encoder bitrate when the
/// capture pipeline is built
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
}

impl QualityPreset {
    /// Target video bitrate in kbit/s for this preset
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            QualityPreset::Low => 2_000,
            QualityPreset::Medium => 5_000,
            QualityPreset::High => 10_000,
        }
    }
}

impl Default for QualityPreset {
    fn default() -> Self {
        Self::Medium
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_path: get_default_buffer_path(),
            export_path: get_default_export_path(),
            segment_secs: default_segment_secs(),
            max_buffer_secs: default_max_buffer_secs(),
            frame_rate: default_frame_rate(),
            quality: QualityPreset::default(),
            capture_audio: false,
            adaptive_frame_rate: true,
            idle_threshold_secs: default_idle_threshold_secs(),
            idle_frame_rate: default_idle_frame_rate(),
            notify_export_complete: true,
            notify_capture_error: true,
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(app_handle: &AppHandle) -> Self {
        let config_path = get_config_path(app_handle);

        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, app_handle: &AppHandle) -> anyhow::Result<()> {
        let config_path = get_config_path(app_handle);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, contents)?;

        Ok(())
    }
}

/// Get the default directory for rotating segment files
fn get_default_buffer_path() -> PathBuf {
    dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Hindsight")
        .join("buffer")
}

/// Get the default directory for exported clips
fn get_default_export_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Hindsight")
}

/// Get the config file path
fn get_config_path(app_handle: &AppHandle) -> PathBuf {
    app_handle
        .path()
        .app_config_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.toml")
}

fn default_segment_secs() -> u32 {
    60
}

fn default_max_buffer_secs() -> u32 {
    900
}

fn default_frame_rate() -> u32 {
    30
}

fn default_idle_threshold_secs() -> u32 {
    120
}

fn default_idle_frame_rate() -> u32 {
    5
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}
