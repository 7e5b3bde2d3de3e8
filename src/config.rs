// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a partial or missing config.toml is fine.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::backend::command::OPAQUE_BLACK;
use crate::backend::debug::DebugMessengerConfig;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Triangle".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode, FIFO when the surface lacks it
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: OPAQUE_BLACK,
            max_frames_in_flight: 2,
        }
    }
}

/// GLSL sources, compiled at start-up unless build.rs left a `.spv` behind
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: String,
    pub fragment: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: "shaders/triangle.vert".to_string(),
            fragment: "shaders/triangle.frag".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Also forward INFO/VERBOSE driver messages
    pub verbose_driver_messages: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            verbose_driver_messages: false,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "renderer.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults on error
    ///
    /// Runs before logging exists, so the error is handed back for the
    /// caller to report once a logger is installed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Preferred present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', preferring MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Number of frame slots, at least one
    pub fn frames_in_flight(&self) -> usize {
        self.graphics.max_frames_in_flight.max(1)
    }

    /// Unparsable levels fall back to `info`
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// Messenger settings when validation should run in this build
    pub fn debug_messenger(&self) -> Option<DebugMessengerConfig> {
        if !(cfg!(debug_assertions) && self.debug.validation_layers) {
            return None;
        }
        Some(if self.debug.verbose_driver_messages {
            DebugMessengerConfig::verbose()
        } else {
            DebugMessengerConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.window.title, "Triangle");
        assert_eq!((config.window.width, config.window.height), (800, 600));
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.frames_in_flight(), 2);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.shaders.vertex, "shaders/triangle.vert");
        assert_eq!(config.debug.log_file, "renderer.log");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            present_mode = "FIFO_relaxed"

            [debug]
            log_level = "trace"
            "#,
        )
        .unwrap();

        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO_RELAXED);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.log_level(), log::LevelFilter::Trace);
        assert!(config.debug.show_fps);
    }

    #[test]
    fn frames_in_flight_never_zero() {
        let config: Config = toml::from_str("[graphics]\nmax_frames_in_flight = 0").unwrap();
        assert_eq!(config.frames_in_flight(), 1);
    }

    #[test]
    fn unknown_values_fall_back() {
        let config: Config = toml::from_str(
            "[graphics]\npresent_mode = \"vsync-ish\"\n[debug]\nlog_level = \"loud\"",
        )
        .unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn validation_off_disables_messenger() {
        let mut config = Config::default();
        config.debug.validation_layers = false;
        assert!(config.debug_messenger().is_none());
    }

    #[test]
    fn verbose_messenger_when_requested() {
        let mut config = Config::default();
        config.debug.verbose_driver_messages = true;
        if cfg!(debug_assertions) {
            assert_eq!(config.debug_messenger(), Some(DebugMessengerConfig::verbose()));
        } else {
            assert!(config.debug_messenger().is_none());
        }
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load_from_path("no/such/config.toml").unwrap();
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("renderer-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();
        assert!(Config::load_from_path(&path).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn malformed_file_hands_back_error_with_defaults() {
        let path = std::env::temp_dir().join(format!("renderer-warn-{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let (config, error) = Config::load_or_default(&path);
        assert_eq!(config.window.width, 800);
        let message = format!("{:#}", error.unwrap());
        assert!(message.contains("Failed to parse config file"));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_loads_without_error() {
        let (config, error) = Config::load_or_default("no/such/config.toml");
        assert!(error.is_none());
        assert_eq!(config.window.title, "Triangle");
    }
}
