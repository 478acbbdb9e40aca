// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults field by field, so a config file only
// needs the keys it wants to change.

use anyhow::{Context, Result};
use glam::Vec4;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_PATH: &str = "config.toml";

/// Where the loaded settings came from. Reported once logging is up, since
/// the log level itself is part of the config.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid(anyhow::Error),
}

impl ConfigSource {
    pub fn report(&self) {
        match self {
            ConfigSource::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            ConfigSource::Invalid(e) => log::warn!("{:#}. Using defaults.", e),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Wyvern".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub max_frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    /// Base path of the object shader stages, empty disables it
    pub shader: String,
    pub wireframe: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            clear_color: [0.0, 0.0, 0.2, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            shader: "shaders/object".to_string(),
            wireframe: false,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults if it is missing or invalid
    pub fn load() -> (Self, ConfigSource) {
        Self::load_with_source(CONFIG_PATH)
    }

    pub fn load_with_source<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();
        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path.to_path_buf()));
        }

        match Self::load_from_path(path) {
            Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Invalid(e)),
        }
    }

    /// Load configuration from a specific path. A missing file gives defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Number of frame-in-flight slots, never less than one
    pub fn frames_in_flight(&self) -> usize {
        self.graphics.max_frames_in_flight.max(1)
    }

    pub fn clear_color(&self) -> Vec4 {
        Vec4::from_array(self.graphics.clear_color)
    }

    pub fn shader_base(&self) -> Option<&str> {
        let base = self.graphics.shader.trim();
        (!base.is_empty()).then_some(base)
    }

    /// Validation layers only in debug builds
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    /// The configured level, or `None` if `log_level` is not a level name
    pub fn log_level(&self) -> Option<log::LevelFilter> {
        self.debug.log_level.parse().ok()
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level().unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("config.toml")).unwrap();

        assert_eq!(config.window.width, 1280);
        assert_eq!(config.frames_in_flight(), 2);
        assert_eq!(config.graphics.clear_depth, 1.0);
        assert_eq!(config.shader_base(), Some("shaders/object"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"
            [window]
            title = "Demo"

            [graphics]
            max_frames_in_flight = 3
            clear_color = [1.0, 0.5, 0.25, 1.0]
            "#,
        );
        let config = Config::load_from_path(file.path()).unwrap();

        assert_eq!(config.window.title, "Demo");
        assert_eq!(config.window.height, 720);
        assert_eq!(config.frames_in_flight(), 3);
        assert_eq!(config.clear_color(), Vec4::new(1.0, 0.5, 0.25, 1.0));
        assert_eq!(config.graphics.clear_stencil, 0);
        assert!(config.debug.show_fps);
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        let file = write_config("[graphics]\nmax_frames_in_flight = 0\n");
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.frames_in_flight(), 1);
    }

    #[test]
    fn empty_shader_disables_object_shader() {
        let file = write_config("[graphics]\nshader = \"\"\n");
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.shader_base(), None);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let file = write_config("[graphics\nwireframe = yes");
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn log_level_parses_with_fallback() {
        let mut config = Config::default();
        config.debug.log_level = "debug".to_string();
        assert_eq!(config.log_filter(), log::LevelFilter::Debug);

        config.debug.log_level = "loud".to_string();
        assert_eq!(config.log_level(), None);
        assert_eq!(config.log_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn load_reports_where_settings_came_from() {
        let dir = tempfile::tempdir().unwrap();
        let (config, source) = Config::load_with_source(dir.path().join("config.toml"));
        assert!(matches!(source, ConfigSource::Missing(_)));
        assert_eq!(config.window.width, 1280);

        let file = write_config("[window]\nwidth = 640\n");
        let (config, source) = Config::load_with_source(file.path());
        assert!(matches!(source, ConfigSource::File(ref p) if p == file.path()));
        assert_eq!(config.window.width, 640);

        // A broken file falls back to defaults and keeps the parse error for later
        let broken = write_config("[window\nwidth = 640");
        let (config, source) = Config::load_with_source(broken.path());
        assert_eq!(config.window.width, 1280);
        match source {
            ConfigSource::Invalid(e) => assert!(format!("{:#}", e).contains("Failed to parse")),
            other => panic!("expected invalid source, got {:?}", other),
        }
    }
}
