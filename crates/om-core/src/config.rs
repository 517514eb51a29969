//! Configuration system for the oxidized-mre runtime

use crate::error::EmulatorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub memory: MemoryConfig,
    pub apps: AppsConfig,
    pub audio: AudioConfig,
    pub limits: LimitsConfig,
    pub drives: DrivesConfig,
    pub dispatcher: DispatcherConfig,
    pub debug: DebugConfig,
}

/// Guest memory arena settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total arena capacity shared by all resident apps
    pub arena_size: u32,
    /// Heap reserved after the image when the app does not declare one
    pub default_heap_size: u32,
}

/// Guest application locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsConfig {
    /// Directory holding apps bundled with the runtime ("local" launches)
    pub system_dir: PathBuf,
    /// Directory user-supplied relative paths are resolved against
    pub user_dir: PathBuf,
}

/// Audio channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Maximum simultaneously open audio handles per app
    pub max_channels: usize,
}

/// Per-app handle limits for the other resource families
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_files: usize,
    pub max_sockets: usize,
}

/// Guest drive letter to host directory mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivesConfig {
    pub roots: BTreeMap<String, PathBuf>,
}

/// Event dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Sleep between idle loop iterations
    pub tick_ms: u64,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn data_base() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("oxidized-mre")
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_size: 128 * 1024 * 1024,
            default_heap_size: 1024 * 1024,
        }
    }
}

impl Default for AppsConfig {
    fn default() -> Self {
        let base = data_base();
        Self {
            system_dir: base.join("system_apps"),
            user_dir: base.join("apps"),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { max_channels: 16 }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_files: 32,
            max_sockets: 8,
        }
    }
}

impl Default for DrivesConfig {
    fn default() -> Self {
        let base = data_base();
        let mut roots = BTreeMap::new();
        roots.insert("C".to_string(), base.join("drive_c"));
        roots.insert("E".to_string(), base.join("drive_e"));
        Self { roots }
    }
}

impl DrivesConfig {
    /// Host directory backing a guest drive letter (case-insensitive)
    pub fn root_for(&self, letter: char) -> Option<&Path> {
        let key = letter.to_ascii_uppercase().to_string();
        self.roots.get(&key).map(PathBuf::as_path)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { tick_ms: 16 }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("oxidized-mre.log"),
        }
    }
}

impl Config {
    /// Load configuration from the default location, or create it if missing
    pub fn load() -> Result<Self, EmulatorError> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, EmulatorError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EmulatorError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), EmulatorError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<(), EmulatorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| EmulatorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-mre")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.memory.arena_size, 128 * 1024 * 1024);
        assert_eq!(config.audio.max_channels, 16);
        assert_eq!(config.limits.max_sockets, 8);
        assert!(config.drives.root_for('e').is_some());
        assert!(config.drives.root_for('Z').is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.memory.arena_size, config.memory.arena_size);
        assert_eq!(parsed.drives.roots, config.drives.roots);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[memory]\narena_size = 4096\n").unwrap();
        assert_eq!(parsed.memory.arena_size, 4096);
        assert_eq!(parsed.memory.default_heap_size, 1024 * 1024);
        assert_eq!(parsed.dispatcher.tick_ms, 16);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.debug.log_level = LogLevel::Trace;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.debug.log_level, LogLevel::Trace);
    }

    #[test]
    fn test_invalid_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "memory = 5").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, EmulatorError::Config(msg) if msg.contains("config.toml")));
    }
}
