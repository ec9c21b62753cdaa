//! Configuration types for webcamize
//!
//! Defaults come from an optional `~/.config/webcamize/config.toml`,
//! overridden field-by-field by command-line flags.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Where converted frames go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputTarget {
    /// A v4l2loopback virtual video device
    #[default]
    Device,
    /// Raw frames appended to a file
    File(PathBuf),
    /// Raw frames on standard output
    Stdout,
}

impl OutputTarget {
    /// Parse the `--output` argument: `-` means stdout, anything else a path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            OutputTarget::Stdout
        } else {
            OutputTarget::File(PathBuf::from(arg))
        }
    }
}

/// Resolved configuration for one streaming run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Camera model to bind; None autodetects the first enumerated camera
    pub camera: Option<String>,
    /// Requested loopback device index; None lets the module pick
    pub device: Option<u32>,
    /// Output destination
    pub output: OutputTarget,
    /// Target frame rate
    pub fps: u32,
    /// Decode and rescale previews to YUV 4:2:0 (false writes raw payloads)
    pub convert: bool,
    /// Create the loopback device at startup instead of requiring one
    pub self_alloc: bool,
    /// Poll this many seconds for a camera to appear before giving up
    pub wait_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            camera: None,
            device: None,
            output: OutputTarget::Device,
            fps: 30,
            convert: true,
            self_alloc: true,
            wait_secs: 0,
        }
    }
}

impl StreamConfig {
    /// Pacing period corresponding to the configured frame rate
    pub fn period(&self) -> Duration {
        let fps = self.fps.max(1);
        Duration::from_micros(1_000_000 / fps as u64)
    }
}

/// On-disk configuration file; every field optional so the file can set
/// just the knobs the user cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub camera: Option<String>,
    #[serde(default)]
    pub device: Option<u32>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub convert: Option<bool>,
    #[serde(default)]
    pub self_alloc: Option<bool>,
}

impl ConfigFile {
    /// Default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("webcamize").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("webcamize")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/webcamize/config.toml")
        }
    }

    /// Load from a specific path; a missing file yields defaults.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConfigFile = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply file-level defaults underneath an already-built config.
    pub fn apply_to(&self, config: &mut StreamConfig) {
        if config.camera.is_none() {
            config.camera = self.camera.clone();
        }
        if config.device.is_none() {
            config.device = self.device;
        }
        if let Some(fps) = self.fps {
            if config.fps == StreamConfig::default().fps {
                config.fps = fps;
            }
        }
        if let Some(convert) = self.convert {
            if config.convert == StreamConfig::default().convert {
                config.convert = convert;
            }
        }
        if let Some(self_alloc) = self.self_alloc {
            if config.self_alloc == StreamConfig::default().self_alloc {
                config.self_alloc = self_alloc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_from_fps() {
        let config = StreamConfig { fps: 25, ..Default::default() };
        assert_eq!(config.period(), Duration::from_millis(40));

        // fps 0 is clamped, never a division by zero
        let config = StreamConfig { fps: 0, ..Default::default() };
        assert_eq!(config.period(), Duration::from_secs(1));
    }

    #[test]
    fn output_target_from_arg() {
        assert_eq!(OutputTarget::from_arg("-"), OutputTarget::Stdout);
        assert_eq!(
            OutputTarget::from_arg("/tmp/frames.raw"),
            OutputTarget::File(PathBuf::from("/tmp/frames.raw"))
        );
    }

    #[test]
    fn config_file_parses_partial() {
        let file: ConfigFile = toml::from_str("camera = \"Canon EOS R6\"\nfps = 24\n").unwrap();
        assert_eq!(file.camera.as_deref(), Some("Canon EOS R6"));
        assert_eq!(file.fps, Some(24));
        assert!(file.device.is_none());

        let mut config = StreamConfig::default();
        file.apply_to(&mut config);
        assert_eq!(config.camera.as_deref(), Some("Canon EOS R6"));
        assert_eq!(config.fps, 24);
    }

    #[test]
    fn cli_values_win_over_file() {
        let file: ConfigFile = toml::from_str("camera = \"File Camera\"\n").unwrap();
        let mut config = StreamConfig {
            camera: Some("CLI Camera".into()),
            ..Default::default()
        };
        file.apply_to(&mut config);
        assert_eq!(config.camera.as_deref(), Some("CLI Camera"));
    }

    #[test]
    fn missing_config_file_is_defaults() {
        let file = ConfigFile::load_from(std::path::Path::new("/nonexistent/webcamize.toml")).unwrap();
        assert!(file.camera.is_none());
        assert!(file.fps.is_none());
    }
}
