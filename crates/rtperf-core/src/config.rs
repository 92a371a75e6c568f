//! Configuration file support for rtperf
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/rtperf/config.toml`
//! - macOS: `~/Library/Application Support/rtperf/config.toml`
//! - Windows: `%APPDATA%\rtperf\config.toml`

use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default MIDI ring capacity, in events.
pub const DEFAULT_MIDI_CAPACITY: usize = 1024;
/// Default upper bound on channels per audio direction.
pub const DEFAULT_MAX_CHANNELS: usize = 32;
/// Default upper bound on frames per hardware buffer.
pub const DEFAULT_MAX_HARDWARE_BUFFER_SIZE: usize = 16384;
/// Default bound on the deadlock-avoidance wait before a guarded call.
pub const DEFAULT_CALL_WAIT_TIMEOUT_MS: u64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared buffer sizing
    pub buffers: BufferSettings,
    /// Control-thread behaviour
    pub control: ControlSettings,
    /// Defaults for the reference engine
    pub engine: EngineSettings,
    /// Software render coordinator
    pub render: RenderSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        Self::load_existing(&Self::config_path()?)
    }

    fn load_existing(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Err(Error::ConfigNotFound(path.to_path_buf()))
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::config_path() {
            Ok(path) => Self::load_or_default_from(&path),
            Err(e) => {
                log::warn!("{}", e);
                Self::default()
            }
        }
    }

    /// Load `path`, falling back to defaults when it is missing. A file that
    /// exists but cannot be used is reported before falling back.
    pub fn load_or_default_from(path: &Path) -> Self {
        match Self::load_existing(path) {
            Ok(config) => config,
            Err(Error::ConfigNotFound(_)) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "rtperf") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = r#"# rtperf configuration file

[buffers]
# MIDI ring capacity in events (3 integers each)
midi_capacity = 1024

# Upper bounds used to size the audio rings
max_channels = 32
max_hardware_buffer_size = 16384

[control]
# How long a control call waits for the render thread's cycle boundary
# while a performance is live, before the call is dropped
call_wait_timeout_ms = 1000

[engine]
sample_rate = 44100
ksmps = 32
nchnls = 2
nchnls_i = 0
hardware_buffer_size = 4096
software_buffer_size = 256
frequency = 440.0
amplitude = 0.2

[render]
# Pace render cycles to wall-clock time
realtime_clock = true
"#;

        fs::write(&path, content)?;
        Ok(path)
    }

    /// Reject values the buffers cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.buffers.midi_capacity == 0 {
            return Err(Error::Config("buffers.midi_capacity must be > 0".to_string()));
        }
        if self.buffers.max_channels == 0 || self.buffers.max_hardware_buffer_size == 0 {
            return Err(Error::Config(
                "buffers.max_channels and buffers.max_hardware_buffer_size must be > 0".to_string(),
            ));
        }
        let e = &self.engine;
        if e.sample_rate <= 0 || e.ksmps <= 0 || e.nchnls <= 0 || e.nchnls_i < 0 {
            return Err(Error::Config(
                "engine sample_rate, ksmps and nchnls must be positive".to_string(),
            ));
        }
        if e.nchnls as usize > self.buffers.max_channels
            || e.nchnls_i as usize > self.buffers.max_channels
        {
            return Err(Error::Config(format!(
                "engine channel count exceeds buffers.max_channels ({})",
                self.buffers.max_channels
            )));
        }
        if e.hardware_buffer_size <= 0
            || e.hardware_buffer_size as usize > self.buffers.max_hardware_buffer_size
        {
            return Err(Error::Config(format!(
                "engine.hardware_buffer_size must be in 1..={}",
                self.buffers.max_hardware_buffer_size
            )));
        }
        Ok(())
    }
}

/// Shared buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// MIDI ring capacity in events
    pub midi_capacity: usize,
    /// Maximum channels per audio direction
    pub max_channels: usize,
    /// Maximum frames per hardware buffer
    pub max_hardware_buffer_size: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            midi_capacity: DEFAULT_MIDI_CAPACITY,
            max_channels: DEFAULT_MAX_CHANNELS,
            max_hardware_buffer_size: DEFAULT_MAX_HARDWARE_BUFFER_SIZE,
        }
    }
}

impl BufferSettings {
    /// Samples held by each audio ring.
    pub fn audio_ring_samples(&self) -> usize {
        self.max_channels * self.max_hardware_buffer_size
    }
}

/// Control-thread settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Bounded wait before a guarded call during a live performance
    pub call_wait_timeout_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            call_wait_timeout_ms: DEFAULT_CALL_WAIT_TIMEOUT_MS,
        }
    }
}

impl ControlSettings {
    /// The guarded-call wait as a `Duration`.
    pub fn call_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.call_wait_timeout_ms)
    }
}

/// Defaults for the built-in reference engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub sample_rate: i32,
    pub ksmps: i32,
    /// Output channels
    pub nchnls: i32,
    /// Input channels
    pub nchnls_i: i32,
    /// Frames per render cycle
    pub hardware_buffer_size: i32,
    /// Frames the engine keeps ahead of the render thread
    pub software_buffer_size: i32,
    /// Oscillator frequency in Hz
    pub frequency: f64,
    /// Oscillator amplitude (0.0 - 1.0)
    pub amplitude: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            ksmps: 32,
            nchnls: 2,
            nchnls_i: 0,
            hardware_buffer_size: 4096,
            software_buffer_size: 256,
            frequency: 440.0,
            amplitude: 0.2,
        }
    }
}

/// Software render coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Pace cycles to wall-clock time instead of free-running
    pub realtime_clock: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            realtime_clock: true,
        }
    }
}
