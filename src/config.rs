//! Configuration management for tritone-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`TRITONE_ARRAY_SIZE`, etc.)
//! 2. Project-local config file (`./tritone-emu.toml`)
//! 3. User config file (`~/.config/tritone-emu/config.toml`)
//! 4. Built-in defaults
//!
//! Everything here is construction-time only: a running core never rereads
//! its configuration.
//!
//! # Config File Format
//!
//! ```toml
//! # tritone-emu.toml
//! array_size = 8
//! num_banks = 8
//! bank_depth = 1024
//! max_burst_beats = 16
//! bytes_per_beat = 4
//! dma_priority = 1
//! compute_priority = 1
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::device::tritone_spec::{
    DEFAULT_ARRAY_SIZE, DEFAULT_BANK_DEPTH, DEFAULT_BYTES_PER_BEAT, DEFAULT_COMPUTE_PRIORITY,
    DEFAULT_DMA_PRIORITY, DEFAULT_MAX_BURST_BEATS, DEFAULT_NUM_BANKS, MAX_ARRAY_SIZE,
    MAX_BURST_BEATS, MAX_BYTES_PER_BEAT, MAX_NUM_BANKS, MAX_PRIORITY, WORD_BYTES,
};

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// A configuration value the core cannot be built with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("{field} = {value} exceeds the maximum of {max}")]
    TooLarge { field: &'static str, value: usize, max: usize },

    #[error("bytes_per_beat = {0} is not a multiple of 4")]
    BeatWidth(usize),

    #[error("{field} = {value} is not a priority (0..=3)")]
    Priority { field: &'static str, value: u8 },
}

/// tritone-emu configuration as read from files and the environment.
///
/// Every field is optional so layers only override what they set.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Compute array dimension.
    pub array_size: Option<usize>,

    /// Interleaved banks per buffer.
    pub num_banks: Option<usize>,

    /// Words per bank.
    pub bank_depth: Option<usize>,

    /// Longest transfer engine burst, in beats.
    pub max_burst_beats: Option<u32>,

    /// Transfer engine beat width in bytes.
    pub bytes_per_beat: Option<usize>,

    /// Arbiter priority of transfer engine accesses.
    pub dma_priority: Option<u8>,

    /// Arbiter priority of scheduler and reduce unit accesses.
    pub compute_priority: Option<u8>,
}

/// Validated construction parameters of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    pub array_size: usize,
    pub num_banks: usize,
    pub bank_depth: usize,
    pub max_burst_beats: u32,
    pub bytes_per_beat: usize,
    pub dma_priority: u8,
    pub compute_priority: u8,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            array_size: DEFAULT_ARRAY_SIZE,
            num_banks: DEFAULT_NUM_BANKS,
            bank_depth: DEFAULT_BANK_DEPTH,
            max_burst_beats: DEFAULT_MAX_BURST_BEATS,
            bytes_per_beat: DEFAULT_BYTES_PER_BEAT,
            dma_priority: DEFAULT_DMA_PRIORITY,
            compute_priority: DEFAULT_COMPUTE_PRIORITY,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("array_size", self.array_size),
            ("num_banks", self.num_banks),
            ("bank_depth", self.bank_depth),
            ("max_burst_beats", self.max_burst_beats as usize),
            ("bytes_per_beat", self.bytes_per_beat),
        ];
        if let Some(&(field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }

        let bounded = [
            ("array_size", self.array_size, MAX_ARRAY_SIZE),
            ("num_banks", self.num_banks, MAX_NUM_BANKS),
            ("max_burst_beats", self.max_burst_beats as usize, MAX_BURST_BEATS as usize),
            ("bytes_per_beat", self.bytes_per_beat, MAX_BYTES_PER_BEAT),
        ];
        if let Some(&(field, value, max)) = bounded.iter().find(|(_, v, max)| v > max) {
            return Err(ConfigError::TooLarge { field, value, max });
        }

        if self.bytes_per_beat % WORD_BYTES != 0 {
            return Err(ConfigError::BeatWidth(self.bytes_per_beat));
        }

        for (field, value) in [("dma_priority", self.dma_priority), ("compute_priority", self.compute_priority)] {
            if value > MAX_PRIORITY {
                return Err(ConfigError::Priority { field, value });
            }
        }
        Ok(())
    }

    /// Words each buffer holds.
    pub fn buffer_words(&self) -> usize {
        self.num_banks * self.bank_depth
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `tritone-emu.toml`
    /// 3. User config `~/.config/tritone-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Resolve defaults and validate.
    pub fn core_config(&self) -> Result<CoreConfig, ConfigError> {
        let defaults = CoreConfig::default();
        let core = CoreConfig {
            array_size: self.array_size.unwrap_or(defaults.array_size),
            num_banks: self.num_banks.unwrap_or(defaults.num_banks),
            bank_depth: self.bank_depth.unwrap_or(defaults.bank_depth),
            max_burst_beats: self.max_burst_beats.unwrap_or(defaults.max_burst_beats),
            bytes_per_beat: self.bytes_per_beat.unwrap_or(defaults.bytes_per_beat),
            dma_priority: self.dma_priority.unwrap_or(defaults.dma_priority),
            compute_priority: self.compute_priority.unwrap_or(defaults.compute_priority),
        };
        core.validate()?;
        Ok(core)
    }

    fn load_user_config() -> Option<Self> {
        Self::load_from_file(&Self::user_config_path()?)
    }

    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("tritone-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("tritone-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.array_size.is_some() {
            self.array_size = other.array_size;
        }
        if other.num_banks.is_some() {
            self.num_banks = other.num_banks;
        }
        if other.bank_depth.is_some() {
            self.bank_depth = other.bank_depth;
        }
        if other.max_burst_beats.is_some() {
            self.max_burst_beats = other.max_burst_beats;
        }
        if other.bytes_per_beat.is_some() {
            self.bytes_per_beat = other.bytes_per_beat;
        }
        if other.dma_priority.is_some() {
            self.dma_priority = other.dma_priority;
        }
        if other.compute_priority.is_some() {
            self.compute_priority = other.compute_priority;
        }
    }

    fn apply_env_overrides(&mut self) {
        fn env<T: std::str::FromStr>(name: &str) -> Option<T> {
            let raw = std::env::var(name).ok()?;
            match raw.trim().parse() {
                Ok(value) => {
                    log::info!("Using {} from environment: {}", name, raw);
                    Some(value)
                }
                Err(_) => {
                    log::warn!("Ignoring {}={}: not a number", name, raw);
                    None
                }
            }
        }

        if let Some(v) = env("TRITONE_ARRAY_SIZE") {
            self.array_size = Some(v);
        }
        if let Some(v) = env("TRITONE_NUM_BANKS") {
            self.num_banks = Some(v);
        }
        if let Some(v) = env("TRITONE_BANK_DEPTH") {
            self.bank_depth = Some(v);
        }
        if let Some(v) = env("TRITONE_MAX_BURST_BEATS") {
            self.max_burst_beats = Some(v);
        }
        if let Some(v) = env("TRITONE_BYTES_PER_BEAT") {
            self.bytes_per_beat = Some(v);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tritone-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# tritone-emu configuration
# Place this file at ~/.config/tritone-emu/config.toml or ./tritone-emu.toml

# Compute array dimension (array is size x size, at most 64)
array_size = 8

# Banks per buffer (at most 64) and words per bank
num_banks = 8
bank_depth = 1024

# Transfer engine burst shape (at most 256 beats, beats of 4..=64 bytes)
max_burst_beats = 16
bytes_per_beat = 4

# Arbiter priorities (0..=3). Priority 3 bypasses round robin.
dma_priority = 1
compute_priority = 1
"#
        .to_string()
    }
}
