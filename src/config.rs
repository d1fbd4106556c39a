//! Configuration management for tlx-afu-sim.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (TLX_AFU_SEED, etc.)
//! 2. Project-local config file (`./tlx-afu-sim.toml`)
//! 3. User config file (`~/.config/tlx-afu-sim/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # tlx-afu-sim.toml
//!
//! # Seed for all pseudo-random draws (tags, addresses, payloads)
//! seed = 1
//!
//! # Cycle budget for a run
//! max_cycles = 100000
//!
//! # Concurrent outstanding commands the device allows itself
//! send_credit_max = 64
//!
//! # Scripted-host response latency in cycles
//! host_latency = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// tlx-afu-sim configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Seed for every pseudo-random draw in the run.
    pub seed: Option<u64>,

    /// Cycle budget before a run is cut off.
    pub max_cycles: Option<u64>,

    /// Local send-credit ceiling (concurrent outstanding commands).
    pub send_credit_max: Option<u32>,

    /// Scripted-host response latency in cycles.
    pub host_latency: Option<u64>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `tlx-afu-sim.toml`
    /// 3. User config `~/.config/tlx-afu-sim/config.toml`
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
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Random seed, with fallback to default.
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(1)
    }

    /// Cycle budget, with fallback to default.
    pub fn max_cycles(&self) -> u64 {
        self.max_cycles.unwrap_or(100_000)
    }

    /// Send-credit ceiling, with fallback to default.
    pub fn send_credit_max(&self) -> u32 {
        self.send_credit_max
            .unwrap_or(crate::afu::DEFAULT_SEND_CREDITS)
    }

    /// Host latency in cycles, with fallback to default.
    pub fn host_latency(&self) -> u64 {
        self.host_latency.unwrap_or(4)
    }

    /// Load user configuration from ~/.config/tlx-afu-sim/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("tlx-afu-sim").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./tlx-afu-sim.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("tlx-afu-sim.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("tlx-afu-sim.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
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
        if other.seed.is_some() {
            self.seed = other.seed;
        }
        if other.max_cycles.is_some() {
            self.max_cycles = other.max_cycles;
        }
        if other.send_credit_max.is_some() {
            self.send_credit_max = other.send_credit_max;
        }
        if other.host_latency.is_some() {
            self.host_latency = other.host_latency;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(seed) = std::env::var("TLX_AFU_SEED") {
            match seed.parse() {
                Ok(seed) => {
                    log::info!("Using TLX_AFU_SEED from environment: {}", seed);
                    self.seed = Some(seed);
                }
                Err(_) => log::warn!("Ignoring unparsable TLX_AFU_SEED: {}", seed),
            }
        }
        if let Ok(cycles) = std::env::var("TLX_AFU_MAX_CYCLES") {
            match cycles.parse() {
                Ok(cycles) => {
                    log::info!("Using TLX_AFU_MAX_CYCLES from environment: {}", cycles);
                    self.max_cycles = Some(cycles);
                }
                Err(_) => log::warn!("Ignoring unparsable TLX_AFU_MAX_CYCLES: {}", cycles),
            }
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tlx-afu-sim").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# tlx-afu-sim configuration
# Place this file at ~/.config/tlx-afu-sim/config.toml or ./tlx-afu-sim.toml

# Seed for all pseudo-random draws (tags, addresses, payloads)
# seed = 1

# Cycle budget for a run
# max_cycles = 100000

# Concurrent outstanding commands the device allows itself (1..=256)
# send_credit_max = 64

# Scripted-host response latency in cycles
# host_latency = 4
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.seed(), 1);
        assert_eq!(config.max_cycles(), 100_000);
        assert_eq!(config.send_credit_max(), crate::afu::DEFAULT_SEND_CREDITS);
        assert_eq!(config.host_latency(), 4);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            seed: Some(7),
            max_cycles: None,
            send_credit_max: Some(8),
            host_latency: None,
        };

        let overlay = Config {
            seed: None,
            max_cycles: Some(500),
            send_credit_max: Some(16),
            host_latency: None,
        };

        base.merge(overlay);

        // seed unchanged (overlay was None)
        assert_eq!(base.seed, Some(7));
        // max_cycles set from overlay
        assert_eq!(base.max_cycles, Some(500));
        // send_credit_max overridden by overlay
        assert_eq!(base.send_credit_max, Some(16));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let _: Config = toml::from_str(&sample).expect("Sample config should parse");
    }
}
