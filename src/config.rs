//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. `config/itc_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `ITC_DAQ_`, nesting separated by `__`
//!
//! Every field has a default, so an absent file yields a working simulated setup.
//!
//! # Example
//! ```no_run
//! use itc_daq::config::ItcDaqConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ItcDaqConfig::load()?;
//! config.validate()?;
//! println!("Sampling {:?} every {:?}", config.sampling.channels, config.sampling.interval);
//! # Ok(())
//! # }
//! ```
//!
//! Override from the shell:
//! ```text
//! ITC_DAQ_LINK__TRANSPORT=tcp ITC_DAQ_LINK__ADDRESS=192.168.1.20:1234 itc-daq status
//! ```

use crate::error::{AppResult, DaqError};
use crate::instrument::Channel;
use crate::logging::LogFormat;
use crate::measurement::SamplingOptions;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/itc_daq.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ITC_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItcDaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// How to reach the controller
    #[serde(default)]
    pub link: LinkConfig,
    /// Background sampling settings
    #[serde(default)]
    pub sampling: SamplingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Transport used to reach the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// RS-232 serial port.
    Serial,
    /// Ethernet-GPIB bridge.
    Tcp,
    /// In-memory simulator.
    #[default]
    Simulated,
}

/// Link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Transport kind
    #[serde(default)]
    pub transport: Transport,
    /// Serial port path (serial transport), e.g. `/dev/ttyUSB0`
    #[serde(default)]
    pub port: Option<String>,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// `host:port` of the bridge (tcp transport)
    #[serde(default)]
    pub address: Option<String>,
    /// Reply timeout, e.g. `"1s"` or `"500ms"`
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            port: None,
            baud_rate: default_baud_rate(),
            address: None,
            timeout: default_timeout(),
        }
    }
}

/// Sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Channel names read on every tick, in order
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    /// Time between ticks, e.g. `"400ms"`
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Maximum queued samples (unbounded when absent)
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            interval: default_interval(),
            queue_capacity: None,
        }
    }
}

impl SamplingConfig {
    /// Resolve the configured channel names.
    pub fn resolved_channels(&self) -> AppResult<Vec<Channel>> {
        self.channels.iter().map(|name| name.parse()).collect()
    }

    /// Worker options equivalent to this section.
    pub fn options(&self) -> SamplingOptions {
        SamplingOptions {
            interval: self.interval,
            queue_capacity: self.queue_capacity,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "ITC DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_channels() -> Vec<String> {
    ["TSorp", "THe3", "T1K"].map(String::from).to_vec()
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

impl ItcDaqConfig {
    /// Load configuration from `config/itc_daq.toml` and environment variables
    ///
    /// Example: `ITC_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref(), ENV_PREFIX).extract()?)
    }

    fn figment(path: &Path, env_prefix: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        match self.link.transport {
            Transport::Serial if self.link.port.as_deref().map_or(true, str::is_empty) => {
                return Err(DaqError::Configuration(
                    "link.port is required for the serial transport".to_string(),
                ));
            }
            Transport::Tcp if self.link.address.as_deref().map_or(true, str::is_empty) => {
                return Err(DaqError::Configuration(
                    "link.address is required for the tcp transport".to_string(),
                ));
            }
            _ => {}
        }
        if self.link.baud_rate == 0 {
            return Err(DaqError::Configuration(
                "link.baud_rate must be greater than zero".to_string(),
            ));
        }
        if self.link.timeout.is_zero() {
            return Err(DaqError::Configuration(
                "link.timeout must be greater than zero".to_string(),
            ));
        }

        if self.sampling.channels.is_empty() {
            return Err(DaqError::Configuration(
                "sampling.channels must name at least one channel".to_string(),
            ));
        }
        self.sampling.resolved_channels()?;
        if self.sampling.interval.is_zero() {
            return Err(DaqError::Configuration(
                "sampling.interval must be greater than zero".to_string(),
            ));
        }
        if self.sampling.queue_capacity == Some(0) {
            return Err(DaqError::Configuration(
                "sampling.queue_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Failed to render configuration: {e}")))
    }
}
