//! Service settings using Figment
//!
//! Settings are loaded from:
//! 1. `config/readout.toml` (base configuration)
//! 2. Environment variables prefixed with `READOUT_`, sections separated by `__`
//!
//! Every field has a default, so an empty or missing file yields a usable service.
//!
//! # Example
//! ```no_run
//! use feedline_readout::settings::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Idle wait: {:?}", settings.scheduler.idle_wait);
//! # Ok(())
//! # }
//! ```

use crate::error::{ReadoutError, ReadoutResult};
use crate::logging::OutputFormat;
use crate::worker::DEFAULT_CHUNK_THRESHOLD_BYTES;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/readout.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Control loop settings
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Simulated instrument settings
    #[serde(default)]
    pub simulator: SimulatorSettings,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Service name used in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Control loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Longest wait for a command when the loop has nothing to do
    #[serde(default = "default_idle_wait", with = "humantime_serde")]
    pub idle_wait: Duration,
    /// Capacity of the command channel
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Largest chunk a bulk tap transfers at once
    #[serde(default = "default_chunk_threshold_bytes")]
    pub chunk_threshold_bytes: u64,
}

/// Simulated instrument settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorSettings {
    /// Simulated transfer time per chunk
    #[serde(default = "default_chunk_delay", with = "humantime_serde")]
    pub chunk_delay: Duration,
    /// Seed for the random sample generator
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Chunks after which a photon stream ends (unset = runs until aborted)
    #[serde(default)]
    pub photon_chunks: Option<u64>,
}

// Default value functions
fn default_name() -> String {
    "feedline-readout".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_idle_wait() -> Duration {
    Duration::from_millis(10)
}

fn default_command_capacity() -> usize {
    32
}

fn default_chunk_threshold_bytes() -> u64 {
    DEFAULT_CHUNK_THRESHOLD_BYTES
}

fn default_chunk_delay() -> Duration {
    Duration::from_millis(1)
}

fn default_seed() -> u64 {
    0x6d6b_6964
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            idle_wait: default_idle_wait(),
            command_capacity: default_command_capacity(),
            chunk_threshold_bytes: default_chunk_threshold_bytes(),
        }
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            chunk_delay: default_chunk_delay(),
            seed: default_seed(),
            photon_chunks: None,
        }
    }
}

impl Settings {
    /// Load settings from `config/readout.toml` and environment variables
    ///
    /// Environment variables override the file, e.g.
    /// `READOUT_SCHEDULER__IDLE_WAIT=5ms`.
    pub fn load() -> ReadoutResult<Self> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load settings from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> ReadoutResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("READOUT_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> ReadoutResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ReadoutError::SettingsValidation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scheduler.idle_wait.is_zero() {
            return Err(ReadoutError::SettingsValidation(
                "scheduler.idle_wait must be greater than zero".into(),
            ));
        }

        if self.scheduler.command_capacity == 0 {
            return Err(ReadoutError::SettingsValidation(
                "scheduler.command_capacity must be at least 1".into(),
            ));
        }

        if self.scheduler.chunk_threshold_bytes == 0 {
            return Err(ReadoutError::SettingsValidation(
                "scheduler.chunk_threshold_bytes must be greater than zero".into(),
            ));
        }

        if self.simulator.photon_chunks == Some(0) {
            return Err(ReadoutError::SettingsValidation(
                "simulator.photon_chunks must be unset or at least 1".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_settings(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scheduler.idle_wait, Duration::from_millis(10));
        assert_eq!(settings.scheduler.chunk_threshold_bytes, 1024 * 1024);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_settings(
            r#"
            [application]
            name = "bench"
            log_level = "debug"
            log_format = "json"

            [scheduler]
            idle_wait = "25ms"
            chunk_threshold_bytes = 4096

            [simulator]
            chunk_delay = "2ms"
            photon_chunks = 4
            "#,
        );

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.name, "bench");
        assert_eq!(settings.application.log_format, OutputFormat::Json);
        assert_eq!(settings.scheduler.idle_wait, Duration::from_millis(25));
        assert_eq!(settings.scheduler.chunk_threshold_bytes, 4096);
        assert_eq!(settings.scheduler.command_capacity, 32);
        assert_eq!(settings.simulator.chunk_delay, Duration::from_millis(2));
        assert_eq!(settings.simulator.photon_chunks, Some(4));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.application.name, "feedline-readout");
    }

    #[test]
    fn test_malformed_duration_is_settings_error() {
        let file = write_settings("[scheduler]\nidle_wait = \"soon\"\n");
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(ReadoutError::Settings(_))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".into();
        assert!(matches!(
            settings.validate(),
            Err(ReadoutError::SettingsValidation(_))
        ));

        let mut settings = Settings::default();
        settings.scheduler.command_capacity = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scheduler.idle_wait = Duration::ZERO;
        assert!(settings.validate().is_err());
    }
}
