//! Settings loading for the sweep orchestrator.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`sweep.toml` by default)
//! 2. environment variables prefixed with `SWEEP_`
//!
//! There is deliberately no process-wide mutable base directory: a
//! [`Settings`] value is constructed once and handed to
//! [`Station`](crate::station::Station) and the store explicitly.
//!
//! # Example
//! ```no_run
//! use sweep_station::config::Settings;
//!
//! let settings = Settings::load_from("config/sweep.toml")?;
//! println!("Runs are stored under {}", settings.storage.basedir.display());
//! # Ok::<(), sweep_station::error::SweepError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, SweepError};

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Result store settings
    pub storage: StorageSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Result store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Base directory under which numbered run directories are created
    pub basedir: PathBuf,
    /// Rows between flush+fsync of the data file
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    /// Largest run ID considered during allocation
    #[serde(default = "default_max_run_id")]
    pub max_run_id: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_flush_every() -> usize {
    10
}

fn default_max_run_id() -> u64 {
    1_000_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from `sweep.toml` and the environment.
    ///
    /// Environment variables override file values with prefix `SWEEP_` and
    /// `__` separating nesting levels, so field names containing single
    /// underscores stay addressable. Examples:
    /// `SWEEP_STORAGE__BASEDIR=/data/cooldown7`,
    /// `SWEEP_STORAGE__FLUSH_EVERY=25`.
    pub fn load() -> AppResult<Self> {
        Self::load_from("sweep.toml")
    }

    /// Load settings from a specific file path plus the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SWEEP_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Build settings directly from a base directory, using defaults for
    /// everything else. Convenient for tests and one-off sessions.
    pub fn with_basedir(basedir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageSettings {
                basedir: basedir.into(),
                flush_every: default_flush_every(),
                max_run_id: default_max_run_id(),
            },
            logging: LoggingSettings::default(),
        }
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(SweepError::Configuration(format!(
                "invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.basedir.as_os_str().is_empty() {
            return Err(SweepError::Configuration(
                "storage.basedir must not be empty".to_string(),
            ));
        }

        if self.storage.flush_every == 0 {
            return Err(SweepError::Configuration(
                "storage.flush_every must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[storage]\nbasedir = \"/tmp/runs\"\nflush_every = 25\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.storage.basedir, PathBuf::from("/tmp/runs"));
        assert_eq!(settings.storage.flush_every, 25);
        assert_eq!(settings.storage.max_run_id, 1_000_000);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn test_env_overrides_underscored_field() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "sweep.toml",
                "[storage]\nbasedir = \"/tmp/runs\"\nflush_every = 25",
            )?;
            jail.set_env("SWEEP_STORAGE__FLUSH_EVERY", "3");
            jail.set_env("SWEEP_STORAGE__BASEDIR", "/data/override");

            let settings = Settings::load_from("sweep.toml").unwrap();
            assert_eq!(settings.storage.flush_every, 3);
            assert_eq!(settings.storage.basedir, PathBuf::from("/data/override"));
            Ok(())
        });
    }

    #[test]
    fn test_with_basedir_defaults() {
        let settings = Settings::with_basedir("/data");
        assert_eq!(settings.storage.flush_every, 10);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::with_basedir("/data");
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_empty_basedir_rejected() {
        let settings = Settings::with_basedir("");
        assert!(matches!(
            settings.validate(),
            Err(SweepError::Configuration(_))
        ));
    }
}
