//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::MediaResult;

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Drive thread settings.
    pub pump: PumpConfig,

    /// Data-parallel worker pool settings.
    pub pool: PoolConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Settings for a media target's pump thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Name given to the pump thread.
    pub thread_name: String,

    /// Derive pipeline time from the wall clock (true) or from elapsed frames (false).
    pub real_time: bool,

    /// Spin granularity of self-waits on the pump thread, in microseconds.
    pub nap_micros: u64,

    /// Longest single sleep the pump takes while pacing, in milliseconds.
    pub max_sleep_slice_ms: u64,

    /// Niceness for the pump thread (-20 highest, 19 lowest). `None` keeps
    /// the priority inherited from the starting thread. Applied on Linux only.
    pub nice: Option<i32>,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub threads: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "framepump_engine=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            thread_name: "frame-pump".to_string(),
            real_time: true,
            nap_micros: 1000,
            max_sleep_slice_ms: 50,
            nice: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl EngineConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match Self::from_path(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Load config from an explicit file.
    pub fn from_path(path: &Path) -> MediaResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }

    /// Where `load` and `save` look for the config file.
    pub fn default_path() -> PathBuf {
        config_file_path()
    }

    fn validate(&self) -> MediaResult<()> {
        if self.pool.threads == 0 {
            return Err(crate::error::MediaError::config(
                "pool.threads must be at least 1",
            ));
        }
        if self.pump.nap_micros == 0 {
            return Err(crate::error::MediaError::config(
                "pump.nap_micros must be at least 1",
            ));
        }
        if let Some(nice) = self.pump.nice {
            if !(-20..=19).contains(&nice) {
                return Err(crate::error::MediaError::config(format!(
                    "pump.nice must be within -20..=19, got {nice}"
                )));
            }
        }
        Ok(())
    }
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("framepump").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"pump":{"real_time":false}}"#).unwrap();
        assert!(!config.pump.real_time);
        assert_eq!(config.pump.thread_name, "frame-pump");
        assert_eq!(config.logging.level, "info");
        assert!(config.pool.threads >= 1);
    }

    #[test]
    fn test_from_path_rejects_zero_threads() {
        let path = std::env::temp_dir().join(format!(
            "framepump-config-test-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{"pool":{"threads":0}}"#).unwrap();
        let result = EngineConfig::from_path(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(
            result,
            Err(crate::error::MediaError::Config { .. })
        ));
    }

    #[test]
    fn test_pump_nice_is_range_checked() {
        let mut config = EngineConfig::default();
        assert_eq!(config.pump.nice, None);

        config.pump.nice = Some(5);
        assert!(config.validate().is_ok());
        config.pump.nice = Some(-21);
        assert!(config.validate().is_err());
    }
}
