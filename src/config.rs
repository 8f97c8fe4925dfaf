//! YAML-loaded configuration.
//!
//! A single [`Config`] value covers the whole runtime; unknown keys are
//! ignored, missing keys take their defaults, so a partial file like
//!
//! ```yaml
//! fiber:
//!   stack_size: 262144
//! log:
//!   level: debug
//! ```
//!
//! is complete. Install the parsed value once with [`Config::install`];
//! everything that reads configuration goes through [`Config::get`], which
//! falls back to the defaults if nothing was installed.

use std::fs;
use std::path::Path;

use log::LevelFilter;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::Result;

static GLOBAL: OnceCell<Config> = OnceCell::new();

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub fiber: FiberConfig,
    pub daemon: DaemonConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Default fiber stack size in bytes.
    pub stack_size: u32,
}

impl Default for FiberConfig {
    fn default() -> Self {
        FiberConfig {
            stack_size: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds the supervisor waits before respawning a crashed child.
    pub restart_interval: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            restart_interval: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of `off`, `error`, `warn`, `info`, `debug`, `trace`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Config> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(crate::Error::from)?;
        Self::from_yaml(&text)
    }

    /// Make this value the process-wide configuration. The first install
    /// wins; returns whether this call installed it. Must happen before
    /// anything reads [`Config::get`], or the defaults are already locked
    /// in.
    pub fn install(self) -> bool {
        GLOBAL.set(self).is_ok()
    }

    pub fn get() -> &'static Config {
        GLOBAL.get_or_init(Config::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.fiber.stack_size, 1024 * 1024);
        assert_eq!(config.daemon.restart_interval, 5);
        assert_eq!(config.log.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml("fiber:\n  stack_size: 262144\n").unwrap();
        assert_eq!(config.fiber.stack_size, 262144);
        assert_eq!(config.daemon.restart_interval, 5);
    }

    #[test]
    fn nested_values_parse() {
        let text = "fiber:\n  stack_size: 131072\ndaemon:\n  restart_interval: 9\nlog:\n  level: trace\n";
        let config = Config::from_yaml(text).unwrap();
        assert_eq!(config.fiber.stack_size, 131072);
        assert_eq!(config.daemon.restart_interval, 9);
        assert_eq!(config.log.level_filter(), LevelFilter::Trace);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = Config::from_yaml("tcp:\n  nodelay: true\n").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(Config::from_yaml("fiber: [not, a, map]").is_err());
    }

    #[test]
    fn load_reads_a_file() {
        let path = std::env::temp_dir().join(format!("fibrio_config_{}.yml", std::process::id()));
        std::fs::write(&path, "daemon:\n  restart_interval: 30\n").unwrap();
        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.daemon.restart_interval, 30);
        assert!(Config::load(&path).is_err());
    }
}
