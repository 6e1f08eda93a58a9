//! Named logger registry. Loggers are thin handles that emit through
//! `tracing` with the logger id attached, filtered by the per-logger
//! configured level.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOGGER: &str = "sys";

/// Per-logger configuration from `application.yaml` `loggers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_level")]
    pub level: String,
    /// Log file name under the logs path; console-only when absent.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            level: default_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

fn parse_level(level: &str) -> LogLevel {
    match level.to_ascii_lowercase().as_str() {
        "error" => LogLevel::Error,
        "warn" | "warning" => LogLevel::Warn,
        "debug" | "trace" => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

/// A named logger handle.
#[derive(Debug)]
pub struct Logger {
    name: String,
    level: LogLevel,
}

impl Logger {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if self.level >= LogLevel::Info {
            tracing::info!(logger = %self.name, "{}", msg.as_ref());
        }
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        if self.level >= LogLevel::Warn {
            tracing::warn!(logger = %self.name, "{}", msg.as_ref());
        }
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        if self.level >= LogLevel::Error {
            tracing::error!(logger = %self.name, "{}", msg.as_ref());
        }
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        if self.level >= LogLevel::Debug {
            tracing::debug!(logger = %self.name, "{}", msg.as_ref());
        }
    }
}

/// Registry of named loggers with per-logger config.
pub struct LoggerManager {
    logs_path: PathBuf,
    loggers: DashMap<String, Arc<Logger>>,
}

impl LoggerManager {
    pub fn new(logs_path: impl Into<PathBuf>) -> Self {
        Self {
            logs_path: logs_path.into(),
            loggers: DashMap::new(),
        }
    }

    pub fn logs_path(&self) -> &PathBuf {
        &self.logs_path
    }

    pub fn create_logger(&self, id: &str, config: &LoggerConfig) -> Arc<Logger> {
        let logger = Arc::new(Logger {
            name: id.to_string(),
            level: parse_level(&config.level),
        });
        self.loggers.insert(id.to_string(), Arc::clone(&logger));
        logger
    }

    /// Look up a logger by id. With `none_with_default`, a missing id
    /// (or `None`) yields the default logger, created on first use.
    pub fn get_logger(&self, id: Option<&str>, none_with_default: bool) -> Option<Arc<Logger>> {
        if let Some(id) = id
            && let Some(logger) = self.loggers.get(id)
        {
            return Some(Arc::clone(&logger));
        }

        if none_with_default {
            if let Some(logger) = self.loggers.get(DEFAULT_LOGGER) {
                return Some(Arc::clone(&logger));
            }
            return Some(self.create_logger(DEFAULT_LOGGER, &LoggerConfig::default()));
        }

        None
    }
}
