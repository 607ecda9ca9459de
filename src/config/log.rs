//! Log output configuration

use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_log_file() -> PathBuf {
    PathBuf::from("uns.log")
}

/// Log file settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// File the log lines are appended to
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Minimum severity written
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_file: default_log_file(),
            log_level: LogLevel::default(),
        }
    }
}
