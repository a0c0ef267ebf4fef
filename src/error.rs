//! Error types for the alarm.
//!
//! Only startup and shutdown can fail hard: configuration and client errors
//! are returned from [`crate::run`]. Everything raised while the alarm is running is
//! logged and dropped by the worker.

use thiserror::Error;

use crate::status::StatusMain;

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("disarm pin must be exactly 4 digits")]
    InvalidDisarmPin,

    #[error("invalid trigger regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },

    #[error("initial status {0} is not one of UNARMED, ARMED_HOME, ARMED_AWAY")]
    InvalidInitialStatus(StatusMain),

    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Reasons a `DEACTIVATE` payload is refused before the pin is even checked.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("payload is not a json object: {0}")]
    Malformed(String),

    #[error("pin not found in payload")]
    MissingPin,

    #[error("pin '{0}' is not 4 digits")]
    InvalidPin(String),
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("device lookup request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to build log roller: {0}")]
    Roller(String),

    #[error("failed to open log file: {0}")]
    File(#[from] std::io::Error),

    #[error("invalid logger configuration: {0}")]
    Config(String),

    #[error("logger already initialized: {0}")]
    Init(#[from] log::SetLoggerError),
}
