//! Errors raised while loading configuration and setting up the process.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A value failed validation; the message names the offending key.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The global subscriber was already installed or the filter is bad.
    #[error("Tracing setup failed: {0}")]
    Tracing(String),
}
