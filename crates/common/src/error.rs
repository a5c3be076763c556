//! Configuration loading errors shared by the binaries

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("missing required setting `{0}` (set it in the config file or environment)")]
    MissingSetting(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
