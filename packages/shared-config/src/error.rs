//! Errors raised while reading configuration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("{0} has an unusable value: {1}")]
    InvalidValue(String, String),

    /// Values parsed but do not make sense together
    #[error("invalid configuration: {0}")]
    ValidationError(String),

    /// A directory named by the configuration cannot be prepared
    #[error("cannot prepare directory {path}: {source}")]
    Directory {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
