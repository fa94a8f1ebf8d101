//! Configuration shared by Reef processes
//!
//! Everything is read from environment variables. A process hosting the
//! pipeline reads [`CommonConfig`] once at startup and layers its own
//! settings on top.

mod error;
mod transcode;

pub use error::{ConfigError, ConfigResult};
pub use transcode::TranscodeConfig;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// Library registered when the process starts
    pub music_library_path: PathBuf,

    pub transcode: TranscodeConfig,

    pub environment: Environment,

    /// Filter directive, from RUST_LOG falling back to LOG_LEVEL
    pub log_level: String,
}

/// Deployment mode, read from `ENVIRONMENT`
///
/// Unrecognised values fall back to development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }

    fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|value| value.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl std::str::FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        Ok(if value.starts_with("prod") {
            Self::Production
        } else if value.starts_with("stag") {
            Self::Staging
        } else {
            Self::Development
        })
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CommonConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let log_level = env::var("RUST_LOG")
            .or_else(|_| env::var("LOG_LEVEL"))
            .unwrap_or_else(|_| String::from("info"));

        Ok(Self {
            music_library_path: get_env_or_default("MUSIC_LIBRARY_PATH", "/music").into(),
            transcode: TranscodeConfig::from_env()?,
            environment: Environment::from_env(),
            log_level,
        })
    }

    /// Same as [`CommonConfig::from_env`], after loading `.env` if present
    pub fn load() -> ConfigResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }
}

/// Read `name`, or `default` when it is unset
pub fn get_env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

/// Parse `name` into `T`, or return `default` when it is unset
///
/// A set but unparsable value is an error rather than a silent fallback.
pub fn parse_env<T>(name: &str, default: T) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_owned(), e.to_string()))
}
