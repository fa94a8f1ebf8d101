//! Transcoding subsystem configuration types

use std::path::PathBuf;
use std::time::Duration;

use crate::{get_env_or_default, parse_env, ConfigError, ConfigResult};

/// Encoder process and output directory configuration
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Directory holding one sub-directory per transcoding job
    pub work_dir: PathBuf,

    /// Encoder executable (ffmpeg)
    pub ffmpeg_path: PathBuf,

    /// Maximum encoder processes running at the same time
    pub max_concurrent: usize,

    /// Seconds a job may go unread before its files are reclaimed
    pub idle_timeout_secs: u64,

    /// Seconds to wait for an HLS playlist to appear
    pub playlist_timeout_secs: u64,

    /// Target HLS segment length in seconds
    pub hls_segment_secs: u32,
}

impl TranscodeConfig {
    /// Load transcoding configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let default_dir = std::env::temp_dir().join("reef-transcode");
        let config = Self {
            work_dir: PathBuf::from(get_env_or_default(
                "TRANSCODE_DIR",
                &default_dir.to_string_lossy(),
            )),
            ffmpeg_path: PathBuf::from(get_env_or_default("FFMPEG_PATH", "ffmpeg")),
            max_concurrent: parse_env("TRANSCODE_MAX_CONCURRENT", 4)?,
            idle_timeout_secs: parse_env("TRANSCODE_IDLE_TIMEOUT", 300)?,
            playlist_timeout_secs: parse_env("TRANSCODE_PLAYLIST_TIMEOUT", 20)?,
            hls_segment_secs: parse_env("HLS_SEGMENT_SECONDS", 10)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration rooted at a custom work directory (useful for testing)
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Reject values that would stall or disable the transcoder
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "TRANSCODE_MAX_CONCURRENT must be at least 1".to_string(),
            ));
        }
        if self.hls_segment_secs == 0 {
            return Err(ConfigError::ValidationError(
                "HLS_SEGMENT_SECONDS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create the work directory if it does not exist yet
    pub fn prepare_work_dir(&self) -> ConfigResult<()> {
        std::fs::create_dir_all(&self.work_dir).map_err(|source| ConfigError::Directory {
            path: self.work_dir.clone(),
            source,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn playlist_timeout(&self) -> Duration {
        Duration::from_secs(self.playlist_timeout_secs)
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("reef-transcode"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            max_concurrent: 4,
            idle_timeout_secs: 300,
            playlist_timeout_secs: 20,
            hls_segment_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TranscodeConfig::default();
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.playlist_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_with_work_dir() {
        let config = TranscodeConfig::with_work_dir("/tmp/jobs");
        assert_eq!(config.work_dir, PathBuf::from("/tmp/jobs"));
        assert_eq!(config.hls_segment_secs, 10);
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                ("TRANSCODE_DIR", Some("/var/cache/reef")),
                ("TRANSCODE_MAX_CONCURRENT", Some("2")),
                ("HLS_SEGMENT_SECONDS", Some("6")),
            ],
            || {
                let config = TranscodeConfig::from_env().unwrap();
                assert_eq!(config.work_dir, PathBuf::from("/var/cache/reef"));
                assert_eq!(config.max_concurrent, 2);
                assert_eq!(config.hls_segment_secs, 6);
            },
        );
    }

    #[test]
    fn test_prepare_work_dir_creates_nested_dirs() {
        let root = tempfile::tempdir().unwrap();
        let config = TranscodeConfig::with_work_dir(root.path().join("a").join("b"));
        config.prepare_work_dir().unwrap();
        assert!(config.work_dir.is_dir());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        temp_env::with_var("TRANSCODE_MAX_CONCURRENT", Some("0"), || {
            let err = TranscodeConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)));
        });
    }
}
