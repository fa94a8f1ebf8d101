//! Worker configuration loaded from environment variables
//!
//! Queue sizing, scan concurrency and embedding limits live here. Settings
//! shared with hosting services (library path, transcoding) come from
//! [`CommonConfig`].

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reef_shared_config::{CommonConfig, Environment, TranscodeConfig};

use crate::jobs::embedding_generation::{DEFAULT_JOB_TIMEOUT_SECS, DEFAULT_MAX_ANALYSIS_SECS};
use crate::jobs::library_scan::ScanWorkerConfig;
use crate::queue::{BackpressurePolicy, QueueConfig};
use crate::triggers::{ScanSchedule, WatchConfig};

/// Grace period before the startup scan
const STARTUP_SCAN_DELAY: Duration = Duration::from_secs(5);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Scan queue capacity, 0 for unbounded
    pub scan_queue_capacity: usize,

    /// Embedding queue capacity, 0 for unbounded
    pub embedding_queue_capacity: usize,

    /// Behaviour of a full bounded queue
    pub backpressure: BackpressurePolicy,

    /// Files between scan progress reports
    pub scan_progress_interval: usize,

    /// Scans allowed to run at once (different libraries only)
    pub max_concurrent_scans: usize,

    /// Upper bound for one embedding job in seconds
    pub embedding_timeout_secs: u64,

    /// Seconds of audio analyzed per track
    pub embedding_max_analysis_secs: u32,

    /// Minutes between scheduled scans of every library, 0 to disable
    pub scan_interval_minutes: u64,

    /// Scan every library once after start
    pub scan_on_startup: bool,

    /// Watch library directories for changes
    pub watch_libraries: bool,

    /// Quiet seconds before filesystem changes are scanned
    pub watch_debounce_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
        let scan_defaults = ScanWorkerConfig::default();

        Ok(Self {
            common,

            scan_queue_capacity: env::var("SCAN_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid SCAN_QUEUE_CAPACITY value")?,

            embedding_queue_capacity: env::var("EMBEDDING_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid EMBEDDING_QUEUE_CAPACITY value")?,

            backpressure: env::var("QUEUE_BACKPRESSURE")
                .unwrap_or_else(|_| "block".to_string())
                .parse()
                .map_err(|e: String| anyhow::anyhow!("Invalid QUEUE_BACKPRESSURE value: {}", e))?,

            scan_progress_interval: env::var("SCAN_PROGRESS_INTERVAL")
                .unwrap_or_else(|_| scan_defaults.progress_interval.to_string())
                .parse()
                .context("Invalid SCAN_PROGRESS_INTERVAL value")?,

            max_concurrent_scans: env::var("WORKER_MAX_CONCURRENT_SCANS")
                .unwrap_or_else(|_| scan_defaults.max_concurrent_scans.to_string())
                .parse()
                .context("Invalid WORKER_MAX_CONCURRENT_SCANS value")?,

            embedding_timeout_secs: env::var("EMBEDDING_TIMEOUT")
                .unwrap_or_else(|_| DEFAULT_JOB_TIMEOUT_SECS.to_string())
                .parse()
                .context("Invalid EMBEDDING_TIMEOUT value")?,

            embedding_max_analysis_secs: env::var("EMBEDDING_MAX_ANALYSIS_SECS")
                .unwrap_or_else(|_| DEFAULT_MAX_ANALYSIS_SECS.to_string())
                .parse()
                .context("Invalid EMBEDDING_MAX_ANALYSIS_SECS value")?,

            scan_interval_minutes: env::var("SCAN_INTERVAL_MINUTES")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Invalid SCAN_INTERVAL_MINUTES value")?,

            scan_on_startup: env::var("SCAN_ON_STARTUP")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("Invalid SCAN_ON_STARTUP value")?,

            watch_libraries: env::var("WATCH_LIBRARIES")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid WATCH_LIBRARIES value")?,

            watch_debounce_secs: env::var("WATCH_DEBOUNCE_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid WATCH_DEBOUNCE_SECS value")?,
        })
    }

    pub fn scan_queue(&self) -> QueueConfig {
        QueueConfig::from_capacity(self.scan_queue_capacity, self.backpressure)
    }

    pub fn embedding_queue(&self) -> QueueConfig {
        QueueConfig::from_capacity(self.embedding_queue_capacity, self.backpressure)
    }

    pub fn scan_worker(&self) -> ScanWorkerConfig {
        ScanWorkerConfig {
            progress_interval: self.scan_progress_interval.max(1),
            max_concurrent_scans: self.max_concurrent_scans.max(1),
        }
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn scan_schedule(&self) -> ScanSchedule {
        ScanSchedule {
            interval: (self.scan_interval_minutes > 0)
                .then(|| Duration::from_secs(self.scan_interval_minutes * 60)),
            scan_on_startup: self.scan_on_startup,
            startup_delay: STARTUP_SCAN_DELAY,
        }
    }

    /// `None` when library watching is turned off
    pub fn watch(&self) -> Option<WatchConfig> {
        self.watch_libraries.then(|| WatchConfig {
            debounce: Duration::from_secs(self.watch_debounce_secs.max(1)),
            ..WatchConfig::default()
        })
    }

    /// Get music library path
    pub fn music_library_path(&self) -> &PathBuf {
        &self.common.music_library_path
    }

    pub fn transcode(&self) -> &TranscodeConfig {
        &self.common.transcode
    }

    /// Get environment mode
    pub fn environment(&self) -> Environment {
        self.common.environment
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.common.environment.is_production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 11] = [
        "SCAN_QUEUE_CAPACITY",
        "EMBEDDING_QUEUE_CAPACITY",
        "QUEUE_BACKPRESSURE",
        "SCAN_PROGRESS_INTERVAL",
        "WORKER_MAX_CONCURRENT_SCANS",
        "EMBEDDING_TIMEOUT",
        "EMBEDDING_MAX_ANALYSIS_SECS",
        "SCAN_INTERVAL_MINUTES",
        "SCAN_ON_STARTUP",
        "WATCH_LIBRARIES",
        "WATCH_DEBOUNCE_SECS",
    ];

    #[test]
    fn test_defaults() {
        temp_env::with_vars_unset(VARS, || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.scan_queue(), QueueConfig::unbounded());
            assert_eq!(config.embedding_queue(), QueueConfig::unbounded());
            assert_eq!(config.backpressure, BackpressurePolicy::Block);
            assert_eq!(config.scan_worker().progress_interval, 25);
            assert_eq!(config.scan_worker().max_concurrent_scans, 1);
            assert_eq!(config.embedding_timeout(), Duration::from_secs(120));
            assert_eq!(config.embedding_max_analysis_secs, 60);
            assert_eq!(
                config.scan_schedule().interval,
                Some(Duration::from_secs(3600))
            );
            assert!(!config.scan_schedule().scan_on_startup);
            assert_eq!(config.watch().unwrap().debounce, Duration::from_secs(5));
        });
    }

    #[test]
    fn test_scan_triggers_can_be_disabled() {
        temp_env::with_vars(
            [
                ("SCAN_INTERVAL_MINUTES", Some("0")),
                ("WATCH_LIBRARIES", Some("false")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert!(!config.scan_schedule().is_enabled());
                assert!(config.watch().is_none());
            },
        );

        temp_env::with_var("SCAN_ON_STARTUP", Some("yes"), || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("SCAN_ON_STARTUP"));
        });
    }

    #[test]
    fn test_bounded_queues_with_reject() {
        temp_env::with_vars(
            [
                ("SCAN_QUEUE_CAPACITY", Some("16")),
                ("EMBEDDING_QUEUE_CAPACITY", Some("0")),
                ("QUEUE_BACKPRESSURE", Some("reject")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(
                    config.scan_queue(),
                    QueueConfig::bounded(16, BackpressurePolicy::Reject)
                );
                assert_eq!(config.embedding_queue().capacity, None);
            },
        );
    }

    #[test]
    fn test_zero_progress_interval_is_clamped() {
        temp_env::with_var("SCAN_PROGRESS_INTERVAL", Some("0"), || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.scan_worker().progress_interval, 1);
        });
    }

    #[test]
    fn test_invalid_values_are_reported() {
        temp_env::with_var("SCAN_QUEUE_CAPACITY", Some("lots"), || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("SCAN_QUEUE_CAPACITY"));
        });

        temp_env::with_var("QUEUE_BACKPRESSURE", Some("drop"), || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_BACKPRESSURE"));
        });
    }

    #[test]
    fn test_negative_values_fail_parsing() {
        temp_env::with_var("EMBEDDING_TIMEOUT", Some("-5"), || {
            assert!(Config::from_env().is_err());
        });
    }
}
