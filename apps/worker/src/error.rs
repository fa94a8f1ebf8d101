//! Pipeline error type
//!
//! Every stage reports through [`WorkerError`]; the variant decides the
//! log severity and whether a caller may usefully re-enqueue the job.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::queue::QueueError;

/// Failures of scan, embedding and transcoding jobs
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Library is no longer registered, or the requested directory lies outside it
    #[error("invalid scan scope: {0}")]
    InvalidScanScope(String),

    /// The directory to enumerate is missing or unreadable
    #[error("scan root unavailable: {path}: {reason}")]
    ScanRootUnavailable { path: PathBuf, reason: String },

    #[error("cannot read tags from {path}: {reason}")]
    MetadataExtraction { path: String, reason: String },

    #[error("cannot decode {path}: {reason}")]
    AudioDecoding { path: String, reason: String },

    /// Feature extractor gave up on a track
    #[error("feature extraction failed: {0}")]
    EmbeddingGeneration(String),

    /// Computed embedding cannot be persisted
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    /// Bad bitrate, unsupported format combination or unreadable source
    #[error("invalid transcode request: {0}")]
    InvalidTranscodeRequest(String),

    /// Encoder could not be launched or exited unsuccessfully
    #[error("encoder process failure: {0}")]
    EncoderProcessFailure(String),

    /// No live transcoding job with this id
    #[error("transcoding job not found: {0}")]
    JobNotFound(Uuid),

    /// The job's encoder terminated unsuccessfully
    #[error("transcoding job {id} failed: {reason}")]
    JobFailed { id: Uuid, reason: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Persistence collaborator failed
    #[error("store error: {0}")]
    Store(String),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("gave up after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("i/o: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("bad configuration: {0}")]
    Configuration(String),

    /// Bug or broken invariant inside the pipeline
    #[error("internal: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Transient failures; a caller may re-enqueue the job
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Queue(_) | Self::Timeout { .. } | Self::Filesystem(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration(_) => ErrorSeverity::Critical,
            Self::Store(_)
            | Self::Queue(_)
            | Self::EncoderProcessFailure(_)
            | Self::ScanRootUnavailable { .. }
            | Self::Internal(_) => ErrorSeverity::Error,
            Self::Timeout { .. }
            | Self::JobFailed { .. }
            | Self::InvalidScanScope(_)
            | Self::AudioDecoding { .. }
            | Self::EmbeddingGeneration(_)
            | Self::InvalidEmbedding(_) => ErrorSeverity::Warning,
            // Unreadable files and unknown ids are routine during a scan
            _ => ErrorSeverity::Info,
        }
    }

    /// Queue name of the stage that raised this error
    pub fn job_context(&self) -> Option<&'static str> {
        match self {
            Self::InvalidScanScope(_)
            | Self::ScanRootUnavailable { .. }
            | Self::MetadataExtraction { .. } => Some("library_scan"),
            Self::AudioDecoding { .. }
            | Self::EmbeddingGeneration(_)
            | Self::InvalidEmbedding(_) => Some("embedding_generation"),
            Self::InvalidTranscodeRequest(_)
            | Self::EncoderProcessFailure(_)
            | Self::JobNotFound(_)
            | Self::JobFailed { .. } => Some("transcode"),
            _ => None,
        }
    }

    /// Emit one structured log line at the error's severity
    pub fn log(&self) {
        let stage = self.job_context().unwrap_or("pipeline");
        let retryable = self.is_retryable();
        match self.severity() {
            ErrorSeverity::Critical => {
                tracing::error!(error = %self, stage, retryable, alert = true, "Pipeline misconfigured")
            }
            ErrorSeverity::Error => {
                tracing::error!(error = %self, stage, retryable, "Pipeline job failed")
            }
            ErrorSeverity::Warning => {
                tracing::warn!(error = %self, stage, retryable, "Pipeline job failed")
            }
            ErrorSeverity::Info => tracing::info!(error = %self, stage, "Pipeline job skipped input"),
        }
    }

    pub fn metadata_extraction(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::MetadataExtraction {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn audio_decoding(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::AudioDecoding {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn scan_root_unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ScanRootUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn job_failed(id: Uuid, reason: impl Into<String>) -> Self {
        Self::JobFailed {
            id,
            reason: reason.into(),
        }
    }
}

/// How loudly a failure is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    /// Operator action needed
    Critical,
}

pub type WorkerResult<T> = Result<T, WorkerError>;

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        err.downcast::<WorkerError>()
            .unwrap_or_else(|other| Self::Internal(format!("{other:#}")))
    }
}

impl From<reef_shared_config::ConfigError> for WorkerError {
    fn from(err: reef_shared_config::ConfigError) -> Self {
        Self::Configuration(format!("{err}"))
    }
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            Self::Internal(format!("task panicked: {}", err))
        } else {
            Self::Internal(format!("task cancelled: {}", err))
        }
    }
}
