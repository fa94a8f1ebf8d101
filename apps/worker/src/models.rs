//! Job payloads and the library/track handles they carry

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered music library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicLibrary {
    pub id: Uuid,
    /// Directory the library is rooted at
    pub root: PathBuf,
    /// Completion time of the last successful scan, `None` before the first one
    pub last_scan: Option<DateTime<Utc>>,
}

impl MusicLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            root: root.into(),
            last_scan: None,
        }
    }
}

/// Handle on a persisted track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackRef {
    pub id: Uuid,
    pub file_path: PathBuf,
}

impl TrackRef {
    pub fn new(id: Uuid, file_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            file_path: file_path.into(),
        }
    }
}

/// Why a scan was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTrigger {
    /// User-requested through the API
    #[default]
    Manual,
    /// A filesystem watcher saw a change
    FileSystemEvent,
    /// First scan after the library was registered
    LibraryAdded,
    /// Periodic rescan
    Scheduled,
}

impl std::fmt::Display for ScanTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::FileSystemEvent => write!(f, "file_system_event"),
            Self::LibraryAdded => write!(f, "library_added"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Library scan job payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub library: MusicLibrary,

    /// Optional: Scan only this subdirectory of the library
    pub specific_directory: Option<PathBuf>,

    /// Skip files whose size and modification time are unchanged
    #[serde(default)]
    pub incremental: bool,

    /// Correlates progress reports with the caller's request
    pub request_id: Option<Uuid>,

    #[serde(default)]
    pub trigger: ScanTrigger,
}

impl ScanJob {
    /// Full, non-incremental scan of a library
    pub fn full(library: MusicLibrary, trigger: ScanTrigger) -> Self {
        Self {
            library,
            specific_directory: None,
            incremental: false,
            request_id: None,
            trigger,
        }
    }

    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }

    pub fn in_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.specific_directory = Some(directory.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Whether removed files may be deleted from the store
    pub fn is_full_scope(&self) -> bool {
        self.specific_directory.is_none()
    }
}

/// Embedding generation job payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    /// Track to generate an embedding for
    pub track: TrackRef,
    /// Request that caused this job, reported back on completion
    pub request_id: Option<String>,
}

impl EmbeddingJob {
    pub fn new(track: TrackRef) -> Self {
        Self {
            track,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_job_builders() {
        let library = MusicLibrary::new("/music");
        let request_id = Uuid::new_v4();
        let job = ScanJob::full(library.clone(), ScanTrigger::FileSystemEvent)
            .incremental()
            .in_directory("/music/Artist")
            .with_request_id(request_id);

        assert_eq!(job.library, library);
        assert!(job.incremental);
        assert!(!job.is_full_scope());
        assert_eq!(job.request_id, Some(request_id));
        assert_eq!(job.trigger, ScanTrigger::FileSystemEvent);
    }

    #[test]
    fn test_scan_job_deserializes_with_defaults() {
        let library = MusicLibrary::new("/music");
        let json = serde_json::json!({
            "library": library,
            "specific_directory": null,
            "request_id": null,
        });
        let job: ScanJob = serde_json::from_value(json).unwrap();
        assert!(!job.incremental);
        assert_eq!(job.trigger, ScanTrigger::Manual);
        assert!(job.is_full_scope());
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(ScanTrigger::LibraryAdded.to_string(), "library_added");
        assert_eq!(
            serde_json::to_string(&ScanTrigger::FileSystemEvent).unwrap(),
            "\"file_system_event\""
        );
    }
}
