//! Scan progress reporting
//!
//! The pipeline never talks to the real-time transport directly; it reports
//! through a [`ProgressSink`]. [`ScanReporter`] keeps an in-memory table of
//! active scans (so the API can answer "how far along is request X") and
//! forwards every report to an inner sink.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ScanTrigger;

/// Periodic progress for one scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub request_id: Option<Uuid>,
    pub files_processed: usize,
    pub files_total: usize,
    pub current_path: PathBuf,
}

/// A file that could not be indexed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Completion summary of a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub request_id: Option<Uuid>,
    pub library_id: Uuid,
    pub trigger: ScanTrigger,
    pub incremental: bool,
    pub files_total: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: Vec<FailedFile>,
    /// Embedding jobs accepted by the embedding queue for this scan
    #[serde(default)]
    pub embeddings_queued: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ScanSummary {
    /// Files that ended up reconciled (new, changed or verified unchanged)
    pub fn succeeded(&self) -> usize {
        self.added + self.updated + self.unchanged
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

/// A scan that failed as a whole
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFailure {
    pub request_id: Option<Uuid>,
    pub library_id: Uuid,
    pub error: String,
}

/// Receiver of pipeline progress, implemented by the push transport
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_scan_progress(&self, progress: ScanProgress);

    async fn on_scan_completed(&self, _summary: &ScanSummary) {}

    async fn on_scan_failed(&self, _failure: &ScanFailure) {}

    async fn on_embedding_completed(&self, _request_id: &str, _track_id: Uuid) {}

    async fn on_embedding_failed(&self, _request_id: &str, _track_id: Uuid, _reason: &str) {}
}

/// Sink that only writes structured log lines
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

#[async_trait]
impl ProgressSink for TracingProgressSink {
    async fn on_scan_progress(&self, progress: ScanProgress) {
        tracing::debug!(
            request_id = ?progress.request_id,
            processed = progress.files_processed,
            total = progress.files_total,
            path = %progress.current_path.display(),
            "Scan progress"
        );
    }

    async fn on_scan_completed(&self, summary: &ScanSummary) {
        tracing::info!(
            request_id = ?summary.request_id,
            library_id = %summary.library_id,
            added = summary.added,
            updated = summary.updated,
            unchanged = summary.unchanged,
            removed = summary.removed,
            failed = summary.failed.len(),
            duration_ms = summary.duration_ms(),
            "Scan completed"
        );
    }

    async fn on_scan_failed(&self, failure: &ScanFailure) {
        tracing::warn!(
            request_id = ?failure.request_id,
            library_id = %failure.library_id,
            error = %failure.error,
            "Scan failed"
        );
    }

    async fn on_embedding_completed(&self, request_id: &str, track_id: Uuid) {
        tracing::debug!(request_id, track_id = %track_id, "Embedding completed");
    }

    async fn on_embedding_failed(&self, request_id: &str, track_id: Uuid, reason: &str) {
        tracing::debug!(request_id, track_id = %track_id, reason, "Embedding failed");
    }
}

/// Progress of one request as seen by [`ScanReporter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanJobProgress {
    pub request_id: Uuid,
    pub files_processed: usize,
    pub files_total: usize,
    pub scan_completed: bool,
    pub embeddings_expected: usize,
    pub embeddings_completed: usize,
    pub embeddings_failed: usize,
    pub started_at: DateTime<Utc>,
}

impl ScanJobProgress {
    /// Scan done and every queued embedding accounted for
    fn is_finished(&self) -> bool {
        self.scan_completed
            && self.embeddings_completed + self.embeddings_failed >= self.embeddings_expected
    }
}

/// Tracks active scans by request id and forwards reports downstream
pub struct ScanReporter {
    scans: DashMap<Uuid, ScanJobProgress>,
    inner: Arc<dyn ProgressSink>,
}

impl ScanReporter {
    pub fn new(inner: Arc<dyn ProgressSink>) -> Self {
        Self {
            scans: DashMap::new(),
            inner,
        }
    }

    pub fn progress(&self, request_id: Uuid) -> Option<ScanJobProgress> {
        self.scans.get(&request_id).map(|p| p.clone())
    }

    pub fn active_scans(&self) -> Vec<ScanJobProgress> {
        self.scans.iter().map(|p| p.value().clone()).collect()
    }
}

impl std::fmt::Debug for ScanReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanReporter")
            .field("active_scans", &self.scans.len())
            .finish()
    }
}

#[async_trait]
impl ProgressSink for ScanReporter {
    async fn on_scan_progress(&self, progress: ScanProgress) {
        if let Some(request_id) = progress.request_id {
            let mut entry = self
                .scans
                .entry(request_id)
                .or_insert_with(|| ScanJobProgress {
                    request_id,
                    files_processed: 0,
                    files_total: progress.files_total,
                    scan_completed: false,
                    embeddings_expected: 0,
                    embeddings_completed: 0,
                    embeddings_failed: 0,
                    started_at: Utc::now(),
                });
            entry.files_processed = progress.files_processed;
            entry.files_total = progress.files_total;
        }
        self.inner.on_scan_progress(progress).await;
    }

    async fn on_scan_completed(&self, summary: &ScanSummary) {
        if let Some(request_id) = summary.request_id {
            let finished = self.scans.get_mut(&request_id).map(|mut entry| {
                entry.scan_completed = true;
                entry.files_processed = summary.files_total;
                entry.embeddings_expected = summary.embeddings_queued;
                entry.is_finished()
            });
            if finished.unwrap_or(false) {
                self.scans.remove(&request_id);
            }
        }
        self.inner.on_scan_completed(summary).await;
    }

    async fn on_scan_failed(&self, failure: &ScanFailure) {
        if let Some(request_id) = failure.request_id {
            self.scans.remove(&request_id);
        }
        self.inner.on_scan_failed(failure).await;
    }

    async fn on_embedding_completed(&self, request_id: &str, track_id: Uuid) {
        self.settle_embedding(request_id, |entry| entry.embeddings_completed += 1);
        self.inner.on_embedding_completed(request_id, track_id).await;
    }

    async fn on_embedding_failed(&self, request_id: &str, track_id: Uuid, reason: &str) {
        self.settle_embedding(request_id, |entry| entry.embeddings_failed += 1);
        self.inner.on_embedding_failed(request_id, track_id, reason).await;
    }
}

impl ScanReporter {
    fn settle_embedding(&self, request_id: &str, update: impl FnOnce(&mut ScanJobProgress)) {
        let Ok(id) = request_id.parse::<Uuid>() else {
            return;
        };
        let finished = self.scans.get_mut(&id).map(|mut entry| {
            update(&mut entry);
            entry.is_finished()
        });
        if finished.unwrap_or(false) {
            self.scans.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(request_id: Uuid, added: usize) -> ScanSummary {
        let now = Utc::now();
        ScanSummary {
            request_id: Some(request_id),
            library_id: Uuid::new_v4(),
            trigger: ScanTrigger::Manual,
            incremental: false,
            files_total: added,
            added,
            updated: 0,
            unchanged: 0,
            removed: 0,
            failed: vec![],
            embeddings_queued: added,
            started_at: now,
            completed_at: now,
        }
    }

    fn progress(request_id: Uuid, processed: usize, total: usize) -> ScanProgress {
        ScanProgress {
            request_id: Some(request_id),
            files_processed: processed,
            files_total: total,
            current_path: PathBuf::from("/music/a.flac"),
        }
    }

    #[tokio::test]
    async fn test_reporter_tracks_until_embeddings_finish() {
        let reporter = ScanReporter::new(Arc::new(TracingProgressSink));
        let request_id = Uuid::new_v4();

        reporter.on_scan_progress(progress(request_id, 1, 2)).await;
        assert_eq!(reporter.progress(request_id).unwrap().files_processed, 1);

        reporter.on_scan_completed(&summary(request_id, 2)).await;
        let entry = reporter.progress(request_id).unwrap();
        assert!(entry.scan_completed);
        assert_eq!(entry.embeddings_expected, 2);

        let request = request_id.to_string();
        reporter.on_embedding_completed(&request, Uuid::new_v4()).await;
        assert_eq!(reporter.active_scans().len(), 1);
        reporter.on_embedding_completed(&request, Uuid::new_v4()).await;
        assert!(reporter.progress(request_id).is_none());
    }

    #[tokio::test]
    async fn test_failed_embeddings_still_finish_the_scan() {
        let reporter = ScanReporter::new(Arc::new(TracingProgressSink));
        let request_id = Uuid::new_v4();
        let request = request_id.to_string();

        reporter.on_scan_progress(progress(request_id, 2, 2)).await;
        reporter.on_scan_completed(&summary(request_id, 2)).await;
        reporter.on_embedding_completed(&request, Uuid::new_v4()).await;
        assert_eq!(reporter.active_scans().len(), 1);

        reporter
            .on_embedding_failed(&request, Uuid::new_v4(), "cannot decode")
            .await;
        assert!(reporter.active_scans().is_empty());
    }

    #[tokio::test]
    async fn test_expected_embeddings_follow_queued_count() {
        let reporter = ScanReporter::new(Arc::new(TracingProgressSink));
        let request_id = Uuid::new_v4();

        // Two tracks added but the embedding queue took none of them
        let mut done = summary(request_id, 2);
        done.embeddings_queued = 0;
        reporter.on_scan_progress(progress(request_id, 2, 2)).await;
        reporter.on_scan_completed(&done).await;
        assert!(reporter.progress(request_id).is_none());
    }

    #[tokio::test]
    async fn test_reporter_drops_scan_without_new_tracks() {
        let reporter = ScanReporter::new(Arc::new(TracingProgressSink));
        let request_id = Uuid::new_v4();

        reporter.on_scan_progress(progress(request_id, 1, 1)).await;
        reporter.on_scan_completed(&summary(request_id, 0)).await;
        assert!(reporter.active_scans().is_empty());
    }

    #[tokio::test]
    async fn test_reporter_drops_failed_scan() {
        let reporter = ScanReporter::new(Arc::new(TracingProgressSink));
        let request_id = Uuid::new_v4();

        reporter.on_scan_progress(progress(request_id, 0, 10)).await;
        reporter
            .on_scan_failed(&ScanFailure {
                request_id: Some(request_id),
                library_id: Uuid::new_v4(),
                error: "scan root unavailable".to_string(),
            })
            .await;
        assert!(reporter.progress(request_id).is_none());
    }

    #[test]
    fn test_summary_succeeded_counts() {
        let mut s = summary(Uuid::new_v4(), 3);
        s.updated = 1;
        s.unchanged = 2;
        s.failed.push(FailedFile {
            path: PathBuf::from("/music/bad.flac"),
            reason: "bad header".to_string(),
        });
        assert_eq!(s.succeeded(), 6);
    }
}
