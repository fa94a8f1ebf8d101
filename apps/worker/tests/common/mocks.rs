//! Mock collaborators for worker integration tests
//!
//! Provides a recording progress sink, a deterministic feature extractor and
//! a shell-script encoder so jobs run without ffmpeg or real audio models.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reef_worker::error::{WorkerError, WorkerResult};
use reef_worker::jobs::embedding_generation::FeatureExtractor;
use reef_worker::progress::{ProgressSink, ScanFailure, ScanProgress, ScanSummary};
use reef_worker::transcode::{EncodePlan, EncodeRequest, EncodeTarget, Encoder};
use uuid::Uuid;

/// Progress sink that keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    progress: Mutex<Vec<ScanProgress>>,
    completed: Mutex<Vec<ScanSummary>>,
    failed: Mutex<Vec<ScanFailure>>,
    embeddings: Mutex<Vec<(String, Uuid)>>,
    embedding_failures: Mutex<Vec<(String, Uuid)>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> Vec<ScanProgress> {
        self.progress.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<ScanSummary> {
        self.completed.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<ScanFailure> {
        self.failed.lock().unwrap().clone()
    }

    pub fn embeddings(&self) -> Vec<(String, Uuid)> {
        self.embeddings.lock().unwrap().clone()
    }

    pub fn embedding_failures(&self) -> Vec<(String, Uuid)> {
        self.embedding_failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingProgressSink {
    async fn on_scan_progress(&self, progress: ScanProgress) {
        self.progress.lock().unwrap().push(progress);
    }

    async fn on_scan_completed(&self, summary: &ScanSummary) {
        self.completed.lock().unwrap().push(summary.clone());
    }

    async fn on_scan_failed(&self, failure: &ScanFailure) {
        self.failed.lock().unwrap().push(failure.clone());
    }

    async fn on_embedding_completed(&self, request_id: &str, track_id: Uuid) {
        self.embeddings
            .lock()
            .unwrap()
            .push((request_id.to_string(), track_id));
    }

    async fn on_embedding_failed(&self, request_id: &str, track_id: Uuid, _reason: &str) {
        self.embedding_failures
            .lock()
            .unwrap()
            .push((request_id.to_string(), track_id));
    }
}

/// Feature extractor returning a fixed vector
///
/// Files whose name contains `fail` produce an error and files whose name
/// contains `panic` make the extractor panic.
#[derive(Debug)]
pub struct MockFeatureExtractor {
    dimension: usize,
    output_dimension: usize,
    calls: AtomicUsize,
    seen: Mutex<HashSet<PathBuf>>,
}

impl MockFeatureExtractor {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            output_dimension: dimension,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Declares `dimension` but returns vectors of another length
    pub fn with_wrong_output(dimension: usize, output_dimension: usize) -> Self {
        Self {
            output_dimension,
            ..Self::new(dimension)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self, path: &Path) -> bool {
        self.seen.lock().unwrap().contains(path)
    }
}

impl FeatureExtractor for MockFeatureExtractor {
    fn model(&self) -> &str {
        "mock"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&self, path: &Path) -> WorkerResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().insert(path.to_path_buf());

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains("panic") {
            panic!("extractor exploded on {}", name);
        }
        if name.contains("fail") {
            return Err(WorkerError::audio_decoding(path.display().to_string(), "mock failure"));
        }

        let norm = (self.output_dimension as f32).sqrt();
        Ok(vec![1.0 / norm; self.output_dimension])
    }
}

/// Encoder that runs a shell script instead of ffmpeg
///
/// The script sees `OUTPUT` (single file), `PLAYLIST` and `JOB_DIR` in its
/// environment.
#[derive(Debug)]
pub struct ScriptEncoder {
    script: String,
    plans: AtomicUsize,
}

impl ScriptEncoder {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            plans: AtomicUsize::new(0),
        }
    }

    /// Writes the output in two steps with a pause in between
    pub fn progressive() -> Self {
        Self::new(r#"printf 'first-' > "$OUTPUT"; sleep 0.3; printf 'second' >> "$OUTPUT""#)
    }

    /// Writes the playlist and one segment, then keeps running for a while
    pub fn hls() -> Self {
        Self::new(
            r#"printf 'seg0' > "$JOB_DIR/segment_00000.ts"
printf '#EXTM3U\n#EXTINF:10.0,\nsegment_00000.ts\n' > "$PLAYLIST"
sleep 1
printf '#EXT-X-ENDLIST\n' >> "$PLAYLIST""#,
        )
    }

    /// Writes partial output, then fails
    pub fn failing() -> Self {
        Self::new(r#"printf 'partial' > "$OUTPUT"; exit 3"#)
    }

    /// Never finishes on its own
    pub fn hanging() -> Self {
        Self::new("sleep 30")
    }

    pub fn plans(&self) -> usize {
        self.plans.load(Ordering::SeqCst)
    }
}

impl Encoder for ScriptEncoder {
    fn plan(&self, request: &EncodeRequest<'_>) -> EncodePlan {
        self.plans.fetch_add(1, Ordering::SeqCst);

        let mut plan = EncodePlan::new("sh")
            .arg("-c")
            .arg(&self.script)
            .env("SOURCE", request.source.as_os_str())
            .env("JOB_DIR", request.job_dir.as_os_str());

        match request.target {
            EncodeTarget::SingleFile { output } => {
                plan = plan.env("OUTPUT", output.as_os_str());
            }
            EncodeTarget::Hls { playlist, .. } => {
                plan = plan.env("PLAYLIST", playlist.as_os_str());
            }
        }
        plan
    }
}
