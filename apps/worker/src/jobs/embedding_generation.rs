//! Audio embedding generation job
//!
//! Computes a timbre vector for each queued track and stores it. Vectors
//! back similarity search and recommendations in the API.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{WorkerError, WorkerResult};
use crate::jobs::audio::decode_mono;
use crate::jobs::spectral::{embed_samples, EMBEDDING_DIMENSION};
use crate::models::EmbeddingJob;
use crate::progress::ProgressSink;
use crate::queue::QueueReceiver;
use crate::store::{LibraryStore, TrackEmbedding};

/// Default job timeout (2 minutes)
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 120;

/// Default amount of audio analyzed per track
pub const DEFAULT_MAX_ANALYSIS_SECS: u32 = 60;

/// Computes an embedding from an audio file
///
/// Called on the blocking pool.
pub trait FeatureExtractor: Send + Sync {
    /// Identifier stored next to the vector
    fn model(&self) -> &str;

    /// Length of every vector this extractor returns
    fn dimension(&self) -> usize;

    fn extract(&self, path: &Path) -> WorkerResult<Vec<f32>>;
}

/// FFT spectral statistics over the first `max_analysis_secs` of audio
#[derive(Debug, Clone)]
pub struct SpectralEmbedder {
    max_analysis_secs: u32,
}

impl SpectralEmbedder {
    pub fn new(max_analysis_secs: u32) -> Self {
        Self { max_analysis_secs }
    }
}

impl Default for SpectralEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ANALYSIS_SECS)
    }
}

impl FeatureExtractor for SpectralEmbedder {
    fn model(&self) -> &str {
        "spectral-v1"
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }

    fn extract(&self, path: &Path) -> WorkerResult<Vec<f32>> {
        let audio = decode_mono(path, self.max_analysis_secs)?;
        tracing::trace!(
            path = %path.display(),
            seconds = audio.duration_secs(),
            sample_rate = audio.sample_rate,
            "Decoded audio for analysis"
        );
        embed_samples(&audio.samples, audio.sample_rate)
    }
}

/// Counters since the worker started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmbeddingStats {
    pub completed: usize,
    pub failed: usize,
}

/// Consumer of the embedding queue
pub struct EmbeddingWorker {
    store: Arc<dyn LibraryStore>,
    sink: Arc<dyn ProgressSink>,
    extractor: Arc<dyn FeatureExtractor>,
    job_timeout: Duration,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl EmbeddingWorker {
    pub fn new(
        store: Arc<dyn LibraryStore>,
        sink: Arc<dyn ProgressSink>,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Self {
        Self {
            store,
            sink,
            extractor,
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn with_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn stats(&self) -> EmbeddingStats {
        EmbeddingStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue one job at a time until every producer is gone
    pub async fn run(self: Arc<Self>, queue: QueueReceiver<EmbeddingJob>) {
        self.run_until(queue, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but closes the queue when `shutdown` fires
    /// and stops once the backlog is drained
    pub async fn run_until(
        self: Arc<Self>,
        mut queue: QueueReceiver<EmbeddingJob>,
        shutdown: CancellationToken,
    ) {
        let mut closing = false;
        tracing::info!(queue = queue.name(), "Embedding worker started");

        loop {
            let job = tokio::select! {
                job = queue.dequeue() => job,
                _ = shutdown.cancelled(), if !closing => {
                    tracing::info!(pending = queue.pending(), "Embedding queue closing");
                    queue.close();
                    closing = true;
                    continue;
                }
            };
            let Some(job) = job else { break };

            let track_id = job.track.id;
            let request_id = job.request_id.clone();
            let worker = self.clone();

            // A panicking job surfaces as a JoinError and the loop carries on
            let handle = tokio::spawn(async move { worker.process(job).await });
            if let Err(e) = handle.await {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(track_id = %track_id, error = %e, "Embedding task aborted");
                if let Some(request_id) = request_id.as_deref() {
                    let reason = WorkerError::from(e).to_string();
                    self.sink.on_embedding_failed(request_id, track_id, &reason).await;
                }
            }

            tracing::trace!(pending = queue.pending(), "Embedding queue depth");
        }

        let stats = self.stats();
        tracing::info!(
            completed = stats.completed,
            failed = stats.failed,
            "Embedding worker stopped"
        );
    }

    /// Compute, validate and persist the embedding for one track
    ///
    /// Failures are logged and counted here; the returned error is for
    /// callers that drive the worker directly.
    pub async fn process(&self, job: EmbeddingJob) -> WorkerResult<()> {
        let track_id = job.track.id;

        match self.execute(&job).await {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(request_id) = job.request_id.as_deref() {
                    self.sink.on_embedding_completed(request_id, track_id).await;
                }
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    track_id = %track_id,
                    request_id = ?job.request_id,
                    path = %job.track.file_path.display(),
                    error = %e,
                    "Embedding generation failed"
                );
                if let Some(request_id) = job.request_id.as_deref() {
                    self.sink
                        .on_embedding_failed(request_id, track_id, &e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &EmbeddingJob) -> WorkerResult<()> {
        let track_id = job.track.id;

        // The track may have been removed by a later scan
        if self.store.track(track_id).await?.is_none() {
            return Err(WorkerError::NotFound(format!("track {}", track_id)));
        }

        tracing::debug!(track_id = %track_id, "Generating embedding for track");

        let extractor = self.extractor.clone();
        let path = job.track.file_path.clone();
        let task = tokio::task::spawn_blocking(move || extractor.extract(&path));

        let vector = match timeout(self.job_timeout, task).await {
            Ok(joined) => joined??,
            Err(_) => {
                tracing::error!(
                    track_id = %track_id,
                    timeout_secs = self.job_timeout.as_secs(),
                    "Embedding generation timed out"
                );
                return Err(WorkerError::Timeout {
                    seconds: self.job_timeout.as_secs(),
                });
            }
        };

        validate_embedding(&vector, self.extractor.dimension())?;

        self.store
            .save_embedding(TrackEmbedding {
                track_id,
                vector,
                model: self.extractor.model().to_string(),
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(track_id = %track_id, "Embedding generation completed");
        Ok(())
    }
}

impl std::fmt::Debug for EmbeddingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingWorker")
            .field("model", &self.extractor.model())
            .field("job_timeout", &self.job_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Reject vectors the store cannot index
fn validate_embedding(embedding: &[f32], expected_dimension: usize) -> WorkerResult<()> {
    if embedding.len() != expected_dimension {
        return Err(WorkerError::InvalidEmbedding(format!(
            "expected {} dimensions, got {}",
            expected_dimension,
            embedding.len()
        )));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(WorkerError::InvalidEmbedding(
            "embedding contains non-finite values (NaN/inf)".to_string(),
        ));
    }
    Ok(())
}
