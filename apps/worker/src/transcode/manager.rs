//! Transcoding job lifecycle
//!
//! [`TranscodeJobManager`] owns every live job: it validates requests,
//! allocates per-job directories, starts supervised encoder processes and
//! serves their output while it is still being written. Jobs are removed by
//! explicit cancellation, by the idle reaper or when their [`RequestScope`]
//! ends.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use reef_shared_config::TranscodeConfig;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::encoder::{EncodeRequest, EncodeTarget, Encoder, FfmpegEncoder, TranscodeFormat};
use super::job::{TranscodeRequestType, TranscodingJob, TranscodingJobRequest};
use super::process::SupervisedProcess;
use super::stream::{
    file_stream, follow_file, snapshot_stream, Activity, TrackStream, HLS_PLAYLIST_CONTENT_TYPE,
    HLS_SEGMENT_CONTENT_TYPE,
};
use crate::error::{WorkerError, WorkerResult};
use crate::models::TrackRef;

pub const PLAYLIST_FILE_NAME: &str = "playlist.m3u8";
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";

/// How often `create_job` checks for an HLS playlist
const PLAYLIST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a killed encoder to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Manager-owned state of one job
#[derive(Debug)]
struct JobEntry {
    id: Uuid,
    source_track: TrackRef,
    request_type: TranscodeRequestType,
    format: TranscodeFormat,
    bitrate: u32,
    dir: PathBuf,
    output_path: Option<PathBuf>,
    playlist_path: Option<PathBuf>,
    process: SupervisedProcess,
    activity: Arc<Activity>,
}

impl JobEntry {
    fn snapshot(&self) -> TranscodingJob {
        let process_state = self.process.state();
        TranscodingJob {
            id: self.id,
            source_track: self.source_track.clone(),
            output_path: self.output_path.clone(),
            hls_playlist_path: self.playlist_path.clone(),
            request_type: self.request_type,
            requested_format: self.format,
            bitrate: self.bitrate,
            process_exited: process_state.is_terminal(),
            process_state,
        }
    }

    fn failed(&self) -> Option<WorkerError> {
        self.process
            .state()
            .failure_reason()
            .map(|reason| WorkerError::job_failed(self.id, reason))
    }
}

struct Inner {
    config: TranscodeConfig,
    encoder: Arc<dyn Encoder>,
    jobs: DashMap<Uuid, Arc<JobEntry>>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// Creates, serves and reclaims transcoding jobs
#[derive(Clone)]
pub struct TranscodeJobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TranscodeJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeJobManager")
            .field("work_dir", &self.inner.config.work_dir)
            .field("max_concurrent", &self.inner.config.max_concurrent)
            .field("jobs", &self.inner.jobs.len())
            .field("available_slots", &self.inner.slots.available_permits())
            .finish()
    }
}

impl TranscodeJobManager {
    /// Manager driving ffmpeg as configured
    pub fn new(config: TranscodeConfig) -> Self {
        let encoder = Arc::new(FfmpegEncoder::new(config.ffmpeg_path.clone()));
        Self::with_encoder(config, encoder)
    }

    pub fn with_encoder(config: TranscodeConfig, encoder: Arc<dyn Encoder>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                encoder,
                jobs: DashMap::new(),
                slots,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.inner.config
    }

    /// Number of live jobs
    pub fn job_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Encoder processes currently holding a slot
    pub fn active_processes(&self) -> usize {
        self.inner.config.max_concurrent.max(1) - self.inner.slots.available_permits()
    }

    /// Start a transcoding job
    ///
    /// Single-file jobs return as soon as the encoder is scheduled. HLS jobs
    /// return once the playlist exists so clients can start playback early.
    pub async fn create_job(&self, request: TranscodingJobRequest) -> WorkerResult<TranscodingJob> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WorkerError::EncoderProcessFailure(
                "transcoder is shutting down".to_string(),
            ));
        }
        validate_request(&request).await?;

        let id = Uuid::new_v4();
        let dir = self.inner.config.work_dir.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        // `produced` must be non-empty after a clean exit for the job to succeed
        let (target, produced, output_path, playlist_path) = match request.request_type {
            TranscodeRequestType::SingleFile => {
                let output = dir.join(format!("output.{}", request.format.extension()));
                (
                    EncodeTarget::SingleFile {
                        output: output.clone(),
                    },
                    output.clone(),
                    Some(output),
                    None,
                )
            }
            TranscodeRequestType::Hls => {
                let playlist = dir.join(PLAYLIST_FILE_NAME);
                (
                    EncodeTarget::Hls {
                        playlist: playlist.clone(),
                        segment_pattern: dir.join(SEGMENT_PATTERN),
                        segment_secs: self.inner.config.hls_segment_secs,
                    },
                    playlist.clone(),
                    None,
                    Some(playlist),
                )
            }
        };

        let plan = self.inner.encoder.plan(&EncodeRequest {
            source: &request.source_track.file_path,
            job_dir: &dir,
            target: &target,
            format: request.format,
            bitrate: request.bitrate,
        });
        let process =
            SupervisedProcess::spawn_producing(id, plan, self.inner.slots.clone(), produced);

        let entry = Arc::new(JobEntry {
            id,
            source_track: request.source_track,
            request_type: request.request_type,
            format: request.format,
            bitrate: request.bitrate,
            dir,
            output_path,
            playlist_path,
            process,
            activity: Arc::new(Activity::new()),
        });
        self.inner.jobs.insert(id, entry.clone());

        tracing::info!(
            job_id = %id,
            track_id = %entry.source_track.id,
            request_type = ?entry.request_type,
            format = %entry.format,
            bitrate = entry.bitrate,
            "Transcoding job created"
        );

        if entry.request_type == TranscodeRequestType::Hls {
            if let Err(e) = self.wait_for_playlist(&entry).await {
                self.cancel_job(id).await;
                return Err(e);
            }
        }

        Ok(entry.snapshot())
    }

    async fn wait_for_playlist(&self, entry: &JobEntry) -> WorkerResult<()> {
        let Some(playlist) = entry.playlist_path.as_deref() else {
            return Ok(());
        };
        // Time spent waiting for an encoder slot does not count
        let queued_at = tokio::time::Instant::now();
        entry.process.wait_started().await;

        let timeout = self.inner.config.playlist_timeout();
        let started = tokio::time::Instant::now();

        loop {
            // Check the state first so a playlist written right before exit still counts
            let state = entry.process.state();
            if playlist_ready(playlist).await {
                tracing::debug!(
                    job_id = %entry.id,
                    queued_ms = (started - queued_at).as_millis() as u64,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "HLS playlist available"
                );
                return Ok(());
            }
            if state.is_terminal() {
                let reason = state
                    .failure_reason()
                    .unwrap_or_else(|| "encoder exited without writing a playlist".to_string());
                return Err(WorkerError::EncoderProcessFailure(reason));
            }
            if started.elapsed() >= timeout {
                return Err(WorkerError::EncoderProcessFailure(format!(
                    "playlist not written within {} seconds",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(PLAYLIST_POLL_INTERVAL).await;
        }
    }

    /// Stream a job's output
    ///
    /// Single-file output is followed while the encoder is still writing and
    /// gets a length once it finished. HLS jobs return the current playlist.
    pub async fn get_stream(&self, job_id: Uuid) -> WorkerResult<TrackStream> {
        let entry = self.entry(job_id)?;
        entry.activity.touch();

        if let Some(err) = entry.failed() {
            return Err(err);
        }

        match entry.request_type {
            TranscodeRequestType::SingleFile => {
                let output = entry
                    .output_path
                    .clone()
                    .ok_or_else(|| WorkerError::Internal(format!("job {} has no output", job_id)))?;
                let file_name = format!(
                    "{}.{}",
                    entry.source_track.id,
                    entry.format.extension()
                );
                let content_type = entry.format.content_type().to_string();

                if entry.process.state().is_success() {
                    let file = tokio::fs::File::open(&output).await?;
                    let length = file.metadata().await?.len();
                    return Ok(TrackStream {
                        stream: file_stream(file),
                        content_type,
                        length: Some(length),
                        file_name,
                    });
                }

                Ok(TrackStream {
                    stream: follow_file(output, entry.process.subscribe(), entry.activity.clone()),
                    content_type,
                    length: None,
                    file_name,
                })
            }
            TranscodeRequestType::Hls => {
                let playlist = entry
                    .playlist_path
                    .as_deref()
                    .ok_or_else(|| WorkerError::Internal(format!("job {} has no playlist", job_id)))?;
                let content = Bytes::from(tokio::fs::read(playlist).await?);
                Ok(TrackStream {
                    length: Some(content.len() as u64),
                    stream: snapshot_stream(content),
                    content_type: HLS_PLAYLIST_CONTENT_TYPE.to_string(),
                    file_name: PLAYLIST_FILE_NAME.to_string(),
                })
            }
        }
    }

    /// Stream one HLS segment named in the playlist
    pub async fn get_segment(&self, job_id: Uuid, name: &str) -> WorkerResult<TrackStream> {
        let entry = self.entry(job_id)?;
        if entry.request_type != TranscodeRequestType::Hls {
            return Err(WorkerError::InvalidTranscodeRequest(format!(
                "job {} is not an HLS job",
                job_id
            )));
        }
        if !is_plain_file_name(name) {
            return Err(WorkerError::InvalidTranscodeRequest(format!(
                "invalid segment name: {}",
                name
            )));
        }
        entry.activity.touch();

        let path = entry.dir.join(name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkerError::NotFound(format!("segment {} of job {}", name, job_id)))
            }
            Err(e) => return Err(e.into()),
        };
        let length = file.metadata().await?.len();

        Ok(TrackStream {
            stream: file_stream(file),
            content_type: HLS_SEGMENT_CONTENT_TYPE.to_string(),
            length: Some(length),
            file_name: name.to_string(),
        })
    }

    /// Snapshot of a live job
    pub fn job(&self, job_id: Uuid) -> WorkerResult<TranscodingJob> {
        Ok(self.entry(job_id)?.snapshot())
    }

    pub fn jobs(&self) -> Vec<TranscodingJob> {
        self.inner.jobs.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Wait until the job's encoder has terminated
    pub async fn wait_for_exit(&self, job_id: Uuid) -> WorkerResult<TranscodingJob> {
        let entry = self.entry(job_id)?;
        entry.process.wait().await;
        Ok(entry.snapshot())
    }

    /// Kill the encoder, delete the job's files and forget the job
    ///
    /// Returns whether the job was still live; cancelling twice is harmless.
    pub async fn cancel_job(&self, job_id: Uuid) -> bool {
        let Some((_, entry)) = self.inner.jobs.remove(&job_id) else {
            return false;
        };

        entry.process.kill();
        let state = match tokio::time::timeout(KILL_GRACE, entry.process.wait()).await {
            Ok(state) => state,
            Err(_) => {
                tracing::warn!(job_id = %job_id, "Encoder did not stop in time");
                entry.process.state()
            }
        };

        match tokio::fs::remove_dir_all(&entry.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                job_id = %job_id,
                dir = %entry.dir.display(),
                error = %e,
                "Failed to remove job directory"
            ),
        }

        tracing::info!(job_id = %job_id, state = %state, "Transcoding job cancelled");
        true
    }

    /// Cancel jobs whose output was not requested within the idle timeout
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let idle: Vec<Uuid> = self
            .inner
            .jobs
            .iter()
            .filter(|e| e.value().activity.idle_for() >= idle_timeout)
            .map(|e| *e.key())
            .collect();

        let mut reaped = 0;
        for job_id in idle {
            if self.cancel_job(job_id).await {
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "Reclaimed idle transcoding jobs");
        }
        reaped
    }

    /// Run [`reap_idle`](Self::reap_idle) periodically until shutdown
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = (self.inner.config.idle_timeout() / 2).max(Duration::from_millis(50));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap_idle().await;
                    }
                }
            }
            tracing::debug!("Transcode reaper stopped");
        })
    }

    /// Group the jobs of one request so they are released together
    pub fn request_scope(&self) -> RequestScope {
        RequestScope {
            manager: self.clone(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Reject new jobs, cancel every live one and clear the work directory
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let ids: Vec<Uuid> = self.inner.jobs.iter().map(|e| *e.key()).collect();
        let count = ids.len();
        for id in ids {
            self.cancel_job(id).await;
        }
        let purged = self.purge_work_dir().await;
        tracing::info!(cancelled = count, purged, "Transcode manager shut down");
    }

    /// Delete job directories no live job owns, returning how many went
    ///
    /// Only directories named after a job id are touched.
    pub async fn purge_work_dir(&self) -> usize {
        let work_dir = &self.inner.config.work_dir;
        let mut entries = match tokio::fs::read_dir(work_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(dir = %work_dir.display(), error = %e, "Cannot read transcode work directory");
                return 0;
            }
        };

        let mut purged = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Stopped clearing transcode work directory");
                    break;
                }
            };
            let Some(job_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            if self.inner.jobs.contains_key(&job_id) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) => tracing::warn!(
                    dir = %entry.path().display(),
                    error = %e,
                    "Failed to remove stale job directory"
                ),
            }
        }
        purged
    }

    fn entry(&self, job_id: Uuid) -> WorkerResult<Arc<JobEntry>> {
        self.inner
            .jobs
            .get(&job_id)
            .map(|e| e.value().clone())
            .ok_or(WorkerError::JobNotFound(job_id))
    }
}

/// Jobs created on behalf of one request context
///
/// Ending the scope, explicitly or by dropping it, cancels its jobs.
pub struct RequestScope {
    manager: TranscodeJobManager,
    jobs: Mutex<Vec<Uuid>>,
}

impl RequestScope {
    pub async fn create_job(&self, request: TranscodingJobRequest) -> WorkerResult<TranscodingJob> {
        let job = self.manager.create_job(request).await?;
        self.owned().push(job.id);
        Ok(job)
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.owned().clone()
    }

    /// Cancel every job created through this scope
    pub async fn end(self) {
        let ids = std::mem::take(&mut *self.owned());
        for id in ids {
            self.manager.cancel_job(id).await;
        }
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, Vec<Uuid>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        let ids = std::mem::take(&mut *self.owned());
        if ids.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                handle.spawn(async move {
                    for id in ids {
                        manager.cancel_job(id).await;
                    }
                });
            }
            Err(_) => {
                // No runtime to clean up on; at least stop the encoders
                for id in ids {
                    if let Some((_, entry)) = self.manager.inner.jobs.remove(&id) {
                        entry.process.kill();
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("jobs", &self.job_ids())
            .finish()
    }
}

async fn validate_request(request: &TranscodingJobRequest) -> WorkerResult<()> {
    if request.bitrate == 0 {
        return Err(WorkerError::InvalidTranscodeRequest(
            "bitrate must be greater than zero".to_string(),
        ));
    }
    if request.request_type == TranscodeRequestType::Hls && !request.format.supports_hls() {
        return Err(WorkerError::InvalidTranscodeRequest(format!(
            "{} cannot be segmented for HLS",
            request.format
        )));
    }

    let source = &request.source_track.file_path;
    let readable = match tokio::fs::metadata(source).await {
        Ok(meta) if meta.is_file() => tokio::fs::File::open(source).await.is_ok(),
        _ => false,
    };
    if !readable {
        return Err(WorkerError::InvalidTranscodeRequest(format!(
            "source file is not readable: {}",
            source.display()
        )));
    }
    Ok(())
}

async fn playlist_ready(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.len() > 0)
}

/// A single normal path component, no separators or dot entries
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("segment_00000.ts", true)]
    #[case("playlist.m3u8", true)]
    #[case("", false)]
    #[case("..", false)]
    #[case(".", false)]
    #[case("../secret", false)]
    #[case("/etc/passwd", false)]
    #[case("nested/segment.ts", false)]
    #[case("..\\secret", false)]
    fn test_plain_file_name(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_plain_file_name(name), expected);
    }

    #[tokio::test]
    async fn test_validate_rejects_zero_bitrate() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.flac");
        std::fs::write(&source, b"x").unwrap();

        let request = TranscodingJobRequest::single_file(TrackRef::new(Uuid::new_v4(), &source), 0);
        assert!(matches!(
            validate_request(&request).await,
            Err(WorkerError::InvalidTranscodeRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_rejects_flac_hls() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.flac");
        std::fs::write(&source, b"x").unwrap();

        let request = TranscodingJobRequest::hls(TrackRef::new(Uuid::new_v4(), &source), 128)
            .with_format(TranscodeFormat::Flac);
        assert!(validate_request(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_source() {
        let request = TranscodingJobRequest::single_file(
            TrackRef::new(Uuid::new_v4(), "/no/such/track.flac"),
            128,
        );
        assert!(matches!(
            validate_request(&request).await,
            Err(WorkerError::InvalidTranscodeRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_only_removes_job_directories() {
        let work_dir = tempfile::tempdir().unwrap();
        let stale = work_dir.path().join(Uuid::new_v4().to_string());
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join(PLAYLIST_FILE_NAME), b"#EXTM3U").unwrap();
        std::fs::create_dir(work_dir.path().join("keep-me")).unwrap();

        let manager = TranscodeJobManager::new(TranscodeConfig::with_work_dir(work_dir.path()));
        manager.shutdown().await;

        assert!(!stale.exists());
        assert!(work_dir.path().join("keep-me").is_dir());
        assert_eq!(manager.purge_work_dir().await, 0);
    }
}
