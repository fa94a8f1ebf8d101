//! Library scanning job
//!
//! Walks a library (or one directory of it), extracts tags from every audio
//! file and reconciles the result with the store. New and changed tracks are
//! queued for embedding generation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{WorkerError, WorkerResult};
use crate::events::EventHub;
use crate::jobs::metadata::{extract_metadata, is_audio_file, AudioMetadata, FileStamp};
use crate::models::{EmbeddingJob, MusicLibrary, ScanJob, TrackRef};
use crate::progress::{FailedFile, ProgressSink, ScanFailure, ScanProgress, ScanSummary};
use crate::queue::{QueueReceiver, QueueSender};
use crate::store::{AlbumTag, CatalogueTags, LibraryStore, TrackRecord, UpsertOutcome};

/// Where a scan job currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPhase {
    Received,
    Enumerating,
    Processing(PathBuf),
    Reconciling,
    Completed,
    Failed,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Enumerating => write!(f, "enumerating"),
            Self::Processing(path) => write!(f, "processing({})", path.display()),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Keyed async locks, one per library
#[derive(Debug, Default)]
pub struct LibraryLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl LibraryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, library_id: Uuid) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is not held across the await
        let lock = self
            .locks
            .entry(library_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScanWorkerConfig {
    /// Report progress every this many files
    pub progress_interval: usize,
    /// Scan jobs allowed to run at the same time
    pub max_concurrent_scans: usize,
}

impl Default for ScanWorkerConfig {
    fn default() -> Self {
        Self {
            progress_interval: 25,
            max_concurrent_scans: 1,
        }
    }
}

/// A file whose tags were read and that needs reconciling
struct ExtractedFile {
    path: PathBuf,
    stamp: FileStamp,
    metadata: AudioMetadata,
    existing: Option<TrackRecord>,
}

/// Consumer of the scan queue
pub struct LibraryScanWorker {
    store: Arc<dyn LibraryStore>,
    sink: Arc<dyn ProgressSink>,
    events: Arc<EventHub>,
    embeddings: Option<QueueSender<EmbeddingJob>>,
    locks: Arc<LibraryLocks>,
    config: ScanWorkerConfig,
}

impl LibraryScanWorker {
    pub fn new(
        store: Arc<dyn LibraryStore>,
        sink: Arc<dyn ProgressSink>,
        events: Arc<EventHub>,
        config: ScanWorkerConfig,
    ) -> Self {
        Self {
            store,
            sink,
            events,
            embeddings: None,
            locks: Arc::new(LibraryLocks::new()),
            config,
        }
    }

    /// Queue new and changed tracks for embedding generation
    pub fn with_embedding_queue(mut self, queue: QueueSender<EmbeddingJob>) -> Self {
        self.embeddings = Some(queue);
        self
    }

    pub fn with_locks(mut self, locks: Arc<LibraryLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Drain the queue until every producer is gone
    pub async fn run(self: Arc<Self>, queue: QueueReceiver<ScanJob>) {
        self.run_until(queue, CancellationToken::new()).await
    }

    /// Drain the queue until it is closed or `shutdown` fires
    ///
    /// On shutdown the queue stops accepting jobs and the backlog is still
    /// processed. Each job runs in its own task so a panic only loses that
    /// job. On return every started job has finished.
    pub async fn run_until(
        self: Arc<Self>,
        mut queue: QueueReceiver<ScanJob>,
        shutdown: CancellationToken,
    ) {
        let slots = self.config.max_concurrent_scans.max(1);
        let semaphore = Arc::new(Semaphore::new(slots));
        let mut closing = false;

        tracing::info!(queue = queue.name(), max_concurrent = slots, "Library scan worker started");

        loop {
            let job = tokio::select! {
                job = queue.dequeue() => job,
                _ = shutdown.cancelled(), if !closing => {
                    tracing::info!(pending = queue.pending(), "Scan queue closing");
                    queue.close();
                    closing = true;
                    continue;
                }
            };
            let Some(job) = job else { break };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let library_id = job.library.id;
            let request_id = job.request_id;
            let worker = self.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                worker.process(job).await
            });

            tokio::spawn(async move {
                if let Err(e) = handle.await {
                    tracing::error!(
                        library_id = %library_id,
                        request_id = ?request_id,
                        error = %e,
                        "Scan task aborted"
                    );
                }
            });
        }

        // Wait for in-flight scans before reporting the loop as stopped
        let _ = semaphore.acquire_many(slots as u32).await;
        tracing::info!(queue = queue.name(), "Library scan worker stopped");
    }

    /// Run one scan job and report its outcome to the sink
    pub async fn process(&self, job: ScanJob) -> WorkerResult<ScanSummary> {
        let library_id = job.library.id;
        let request_id = job.request_id;

        match self.execute(&job).await {
            Ok(summary) => {
                self.enter(&job, ScanPhase::Completed);
                self.sink.on_scan_completed(&summary).await;
                Ok(summary)
            }
            Err(e) => {
                self.enter(&job, ScanPhase::Failed);
                e.log();
                self.sink
                    .on_scan_failed(&ScanFailure {
                        request_id,
                        library_id,
                        error: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &ScanJob) -> WorkerResult<ScanSummary> {
        let started_at = Utc::now();
        self.enter(job, ScanPhase::Received);

        let library = self
            .store
            .library(job.library.id)
            .await?
            .ok_or_else(|| {
                WorkerError::InvalidScanScope(format!(
                    "library {} is not registered",
                    job.library.id
                ))
            })?;
        let (root, scan_root) = resolve_scan_root(&library, job.specific_directory.as_deref())?;

        self.enter(job, ScanPhase::Enumerating);
        let walk_root = scan_root.clone();
        let files = tokio::task::spawn_blocking(move || enumerate_audio_files(&walk_root)).await??;
        let files_total = files.len();

        tracing::info!(
            library_id = %library.id,
            request_id = ?job.request_id,
            scan_root = %scan_root.display(),
            files = files_total,
            incremental = job.incremental,
            trigger = %job.trigger,
            "Starting library scan"
        );

        let known: HashMap<PathBuf, TrackRecord> = self
            .store
            .tracks_in_library(library.id)
            .await?
            .into_iter()
            .map(|t| (t.file_path.clone(), t))
            .collect();

        let mut extracted = Vec::new();
        let mut failed = Vec::new();
        let mut unchanged = 0;
        let interval = self.config.progress_interval.max(1);

        for (index, path) in files.iter().enumerate() {
            self.enter(job, ScanPhase::Processing(path.clone()));
            let existing = known.get(path).cloned();

            match inspect_file(path, existing, job.incremental) {
                Ok(Some(file)) => extracted.push(file),
                Ok(None) => unchanged += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to process file");
                    failed.push(FailedFile {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            let processed = index + 1;
            if processed % interval == 0 || processed == files_total {
                self.sink
                    .on_scan_progress(ScanProgress {
                        request_id: job.request_id,
                        files_processed: processed,
                        files_total,
                        current_path: path.clone(),
                    })
                    .await;
            }
        }

        self.enter(job, ScanPhase::Reconciling);
        let reconciled = {
            let _guard = self.locks.lock(library.id).await;
            let mut reconciled = self.reconcile(library.id, extracted).await?;

            if job.is_full_scope() {
                let present: HashSet<&PathBuf> = files.iter().collect();
                let gone: Vec<Uuid> = known
                    .values()
                    .filter(|t| t.file_path.starts_with(&root) && !present.contains(&t.file_path))
                    .map(|t| t.id)
                    .collect();
                if !gone.is_empty() {
                    reconciled.removed = self.store.remove_tracks(&gone).await?;
                    let pruned = self.store.prune_orphans().await?;
                    tracing::debug!(library_id = %library.id, pruned, "Pruned orphaned catalogue entries");
                }
            }
            reconciled
        };

        let completed_at = Utc::now();
        let previous_scan = self.store.mark_scanned(library.id, completed_at).await?;
        if previous_scan.is_none() {
            let registered = MusicLibrary {
                last_scan: Some(completed_at),
                ..library.clone()
            };
            self.events.on_library_registered(registered);
        }

        let embeddings_queued = self.queue_embeddings(job, reconciled.changed).await;

        Ok(ScanSummary {
            request_id: job.request_id,
            library_id: library.id,
            trigger: job.trigger,
            incremental: job.incremental,
            files_total,
            added: reconciled.added,
            updated: reconciled.updated,
            unchanged: unchanged + reconciled.unchanged,
            removed: reconciled.removed,
            failed,
            embeddings_queued,
            started_at,
            completed_at,
        })
    }

    async fn reconcile(
        &self,
        library_id: Uuid,
        files: Vec<ExtractedFile>,
    ) -> WorkerResult<Reconciled> {
        let mut out = Reconciled::default();

        for file in files {
            let metadata = &file.metadata;
            let tags = CatalogueTags {
                artist: metadata.artist.clone(),
                album: metadata.album.clone().map(|title| AlbumTag {
                    title,
                    artist: (metadata.album_owner() != metadata.artist)
                        .then(|| metadata.album_owner().to_string()),
                }),
                genre: metadata.genre.clone(),
                year: metadata.year,
            };

            let content_changed = file
                .existing
                .as_ref()
                .map(|t| t.file_size != file.stamp.size || t.modified_at != file.stamp.modified_at)
                .unwrap_or(true);

            let record = TrackRecord {
                id: file.existing.as_ref().map(|t| t.id).unwrap_or_else(Uuid::new_v4),
                library_id,
                file_path: file.path.clone(),
                title: metadata.title.clone(),
                // Resolved by the store together with the insert
                artist_id: Uuid::nil(),
                album_id: None,
                genre_id: None,
                track_number: metadata.track_number,
                disc_number: metadata.disc_number,
                year: metadata.year,
                duration_ms: metadata.duration_ms,
                file_size: file.stamp.size,
                modified_at: file.stamp.modified_at,
                natural_key: metadata.natural_key(),
            };

            let (id, outcome) = self.store.upsert_tagged_track(tags, record).await?;
            match outcome {
                UpsertOutcome::Inserted => out.added += 1,
                UpsertOutcome::Updated if content_changed => out.updated += 1,
                UpsertOutcome::Updated => out.unchanged += 1,
            }
            if outcome == UpsertOutcome::Inserted || content_changed {
                out.changed.push(TrackRef::new(id, file.path));
            }
        }

        Ok(out)
    }

    /// Returns how many jobs the queue accepted
    async fn queue_embeddings(&self, job: &ScanJob, tracks: Vec<TrackRef>) -> usize {
        let Some(queue) = &self.embeddings else {
            return 0;
        };

        let mut queued = 0;
        for track in tracks {
            let track_id = track.id;
            let mut embedding = EmbeddingJob::new(track);
            if let Some(request_id) = job.request_id {
                embedding = embedding.with_request_id(request_id.to_string());
            }
            match queue.enqueue(embedding).await {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!(
                    track_id = %track_id,
                    error = %e,
                    "Failed to queue embedding generation"
                ),
            }
        }
        queued
    }

    fn enter(&self, job: &ScanJob, phase: ScanPhase) {
        match phase {
            ScanPhase::Processing(ref path) => {
                tracing::trace!(library_id = %job.library.id, path = %path.display(), "Processing file")
            }
            _ => tracing::debug!(
                library_id = %job.library.id,
                request_id = ?job.request_id,
                phase = %phase,
                "Scan phase"
            ),
        }
    }
}

impl fmt::Debug for LibraryScanWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryScanWorker")
            .field("config", &self.config)
            .field("embeddings", &self.embeddings.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Reconciled {
    added: usize,
    updated: usize,
    unchanged: usize,
    removed: usize,
    changed: Vec<TrackRef>,
}

/// Canonical library root and the directory to walk
fn resolve_scan_root(
    library: &MusicLibrary,
    specific_directory: Option<&Path>,
) -> WorkerResult<(PathBuf, PathBuf)> {
    let root = library
        .root
        .canonicalize()
        .map_err(|e| WorkerError::scan_root_unavailable(&library.root, e))?;

    let scan_root = match specific_directory {
        None => root.clone(),
        Some(dir) => {
            let requested = if dir.is_absolute() {
                dir.to_path_buf()
            } else {
                root.join(dir)
            };
            match requested.canonicalize() {
                Ok(canonical) if canonical.starts_with(&root) => canonical,
                Ok(canonical) => {
                    return Err(WorkerError::InvalidScanScope(format!(
                        "{} is outside the library root {}",
                        canonical.display(),
                        root.display()
                    )))
                }
                // A missing directory inside the library is unavailable, not out of scope
                Err(e) if requested.starts_with(&library.root) || requested.starts_with(&root) => {
                    return Err(WorkerError::scan_root_unavailable(requested, e))
                }
                Err(_) => {
                    return Err(WorkerError::InvalidScanScope(format!(
                        "{} is outside the library root {}",
                        requested.display(),
                        root.display()
                    )))
                }
            }
        }
    };

    std::fs::read_dir(&scan_root).map_err(|e| WorkerError::scan_root_unavailable(&scan_root, e))?;
    Ok((root, scan_root))
}

/// Audio files under `root`, in a stable order
fn enumerate_audio_files(root: &Path) -> WorkerResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(WorkerError::scan_root_unavailable(root, e));
                }
                tracing::warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_file() && is_audio_file(entry.path()) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

/// Read a file's stamp and tags; `None` when an incremental scan can skip it
fn inspect_file(
    path: &Path,
    existing: Option<TrackRecord>,
    incremental: bool,
) -> WorkerResult<Option<ExtractedFile>> {
    let stamp = FileStamp::read(path)
        .map_err(|e| WorkerError::metadata_extraction(path.display().to_string(), e.to_string()))?;

    if incremental {
        if let Some(track) = &existing {
            if track.file_size == stamp.size && track.modified_at == stamp.modified_at {
                return Ok(None);
            }
        }
    }

    let metadata = extract_metadata(path)?;
    Ok(Some(ExtractedFile {
        path: path.to_path_buf(),
        stamp,
        metadata,
        existing,
    }))
}
