//! Wiring of queues, workers and the transcoder
//!
//! [`Pipeline`] is what a hosting service holds on to: it accepts scan and
//! embedding jobs, exposes the transcoder and the event hub, and owns the
//! worker loops once they are spawned. The scan scheduler and the library
//! watcher run next to the workers when configured.

use std::sync::{Arc, Mutex};

use reef_shared_config::TranscodeConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{WorkerError, WorkerResult};
use crate::events::{EventHub, PlaybackReporter};
use crate::jobs::embedding_generation::{EmbeddingWorker, FeatureExtractor, SpectralEmbedder};
use crate::jobs::library_scan::{LibraryScanWorker, ScanWorkerConfig};
use crate::models::{EmbeddingJob, ScanJob};
use crate::progress::{ProgressSink, ScanReporter, TracingProgressSink};
use crate::queue::{JobQueue, QueueConfig, QueueReceiver, QueueSender};
use crate::store::LibraryStore;
use crate::transcode::{Encoder, FfmpegEncoder, TranscodeJobManager};
use crate::triggers::{LibraryWatcher, ScanSchedule, ScanScheduler, WatchConfig};

pub const SCAN_QUEUE_NAME: &str = "library_scan";
pub const EMBEDDING_QUEUE_NAME: &str = "embedding_generation";

/// Assembles a [`Pipeline`]
pub struct PipelineBuilder {
    store: Arc<dyn LibraryStore>,
    sink: Arc<dyn ProgressSink>,
    extractor: Arc<dyn FeatureExtractor>,
    encoder: Option<Arc<dyn Encoder>>,
    events: Arc<EventHub>,
    scan_queue: QueueConfig,
    embedding_queue: QueueConfig,
    scan_worker: ScanWorkerConfig,
    embedding_timeout: Option<std::time::Duration>,
    transcode: TranscodeConfig,
    schedule: ScanSchedule,
    watch: Option<WatchConfig>,
}

impl PipelineBuilder {
    pub fn new(store: Arc<dyn LibraryStore>) -> Self {
        Self {
            store,
            sink: Arc::new(TracingProgressSink),
            extractor: Arc::new(SpectralEmbedder::default()),
            encoder: None,
            events: Arc::new(EventHub::new()),
            scan_queue: QueueConfig::unbounded(),
            embedding_queue: QueueConfig::unbounded(),
            scan_worker: ScanWorkerConfig::default(),
            embedding_timeout: None,
            transcode: TranscodeConfig::default(),
            schedule: ScanSchedule::disabled(),
            watch: None,
        }
    }

    /// Apply every setting read from the environment
    pub fn with_config(mut self, config: &Config) -> Self {
        self.scan_queue = config.scan_queue();
        self.embedding_queue = config.embedding_queue();
        self.scan_worker = config.scan_worker();
        self.embedding_timeout = Some(config.embedding_timeout());
        self.extractor = Arc::new(SpectralEmbedder::new(config.embedding_max_analysis_secs));
        self.transcode = config.transcode().clone();
        self.schedule = config.scan_schedule();
        self.watch = config.watch();
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn with_events(mut self, events: Arc<EventHub>) -> Self {
        self.events = events;
        self
    }

    pub fn with_queues(mut self, scan: QueueConfig, embedding: QueueConfig) -> Self {
        self.scan_queue = scan;
        self.embedding_queue = embedding;
        self
    }

    pub fn with_scan_worker(mut self, config: ScanWorkerConfig) -> Self {
        self.scan_worker = config;
        self
    }

    pub fn with_transcode(mut self, config: TranscodeConfig) -> Self {
        self.transcode = config;
        self
    }

    pub fn with_schedule(mut self, schedule: ScanSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Watch registered libraries and scan what changes
    pub fn with_watch(mut self, config: WatchConfig) -> Self {
        self.watch = Some(config);
        self
    }

    pub fn build(self) -> Pipeline {
        let (scan_tx, scan_rx) = JobQueue::new(SCAN_QUEUE_NAME, self.scan_queue).split();
        let (embedding_tx, embedding_rx) =
            JobQueue::new(EMBEDDING_QUEUE_NAME, self.embedding_queue).split();

        let reporter = Arc::new(ScanReporter::new(self.sink));
        let encoder: Arc<dyn Encoder> = match self.encoder {
            Some(encoder) => encoder,
            None => Arc::new(FfmpegEncoder::new(self.transcode.ffmpeg_path.clone())),
        };
        let transcoder = TranscodeJobManager::with_encoder(self.transcode, encoder);

        let scan_worker = LibraryScanWorker::new(
            self.store.clone(),
            reporter.clone(),
            self.events.clone(),
            self.scan_worker,
        )
        .with_embedding_queue(embedding_tx.clone());

        let mut embedding_worker =
            EmbeddingWorker::new(self.store.clone(), reporter.clone(), self.extractor);
        if let Some(timeout) = self.embedding_timeout {
            embedding_worker = embedding_worker.with_timeout(timeout);
        }

        Pipeline {
            store: self.store,
            events: self.events,
            reporter,
            scan_tx,
            embedding_tx,
            transcoder,
            pending: Mutex::new(Some(PendingWorkers {
                scan: (Arc::new(scan_worker), scan_rx),
                embedding: (Arc::new(embedding_worker), embedding_rx),
            })),
            schedule: self.schedule,
            watch: self.watch,
            trigger_shutdown: CancellationToken::new(),
            scan_shutdown: CancellationToken::new(),
            embedding_shutdown: CancellationToken::new(),
        }
    }
}

struct PendingWorkers {
    scan: (Arc<LibraryScanWorker>, QueueReceiver<ScanJob>),
    embedding: (Arc<EmbeddingWorker>, QueueReceiver<EmbeddingJob>),
}

/// Join handles of the spawned background tasks
#[derive(Debug)]
pub struct WorkerHandles {
    pub scan: JoinHandle<()>,
    pub embedding: JoinHandle<()>,
    pub reaper: JoinHandle<()>,
    pub scheduler: Option<JoinHandle<()>>,
    pub watcher: Option<(Arc<LibraryWatcher>, JoinHandle<()>)>,
    pub embedding_worker: Arc<EmbeddingWorker>,
}

/// The background job pipeline
pub struct Pipeline {
    store: Arc<dyn LibraryStore>,
    events: Arc<EventHub>,
    reporter: Arc<ScanReporter>,
    scan_tx: QueueSender<ScanJob>,
    embedding_tx: QueueSender<EmbeddingJob>,
    transcoder: TranscodeJobManager,
    pending: Mutex<Option<PendingWorkers>>,
    schedule: ScanSchedule,
    watch: Option<WatchConfig>,
    trigger_shutdown: CancellationToken,
    scan_shutdown: CancellationToken,
    embedding_shutdown: CancellationToken,
}

impl Pipeline {
    pub fn builder(store: Arc<dyn LibraryStore>) -> PipelineBuilder {
        PipelineBuilder::new(store)
    }

    /// Queue a library scan
    pub async fn enqueue_scan(&self, job: ScanJob) -> WorkerResult<()> {
        tracing::debug!(
            library_id = %job.library.id,
            request_id = ?job.request_id,
            trigger = %job.trigger,
            incremental = job.incremental,
            "Scan job enqueued"
        );
        self.scan_tx.enqueue(job).await?;
        Ok(())
    }

    /// Queue embedding generation for one track
    pub async fn enqueue_embedding(&self, job: EmbeddingJob) -> WorkerResult<()> {
        self.embedding_tx.enqueue(job).await?;
        Ok(())
    }

    pub fn transcoder(&self) -> &TranscodeJobManager {
        &self.transcoder
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn LibraryStore> {
        &self.store
    }

    /// Active scan table, for progress queries
    pub fn scans(&self) -> &Arc<ScanReporter> {
        &self.reporter
    }

    pub fn playback_reporter(&self) -> PlaybackReporter {
        PlaybackReporter::new(self.events.clone())
    }

    pub fn pending_scans(&self) -> usize {
        self.scan_tx.pending()
    }

    pub fn pending_embeddings(&self) -> usize {
        self.embedding_tx.pending()
    }

    /// Start both worker loops, the transcode reaper and the configured
    /// scan triggers
    ///
    /// Can be called once; a second call fails.
    pub fn spawn_workers(&self) -> WorkerResult<WorkerHandles> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| WorkerError::Internal("workers already spawned".to_string()))?;

        let (scan_worker, scan_rx) = pending.scan;
        let (embedding_worker, embedding_rx) = pending.embedding;

        let scan = tokio::spawn(scan_worker.run_until(scan_rx, self.scan_shutdown.clone()));
        let embedding = tokio::spawn(
            embedding_worker
                .clone()
                .run_until(embedding_rx, self.embedding_shutdown.clone()),
        );
        let reaper = self.transcoder.spawn_reaper();

        let scheduler = self.schedule.is_enabled().then(|| {
            let scheduler = ScanScheduler::new(self.store.clone(), self.scan_tx.clone(), self.schedule);
            tokio::spawn(scheduler.run_until(self.trigger_shutdown.clone()))
        });
        let watcher = self.watch.map(|config| {
            let watcher = Arc::new(LibraryWatcher::new(self.scan_tx.clone(), config));
            let task = tokio::spawn(
                watcher
                    .clone()
                    .run_until(self.store.clone(), self.trigger_shutdown.clone()),
            );
            (watcher, task)
        });

        tracing::info!(
            scheduled_scans = scheduler.is_some(),
            watching = watcher.is_some(),
            "Pipeline workers spawned"
        );
        Ok(WorkerHandles {
            scan,
            embedding,
            reaper,
            scheduler,
            watcher,
            embedding_worker,
        })
    }

    /// Stop accepting work, drain both queues and cancel all transcoding
    ///
    /// Scan triggers stop first and flush what they saw. The scan queue
    /// drains before the embedding queue so embeddings it queues are still
    /// processed.
    pub async fn shutdown(&self, handles: WorkerHandles) {
        self.trigger_shutdown.cancel();
        if let Some(scheduler) = handles.scheduler {
            if let Err(e) = scheduler.await {
                tracing::error!(error = %e, "Scan scheduler task failed");
            }
        }
        if let Some((_, watcher)) = handles.watcher {
            if let Err(e) = watcher.await {
                tracing::error!(error = %e, "Library watcher task failed");
            }
        }

        self.scan_shutdown.cancel();
        if let Err(e) = handles.scan.await {
            tracing::error!(error = %e, "Scan worker task failed");
        }

        self.embedding_shutdown.cancel();
        if let Err(e) = handles.embedding.await {
            tracing::error!(error = %e, "Embedding worker task failed");
        }

        self.transcoder.shutdown().await;
        if let Err(e) = handles.reaper.await {
            tracing::error!(error = %e, "Transcode reaper task failed");
        }
        tracing::info!("Pipeline stopped");
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("scan_queue", &self.scan_tx)
            .field("embedding_queue", &self.embedding_tx)
            .field("transcoder", &self.transcoder)
            .finish()
    }
}
