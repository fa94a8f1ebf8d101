//! Integration tests for the library scan worker
//!
//! This test module covers:
//! - Reconciliation of new files and per-file failure reporting
//! - Incremental rescans and change detection
//! - Removal of deleted files on full-scope scans
//! - Scan scope validation
//! - Library registration events and embedding job chaining

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use reef_worker::events::EventHub;
use reef_worker::jobs::library_scan::{LibraryScanWorker, ScanWorkerConfig};
use reef_worker::models::{EmbeddingJob, ScanJob, ScanTrigger};
use reef_worker::queue::{JobQueue, QueueReceiver};
use reef_worker::store::{InMemoryLibraryStore, LibraryStore};
use reef_worker::WorkerError;
use uuid::Uuid;

use common::{store_with_library, wait_until, RecordingProgressSink, TestLibrary};

// =============================================================================
// Test Helpers
// =============================================================================

struct Harness {
    store: Arc<InMemoryLibraryStore>,
    sink: Arc<RecordingProgressSink>,
    events: Arc<EventHub>,
    worker: Arc<LibraryScanWorker>,
    embeddings: QueueReceiver<EmbeddingJob>,
    library: TestLibrary,
}

async fn harness(config: ScanWorkerConfig) -> Harness {
    let (store, library) = store_with_library().await;
    let sink = Arc::new(RecordingProgressSink::new());
    let events = Arc::new(EventHub::new());
    let (tx, rx) = JobQueue::unbounded("embedding_generation").split();

    let worker = LibraryScanWorker::new(store.clone(), sink.clone(), events.clone(), config)
        .with_embedding_queue(tx);

    Harness {
        store,
        sink,
        events,
        worker: Arc::new(worker),
        embeddings: rx,
        library,
    }
}

async fn drain_async(queue: &mut QueueReceiver<EmbeddingJob>) -> Vec<EmbeddingJob> {
    let mut jobs = Vec::new();
    while queue.pending() > 0 {
        match tokio::time::timeout(Duration::from_millis(100), queue.dequeue()).await {
            Ok(Some(job)) => jobs.push(job),
            _ => break,
        }
    }
    jobs
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_three_valid_one_corrupt() {
    let mut h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("Artist/Album/01 - one.wav", 0.5);
    h.library.add_track("Artist/Album/02 - two.wav", 0.6);
    h.library.add_track("Artist/Album/03 - three.wav", 0.7);
    let corrupt = h.library.add_corrupt("Artist/Album/04 - broken.flac");
    h.library.add_other("Artist/Album/cover.jpg");

    let before = h.store.track_count().await;
    let request_id = Uuid::new_v4();
    let summary = h
        .worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual).with_request_id(request_id))
        .await
        .unwrap();

    assert_eq!(summary.files_total, 4);
    assert_eq!(summary.added, 3);
    assert_eq!(summary.succeeded(), 3);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].path, corrupt);
    assert!(!summary.failed[0].reason.is_empty());
    assert_eq!(h.store.track_count().await, before + 3);

    // Completion reaches the sink once, with the same counts
    let completed = h.sink.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].request_id, Some(request_id));
    assert_eq!(completed[0].failed.len(), 1);
    assert!(h.sink.failed().is_empty());

    // Every new track is queued for embedding generation under the request
    let jobs = drain_async(&mut h.embeddings).await;
    assert_eq!(jobs.len(), 3);
    let request = request_id.to_string();
    assert!(jobs.iter().all(|j| j.request_id.as_deref() == Some(request.as_str())));
}

#[tokio::test]
async fn test_tracks_get_title_from_file_name_without_tags() {
    let h = harness(ScanWorkerConfig::default()).await;
    let path = h.library.add_track("untagged.wav", 0.5);

    h.worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual))
        .await
        .unwrap();

    let track = h
        .store
        .track_by_path(h.library.library.id, &path)
        .await
        .unwrap()
        .expect("track should be stored");
    assert_eq!(track.title, "untagged");
    assert_eq!(track.library_id, h.library.library.id);
    assert!(track.duration_ms > 0);

    let artists = h.store.artists().await;
    assert_eq!(artists.len(), 1);
    assert_eq!(artists[0].id, track.artist_id);
}

#[tokio::test]
async fn test_progress_reported_every_interval() {
    let h = harness(ScanWorkerConfig {
        progress_interval: 2,
        max_concurrent_scans: 1,
    })
    .await;
    for i in 0..5 {
        h.library.add_track(&format!("track{}.wav", i), 0.2);
    }

    h.worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual))
        .await
        .unwrap();

    let processed: Vec<usize> = h.sink.progress().iter().map(|p| p.files_processed).collect();
    assert_eq!(processed, vec![2, 4, 5]);
    assert!(h.sink.progress().iter().all(|p| p.files_total == 5));
}

// =============================================================================
// Incremental scans and change detection
// =============================================================================

#[tokio::test]
async fn test_incremental_rescan_without_changes_writes_nothing() {
    let mut h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("a.wav", 0.3);
    h.library.add_track("b.wav", 0.4);

    let job = ScanJob::full(h.library.library.clone(), ScanTrigger::Manual);
    h.worker.process(job.clone()).await.unwrap();
    drain_async(&mut h.embeddings).await;

    let writes = h.store.metadata_writes();
    let summary = h.worker.process(job.incremental()).await.unwrap();

    assert_eq!(h.store.metadata_writes(), writes);
    assert_eq!(summary.added, 0);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.unchanged, 2);
    assert!(drain_async(&mut h.embeddings).await.is_empty());
}

#[tokio::test]
async fn test_incremental_rescan_picks_up_changed_file() {
    let mut h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("a.wav", 0.3);
    h.library.add_track("b.wav", 0.4);

    let job = ScanJob::full(h.library.library.clone(), ScanTrigger::Manual);
    h.worker.process(job.clone()).await.unwrap();
    let first = drain_async(&mut h.embeddings).await;

    // Different length changes the size even within the same mtime second
    let changed = h.library.add_track("b.wav", 0.9);
    let summary = h.worker.process(job.incremental()).await.unwrap();

    assert_eq!(summary.added, 0);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(h.store.track_count().await, 2);

    // The track keeps its id and is re-queued for embedding
    let requeued = drain_async(&mut h.embeddings).await;
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].track.file_path, changed);
    assert!(first.iter().any(|j| j.track.id == requeued[0].track.id));
}

#[tokio::test]
async fn test_full_rescan_removes_deleted_files() {
    let h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("keep.wav", 0.3);
    h.library.add_track("gone.wav", 0.3);

    let job = ScanJob::full(h.library.library.clone(), ScanTrigger::Manual);
    h.worker.process(job.clone()).await.unwrap();
    assert_eq!(h.store.track_count().await, 2);

    h.library.remove("gone.wav");
    let summary = h.worker.process(job).await.unwrap();

    assert_eq!(summary.removed, 1);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(h.store.track_count().await, 1);
}

#[tokio::test]
async fn test_directory_scan_never_removes_tracks_elsewhere() {
    let h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("one/a.wav", 0.3);
    h.library.add_track("two/b.wav", 0.3);

    h.worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual))
        .await
        .unwrap();

    let summary = h
        .worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::FileSystemEvent).in_directory("one"))
        .await
        .unwrap();

    assert_eq!(summary.files_total, 1);
    assert_eq!(summary.removed, 0);
    assert_eq!(h.store.track_count().await, 2);
}

// =============================================================================
// Scope validation
// =============================================================================

#[tokio::test]
async fn test_directory_outside_library_is_rejected() {
    let h = harness(ScanWorkerConfig::default()).await;
    let elsewhere = tempfile::tempdir().unwrap();

    let result = h
        .worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual).in_directory(elsewhere.path()))
        .await;

    assert_matches!(result, Err(WorkerError::InvalidScanScope(_)));
    assert_eq!(h.sink.failed().len(), 1);
    assert!(h.sink.completed().is_empty());
}

#[tokio::test]
async fn test_parent_traversal_is_rejected() {
    let h = harness(ScanWorkerConfig::default()).await;

    let result = h
        .worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual).in_directory(".."))
        .await;

    assert_matches!(result, Err(WorkerError::InvalidScanScope(_)));
}

#[tokio::test]
async fn test_missing_directory_inside_library_is_unavailable() {
    let h = harness(ScanWorkerConfig::default()).await;

    let result = h
        .worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual).in_directory("not-there"))
        .await;

    assert_matches!(result, Err(WorkerError::ScanRootUnavailable { .. }));
}

#[tokio::test]
async fn test_unregistered_library_is_rejected() {
    let h = harness(ScanWorkerConfig::default()).await;
    let stranger = TestLibrary::new();

    let result = h
        .worker
        .process(ScanJob::full(stranger.library.clone(), ScanTrigger::Manual))
        .await;

    assert_matches!(result, Err(WorkerError::InvalidScanScope(_)));
}

#[tokio::test]
async fn test_vanished_root_is_unavailable() {
    let store = Arc::new(InMemoryLibraryStore::new());
    let library = TestLibrary::registered(&store).await;
    let job = ScanJob::full(library.library.clone(), ScanTrigger::Scheduled);
    drop(library);

    let worker = LibraryScanWorker::new(
        store,
        Arc::new(RecordingProgressSink::new()),
        Arc::new(EventHub::new()),
        ScanWorkerConfig::default(),
    );
    assert_matches!(worker.process(job).await, Err(WorkerError::ScanRootUnavailable { .. }));
}

// =============================================================================
// Events and the worker loop
// =============================================================================

#[tokio::test]
async fn test_first_scan_emits_library_registered_once() {
    let h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("a.wav", 0.2);

    let emitted = Arc::new(AtomicUsize::new(0));
    let counter = emitted.clone();
    let library_id = h.library.library.id;
    h.events.library_registered.subscribe(move |event| {
        assert_eq!(event.library.id, library_id);
        assert!(event.library.last_scan.is_some());
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let job = ScanJob::full(h.library.library.clone(), ScanTrigger::LibraryAdded);
    h.worker.process(job.clone()).await.unwrap();
    h.worker.process(job).await.unwrap();

    assert_eq!(emitted.load(Ordering::SeqCst), 1);
    let stored = h.store.library(library_id).await.unwrap().unwrap();
    assert!(stored.last_scan.is_some());
}

#[tokio::test]
async fn test_worker_loop_processes_jobs_in_order() {
    let h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("a.wav", 0.2);

    let (tx, rx) = JobQueue::unbounded("library_scan").split();
    let loop_handle = tokio::spawn(h.worker.clone().run(rx));

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    tx.enqueue(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual).with_request_id(first))
        .await
        .unwrap();
    tx.enqueue(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual).with_request_id(second))
        .await
        .unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(10), loop_handle)
        .await
        .expect("worker loop should stop once the queue closes")
        .unwrap();

    let order: Vec<_> = h.sink.completed().iter().map(|s| s.request_id).collect();
    assert_eq!(order, vec![Some(first), Some(second)]);
}

#[tokio::test]
async fn test_failed_job_does_not_stop_the_loop() {
    let h = harness(ScanWorkerConfig::default()).await;
    h.library.add_track("a.wav", 0.2);

    let (tx, rx) = JobQueue::unbounded("library_scan").split();
    tokio::spawn(h.worker.clone().run(rx));

    tx.enqueue(ScanJob::full(TestLibrary::new().library, ScanTrigger::Manual))
        .await
        .unwrap();
    tx.enqueue(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual))
        .await
        .unwrap();

    let sink = h.sink.clone();
    assert!(wait_until(Duration::from_secs(10), || sink.completed().len() == 1).await);
    assert_eq!(h.sink.failed().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_scans_of_two_libraries_keep_catalogue_consistent() {
    let config = ScanWorkerConfig {
        max_concurrent_scans: 2,
        ..ScanWorkerConfig::default()
    };
    let h = harness(config).await;
    let other = TestLibrary::registered(&h.store).await;

    // Every untagged fixture files under the same fallback artist, so the
    // removal in one library prunes while the other still upserts it
    h.library.add_track("leaving.wav", 0.1);
    h.worker
        .process(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual))
        .await
        .unwrap();
    h.library.remove("leaving.wav");
    for i in 0..40 {
        other.add_track(&format!("disc/{i:02}.wav"), 0.1);
    }

    let (tx, rx) = JobQueue::unbounded("library_scan").split();
    let loop_handle = tokio::spawn(h.worker.clone().run(rx));
    tx.enqueue(ScanJob::full(other.library.clone(), ScanTrigger::LibraryAdded))
        .await
        .unwrap();
    tx.enqueue(ScanJob::full(h.library.library.clone(), ScanTrigger::Manual))
        .await
        .unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(30), loop_handle)
        .await
        .expect("both scans should finish")
        .unwrap();

    assert_eq!(h.sink.completed().len(), 3);
    assert!(h.sink.failed().is_empty());

    let artists: Vec<Uuid> = h.store.artists().await.into_iter().map(|a| a.id).collect();
    let tracks = h.store.tracks_in_library(other.library.id).await.unwrap();
    assert_eq!(tracks.len(), 40);
    for track in tracks {
        assert!(
            artists.contains(&track.artist_id),
            "{} points at a pruned artist",
            track.file_path.display()
        );
    }
    assert!(h.store.tracks_in_library(h.library.library.id).await.unwrap().is_empty());
}
