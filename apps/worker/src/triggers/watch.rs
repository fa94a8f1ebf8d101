//! Filesystem watching for registered libraries
//!
//! A `notify` watcher per library forwards raw events into a channel. A
//! flush loop coalesces them until the library has been quiet for the
//! debounce window, then queues one scan per touched directory. Removals and
//! lost events fall back to an incremental scan of the whole library, the
//! only scope allowed to drop tracks.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};
use crate::jobs::metadata::is_audio_file;
use crate::models::{MusicLibrary, ScanJob, ScanTrigger};
use crate::queue::QueueSender;
use crate::store::LibraryStore;

/// Raw notifications buffered per library before events are dropped
const EVENT_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Quiet period before pending changes become scan jobs
    pub debounce: Duration,
    /// How often the watched set is reconciled with the store
    pub refresh_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// What one notification means for the catalogue
#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    /// Audio under this directory appeared or changed
    Directory(PathBuf),
    /// Something under the library went away
    Removed,
    /// The backend lost events
    Rescan,
}

/// Changes seen since the last flush
#[derive(Debug, Default)]
struct PendingChanges {
    directories: BTreeSet<PathBuf>,
    full: bool,
    events: usize,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.events == 0
    }

    fn record(&mut self, change: Change) {
        self.events += 1;
        match change {
            Change::Directory(dir) => {
                self.directories.insert(dir);
            }
            Change::Removed | Change::Rescan => self.full = true,
        }
    }

    /// Scan jobs covering everything recorded, innermost duplicates dropped
    fn into_jobs(self, library: &MusicLibrary) -> Vec<ScanJob> {
        let deleted_dir = self.directories.iter().any(|dir| !dir.is_dir());
        if self.full || deleted_dir {
            return vec![ScanJob::full(library.clone(), ScanTrigger::FileSystemEvent).incremental()];
        }

        let mut roots: Vec<PathBuf> = Vec::new();
        // BTreeSet order puts every ancestor before its descendants
        for dir in self.directories {
            if roots.iter().any(|root| dir.starts_with(root)) {
                continue;
            }
            roots.push(dir);
        }

        roots
            .into_iter()
            .map(|dir| {
                let job = ScanJob::full(library.clone(), ScanTrigger::FileSystemEvent);
                if dir == library.root {
                    job
                } else {
                    job.in_directory(dir)
                }
            })
            .collect()
    }
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

/// Receiving side of one library's notifications
struct Inbox {
    rx: mpsc::Receiver<WatchMessage>,
    /// Set when a notification was dropped on a full buffer
    overflowed: Arc<AtomicBool>,
}

struct LibraryWatch {
    watcher: RecommendedWatcher,
    stop: CancellationToken,
    flush_task: JoinHandle<()>,
}

impl LibraryWatch {
    /// Stop notifications and wait for the pending changes to be queued
    async fn shutdown(self) {
        drop(self.watcher);
        self.stop.cancel();
        if let Err(e) = self.flush_task.await {
            tracing::error!(error = %e, "Watch flush task failed");
        }
    }
}

/// Turns filesystem changes in registered libraries into scan jobs
pub struct LibraryWatcher {
    config: WatchConfig,
    queue: QueueSender<ScanJob>,
    libraries: RwLock<HashMap<Uuid, LibraryWatch>>,
}

impl LibraryWatcher {
    pub fn new(queue: QueueSender<ScanJob>, config: WatchConfig) -> Self {
        Self {
            config,
            queue,
            libraries: RwLock::new(HashMap::new()),
        }
    }

    /// Start watching a library; a no-op if it is already watched
    pub async fn watch(&self, library: MusicLibrary) -> WorkerResult<()> {
        let mut libraries = self.libraries.write().await;
        if libraries.contains_key(&library.id) {
            return Ok(());
        }

        let root = library
            .root
            .canonicalize()
            .map_err(|e| WorkerError::scan_root_unavailable(&library.root, e))?;
        let library = MusicLibrary { root, ..library };
        let library_id = library.id;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let overflowed = Arc::new(AtomicBool::new(false));
        let watch_root = library.root.clone();
        let flag = overflowed.clone();
        let watcher =
            tokio::task::spawn_blocking(move || start_watcher(&watch_root, tx, flag)).await??;

        let stop = CancellationToken::new();
        let flush_task = tokio::spawn(flush_loop(
            library.clone(),
            Inbox { rx, overflowed },
            self.queue.clone(),
            self.config.debounce,
            stop.clone(),
        ));

        tracing::info!(
            library_id = %library_id,
            root = %library.root.display(),
            "Watching library for changes"
        );
        libraries.insert(
            library_id,
            LibraryWatch {
                watcher,
                stop,
                flush_task,
            },
        );
        Ok(())
    }

    /// Stop watching a library; pending changes are still flushed
    pub async fn unwatch(&self, library_id: Uuid) {
        let removed = self.libraries.write().await.remove(&library_id);
        if let Some(watch) = removed {
            watch.shutdown().await;
            tracing::info!(library_id = %library_id, "Stopped watching library");
        }
    }

    pub async fn watched(&self) -> Vec<Uuid> {
        self.libraries.read().await.keys().copied().collect()
    }

    /// Watch every library in the store and drop watches for removed ones
    pub async fn sync(&self, store: &dyn LibraryStore) -> WorkerResult<()> {
        let libraries = store.libraries().await?;

        let stale: Vec<Uuid> = {
            let watched = self.libraries.read().await;
            watched
                .keys()
                .filter(|id| !libraries.iter().any(|l| l.id == **id))
                .copied()
                .collect()
        };
        for id in stale {
            self.unwatch(id).await;
        }

        for library in libraries {
            let library_id = library.id;
            if let Err(e) = self.watch(library).await {
                tracing::warn!(library_id = %library_id, error = %e, "Cannot watch library");
            }
        }
        Ok(())
    }

    /// Keep the watched set in line with the store until `shutdown` fires
    pub async fn run_until(self: Arc<Self>, store: Arc<dyn LibraryStore>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync(store.as_ref()).await {
                        tracing::error!(error = %e, "Failed to refresh library watches");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Drop every watch
    pub async fn shutdown(&self) {
        let watches: Vec<_> = self.libraries.write().await.drain().collect();
        let count = watches.len();
        for (_, watch) in watches {
            watch.shutdown().await;
        }
        tracing::info!(libraries = count, "Library watcher stopped");
    }
}

impl fmt::Debug for LibraryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("LibraryWatcher");
        debug.field("config", &self.config);
        match self.libraries.try_read() {
            Ok(guard) => debug.field("libraries", &guard.len()),
            Err(_) => debug.field("libraries", &"<locked>"),
        };
        debug.finish()
    }
}

fn start_watcher(
    root: &Path,
    tx: mpsc::Sender<WatchMessage>,
    overflowed: Arc<AtomicBool>,
) -> WorkerResult<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let message = match res {
                Ok(event) => WatchMessage::Event(event),
                Err(e) => WatchMessage::Error(e.to_string()),
            };
            // Runs on the notify thread, which must never block
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message) {
                overflowed.store(true, Ordering::SeqCst);
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|e| WorkerError::Internal(format!("cannot create watcher: {e}")))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| WorkerError::Internal(format!("cannot watch {}: {e}", root.display())))?;
    Ok(watcher)
}

async fn flush_loop(
    library: MusicLibrary,
    mut inbox: Inbox,
    queue: QueueSender<ScanJob>,
    debounce: Duration,
    stop: CancellationToken,
) {
    let mut pending = PendingChanges::default();
    let mut closing = false;

    loop {
        let message = tokio::select! {
            _ = stop.cancelled(), if !closing => {
                // Buffered events are still received, then `recv` ends
                inbox.rx.close();
                closing = true;
                continue;
            }
            message = inbox.rx.recv() => message,
            _ = sleep(debounce), if !pending.is_empty() => {
                if !flush(&library, std::mem::take(&mut pending), &queue).await {
                    return;
                }
                continue;
            }
        };

        let Some(message) = message else {
            flush(&library, pending, &queue).await;
            return;
        };

        if inbox.overflowed.swap(false, Ordering::SeqCst) {
            tracing::warn!(library_id = %library.id, "Watch buffer overflowed, rescanning library");
            pending.record(Change::Rescan);
        }
        match message {
            WatchMessage::Event(event) => {
                for change in classify(&event, &library.root) {
                    pending.record(change);
                }
            }
            WatchMessage::Error(error) => {
                tracing::warn!(library_id = %library.id, error = %error, "Watcher error, rescanning library");
                pending.record(Change::Rescan);
            }
        }
    }
}

/// `false` once the scan queue is closed
async fn flush(library: &MusicLibrary, pending: PendingChanges, queue: &QueueSender<ScanJob>) -> bool {
    if pending.is_empty() {
        return true;
    }
    let events = pending.events;
    for job in pending.into_jobs(library) {
        let scope = job.specific_directory.clone();
        if let Err(e) = queue.enqueue(job).await {
            tracing::warn!(library_id = %library.id, error = %e, "Dropping filesystem scan");
            return false;
        }
        tracing::info!(
            library_id = %library.id,
            directory = ?scope,
            events,
            "Queued scan for filesystem changes"
        );
    }
    true
}

/// Map one notification onto catalogue changes under `root`
fn classify(event: &Event, root: &Path) -> Vec<Change> {
    if event.need_rescan() {
        return vec![Change::Rescan];
    }

    let paths = event.paths.iter().filter(|p| p.starts_with(root));
    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            paths.filter_map(|p| touched_directory(p, root)).map(Change::Directory).collect()
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::To => paths
                .filter_map(|p| touched_directory(p, root))
                .map(Change::Directory)
                .collect(),
            // The old path is gone; a full pass picks up the new one too
            RenameMode::From | RenameMode::Both | RenameMode::Any | RenameMode::Other => {
                if event.paths.iter().any(|p| p.starts_with(root)) {
                    vec![Change::Removed]
                } else {
                    Vec::new()
                }
            }
        },
        EventKind::Remove(_) => paths
            .filter(|p| is_audio_file(p) || p.extension().is_none())
            .map(|_| Change::Removed)
            .take(1)
            .collect(),
        _ => Vec::new(),
    }
}

/// Directory to rescan for a created or modified path
fn touched_directory(path: &Path, root: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        return Some(path.to_path_buf());
    }
    if !is_audio_file(path) {
        return None;
    }
    Some(path.parent().unwrap_or(root).to_path_buf())
}
