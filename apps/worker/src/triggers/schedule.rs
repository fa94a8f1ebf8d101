//! Startup and periodic library scans

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerResult;
use crate::models::{ScanJob, ScanTrigger};
use crate::queue::QueueSender;
use crate::store::LibraryStore;

/// When scheduled scans run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSchedule {
    /// Period between scans of every library; `None` disables them
    pub interval: Option<Duration>,
    /// Scan every library once shortly after start
    pub scan_on_startup: bool,
    /// Grace period before the startup scan
    pub startup_delay: Duration,
}

impl ScanSchedule {
    pub fn disabled() -> Self {
        Self {
            interval: None,
            scan_on_startup: false,
            startup_delay: Duration::ZERO,
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some() || self.scan_on_startup
    }
}

impl Default for ScanSchedule {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Enqueues full scans of every registered library on a timer
pub struct ScanScheduler {
    store: Arc<dyn LibraryStore>,
    queue: QueueSender<ScanJob>,
    schedule: ScanSchedule,
}

impl ScanScheduler {
    pub fn new(
        store: Arc<dyn LibraryStore>,
        queue: QueueSender<ScanJob>,
        schedule: ScanSchedule,
    ) -> Self {
        Self {
            store,
            queue,
            schedule,
        }
    }

    /// Queue one scheduled scan per library, returning how many were queued
    pub async fn trigger(&self) -> WorkerResult<usize> {
        let libraries = self.store.libraries().await?;
        if libraries.is_empty() {
            tracing::info!("No libraries registered, skipping scheduled scan");
            return Ok(0);
        }

        let mut queued = 0;
        for library in libraries {
            let root = library.root.clone();
            self.queue
                .enqueue(ScanJob::full(library, ScanTrigger::Scheduled))
                .await?;
            tracing::debug!(root = %root.display(), "Queued scheduled scan");
            queued += 1;
        }
        tracing::info!(libraries = queued, "Scheduled library scans queued");
        Ok(queued)
    }

    /// Run the schedule until `shutdown` fires or the scan queue closes
    pub async fn run_until(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = ?self.schedule.interval.map(|i| i.as_secs()),
            scan_on_startup = self.schedule.scan_on_startup,
            "Scan scheduler started"
        );

        if self.schedule.scan_on_startup {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.schedule.startup_delay) => {}
            }
            if !self.tick().await {
                return;
            }
        }

        let Some(period) = self.schedule.interval else {
            tracing::info!("Periodic library scans are disabled");
            return;
        };

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
        tracing::info!("Scan scheduler stopped");
    }

    /// `false` once the queue no longer accepts jobs
    async fn tick(&self) -> bool {
        match self.trigger().await {
            Ok(_) => true,
            Err(e) if self.queue.is_closed() => {
                tracing::info!(error = %e, "Scan queue closed, scheduler stopping");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Scheduled library scan failed");
                true
            }
        }
    }
}

impl std::fmt::Debug for ScanScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanScheduler")
            .field("schedule", &self.schedule)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MusicLibrary;
    use crate::queue::JobQueue;
    use crate::store::InMemoryLibraryStore;

    async fn store_with(libraries: usize) -> Arc<InMemoryLibraryStore> {
        let store = Arc::new(InMemoryLibraryStore::new());
        for i in 0..libraries {
            store
                .register_library(MusicLibrary::new(format!("/music/{i}")))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_trigger_queues_every_library() {
        let store = store_with(2).await;
        let (tx, mut rx) = JobQueue::unbounded("library_scan").split();
        let scheduler = ScanScheduler::new(store, tx, ScanSchedule::disabled());

        assert_eq!(scheduler.trigger().await.unwrap(), 2);
        for _ in 0..2 {
            let job = rx.dequeue().await.unwrap();
            assert_eq!(job.trigger, ScanTrigger::Scheduled);
            assert!(job.is_full_scope());
            assert!(!job.incremental);
        }
    }

    #[tokio::test]
    async fn test_trigger_without_libraries_is_noop() {
        let (tx, rx) = JobQueue::unbounded("library_scan").split();
        let scheduler = ScanScheduler::new(store_with(0).await, tx, ScanSchedule::disabled());
        assert_eq!(scheduler.trigger().await.unwrap(), 0);
        assert_eq!(rx.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_scans_follow_the_interval() {
        let store = store_with(1).await;
        let (tx, rx) = JobQueue::unbounded("library_scan").split();
        let schedule = ScanSchedule::every(Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(ScanScheduler::new(store, tx, schedule).run_until(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.pending(), 0);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(rx.pending(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_scan_waits_for_delay() {
        let store = store_with(1).await;
        let (tx, rx) = JobQueue::unbounded("library_scan").split();
        let schedule = ScanSchedule {
            interval: None,
            scan_on_startup: true,
            startup_delay: Duration::from_secs(5),
        };
        let task = tokio::spawn(
            ScanScheduler::new(store, tx, schedule).run_until(CancellationToken::new()),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.pending(), 0);

        // Without an interval the task ends after the startup scan
        task.await.unwrap();
        assert_eq!(rx.pending(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_stops_the_scheduler() {
        let store = store_with(1).await;
        let (tx, mut rx) = JobQueue::unbounded("library_scan").split();
        rx.close();

        let schedule = ScanSchedule {
            interval: Some(Duration::from_millis(10)),
            scan_on_startup: true,
            startup_delay: Duration::ZERO,
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            ScanScheduler::new(store, tx, schedule).run_until(CancellationToken::new()),
        )
        .await
        .expect("scheduler should stop once the queue is closed");
    }
}
