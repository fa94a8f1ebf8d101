//! Reef background job pipeline
//!
//! Library scanning, audio embedding generation and on-demand transcoding
//! for the Reef media server. Hosting services build a [`Pipeline`], spawn
//! its workers and talk to it through queues, the transcoder and the event
//! hub. Scans are also produced by a timer and by filesystem watches.

pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod store;
pub mod transcode;
pub mod triggers;

pub use config::Config;
pub use error::{WorkerError, WorkerResult};
pub use events::{EventEmitter, EventHub, PlaybackReporter};
pub use models::{EmbeddingJob, MusicLibrary, ScanJob, ScanTrigger, TrackRef};
pub use pipeline::{Pipeline, PipelineBuilder, WorkerHandles};
pub use progress::{ProgressSink, ScanProgress, ScanReporter, ScanSummary};
pub use queue::{JobQueue, QueueConfig, QueueError};
pub use store::{InMemoryLibraryStore, LibraryStore};
pub use transcode::TranscodeJobManager;
pub use triggers::{LibraryWatcher, ScanSchedule, ScanScheduler, WatchConfig};
