//! Typed publish/subscribe relays for domain events
//!
//! An [`EventEmitter`] is an explicit observer registry. `emit` runs every
//! handler synchronously, in subscription order, over a snapshot of the
//! registry taken before the first call. A handler may therefore unsubscribe
//! itself (or anyone else) while being invoked, and a handler that errors or
//! panics is logged without stopping the remaining handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MusicLibrary;

type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Opaque token returned by [`EventEmitter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

/// What happened during one `emit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmitOutcome {
    pub delivered: usize,
    pub failed: usize,
}

pub struct EventEmitter<T> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, Handler<T>>>,
}

impl<T> EventEmitter<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a handler; handlers run in the order they subscribed
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry().insert(id, Arc::new(handler));
        tracing::debug!(emitter = self.name, subscription = id, "Handler subscribed");
        SubscriptionHandle(id)
    }

    /// Remove a handler, returning whether it was still registered
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.registry().remove(&handle.0).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    /// Deliver `payload` to every current subscriber
    pub fn emit(&self, payload: &T) -> EmitOutcome {
        // Snapshot so handlers can (un)subscribe without deadlocking
        let snapshot: Vec<(u64, Handler<T>)> = self
            .registry()
            .iter()
            .map(|(id, handler)| (*id, handler.clone()))
            .collect();

        let mut outcome = EmitOutcome::default();
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        emitter = self.name,
                        subscription = id,
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(_) => {
                    outcome.failed += 1;
                    tracing::error!(
                        emitter = self.name,
                        subscription = id,
                        "Event handler panicked"
                    );
                }
            }
        }
        outcome
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Handler<T>>> {
        // A panicking handler never holds this lock, so poisoning is benign
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A library finished its first-ever scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicLibraryRegisteredEvent {
    pub library: MusicLibrary,
}

/// A client started playing a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPlaybackEvent {
    pub track_id: Uuid,
    pub played_at: DateTime<Utc>,
}

pub type MusicLibraryRegisteredEmitter = EventEmitter<MusicLibraryRegisteredEvent>;
pub type TrackPlaybackEmitter = EventEmitter<TrackPlaybackEvent>;

/// The emitters shared between the pipeline and its collaborators
#[derive(Debug)]
pub struct EventHub {
    pub library_registered: MusicLibraryRegisteredEmitter,
    pub track_playback: TrackPlaybackEmitter,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            library_registered: EventEmitter::new("library_registered"),
            track_playback: EventEmitter::new("track_playback"),
        }
    }

    pub fn on_library_registered(&self, library: MusicLibrary) -> EmitOutcome {
        self.library_registered
            .emit(&MusicLibraryRegisteredEvent { library })
    }

    pub fn on_track_playback(&self, track_id: Uuid) -> EmitOutcome {
        self.track_playback.emit(&TrackPlaybackEvent {
            track_id,
            played_at: Utc::now(),
        })
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side for playback events, handed to whatever serves audio
#[derive(Debug, Clone)]
pub struct PlaybackReporter {
    events: Arc<EventHub>,
}

impl PlaybackReporter {
    pub fn new(events: Arc<EventHub>) -> Self {
        Self { events }
    }

    pub fn report_playback(&self, track_id: Uuid) {
        let outcome = self.events.on_track_playback(track_id);
        tracing::debug!(
            track_id = %track_id,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Playback event emitted"
        );
    }
}
