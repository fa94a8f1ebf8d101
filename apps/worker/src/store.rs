//! Persistence seam for the pipeline
//!
//! The relational schema lives with the API service. Workers only see the
//! [`LibraryStore`] trait; [`InMemoryLibraryStore`] backs the binary and the
//! tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::WorkerResult;
use crate::jobs::metadata::normalize_name;
use crate::models::{MusicLibrary, TrackRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumRecord {
    pub id: Uuid,
    pub artist_id: Uuid,
    pub title: String,
    pub year: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreRecord {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: Uuid,
    pub library_id: Uuid,
    pub file_path: PathBuf,
    pub title: String,
    pub artist_id: Uuid,
    pub album_id: Option<Uuid>,
    pub genre_id: Option<Uuid>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<u32>,
    pub duration_ms: u64,
    pub file_size: u64,
    pub modified_at: DateTime<Utc>,
    pub natural_key: String,
}

impl TrackRecord {
    pub fn track_ref(&self) -> TrackRef {
        TrackRef::new(self.id, self.file_path.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEmbedding {
    pub track_id: Uuid,
    pub vector: Vec<f32>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Album named by a track's tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumTag {
    pub title: String,
    /// Album artist when it differs from the track artist
    pub artist: Option<String>,
}

/// Catalogue names read from a track's tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueTags {
    pub artist: String,
    pub album: Option<AlbumTag>,
    pub genre: Option<String>,
    pub year: Option<u32>,
}

/// Whether an upsert created or replaced a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Read-write access to the library catalogue
#[async_trait]
pub trait LibraryStore: Send + Sync {
    // ========== Libraries ==========
    async fn register_library(&self, library: MusicLibrary) -> WorkerResult<()>;

    async fn library(&self, id: Uuid) -> WorkerResult<Option<MusicLibrary>>;

    async fn libraries(&self) -> WorkerResult<Vec<MusicLibrary>>;

    /// Stamp `last_scan`, returning the previous value
    async fn mark_scanned(
        &self,
        library_id: Uuid,
        at: DateTime<Utc>,
    ) -> WorkerResult<Option<DateTime<Utc>>>;

    // ========== Catalogue ==========
    async fn upsert_artist(&self, name: &str) -> WorkerResult<Uuid>;

    async fn upsert_album(&self, artist_id: Uuid, title: &str, year: Option<u32>)
        -> WorkerResult<Uuid>;

    async fn upsert_genre(&self, name: &str) -> WorkerResult<Uuid>;

    /// Insert or replace the track stored under `(library_id, file_path)`
    ///
    /// The stored id wins over `track.id` when the path is already known.
    async fn upsert_track(&self, track: TrackRecord) -> WorkerResult<(Uuid, UpsertOutcome)>;

    /// Resolve the artist, album and genre named by `tags` and upsert the
    /// track pointing at them as one write
    ///
    /// Ids already set on `track` for those three are overwritten. A
    /// concurrent [`prune_orphans`](Self::prune_orphans) never observes the
    /// resolved rows without the track that references them.
    async fn upsert_tagged_track(
        &self,
        tags: CatalogueTags,
        track: TrackRecord,
    ) -> WorkerResult<(Uuid, UpsertOutcome)>;

    async fn track(&self, id: Uuid) -> WorkerResult<Option<TrackRecord>>;

    async fn track_by_path(&self, library_id: Uuid, path: &Path)
        -> WorkerResult<Option<TrackRecord>>;

    async fn tracks_in_library(&self, library_id: Uuid) -> WorkerResult<Vec<TrackRecord>>;

    async fn remove_tracks(&self, ids: &[Uuid]) -> WorkerResult<usize>;

    /// Delete albums, artists and genres no track references any more
    async fn prune_orphans(&self) -> WorkerResult<usize>;

    // ========== Embeddings ==========
    async fn save_embedding(&self, embedding: TrackEmbedding) -> WorkerResult<()>;

    async fn embedding(&self, track_id: Uuid) -> WorkerResult<Option<TrackEmbedding>>;
}

#[derive(Debug, Default)]
struct Catalogue {
    libraries: HashMap<Uuid, MusicLibrary>,
    artists: HashMap<Uuid, ArtistRecord>,
    albums: HashMap<Uuid, AlbumRecord>,
    genres: HashMap<Uuid, GenreRecord>,
    tracks: HashMap<Uuid, TrackRecord>,
    embeddings: HashMap<Uuid, TrackEmbedding>,
}

// The `bool` in each lookup says whether a row was created or changed
impl Catalogue {
    fn artist_id(&mut self, name: &str) -> (Uuid, bool) {
        let key = normalize_name(name);
        if let Some(existing) = self.artists.values().find(|a| normalize_name(&a.name) == key) {
            return (existing.id, false);
        }
        let id = Uuid::new_v4();
        self.artists.insert(
            id,
            ArtistRecord {
                id,
                name: name.to_string(),
            },
        );
        (id, true)
    }

    fn album_id(&mut self, artist_id: Uuid, title: &str, year: Option<u32>) -> (Uuid, bool) {
        let key = normalize_name(title);
        if let Some(existing) = self
            .albums
            .values_mut()
            .find(|a| a.artist_id == artist_id && normalize_name(&a.title) == key)
        {
            let fill_year = existing.year.is_none() && year.is_some();
            if fill_year {
                existing.year = year;
            }
            return (existing.id, fill_year);
        }
        let id = Uuid::new_v4();
        self.albums.insert(
            id,
            AlbumRecord {
                id,
                artist_id,
                title: title.to_string(),
                year,
            },
        );
        (id, true)
    }

    fn genre_id(&mut self, name: &str) -> (Uuid, bool) {
        let key = normalize_name(name);
        if let Some(existing) = self.genres.values().find(|g| normalize_name(&g.name) == key) {
            return (existing.id, false);
        }
        let id = Uuid::new_v4();
        self.genres.insert(
            id,
            GenreRecord {
                id,
                name: name.to_string(),
            },
        );
        (id, true)
    }

    fn put_track(&mut self, mut track: TrackRecord) -> (Uuid, UpsertOutcome) {
        let existing = self
            .tracks
            .values()
            .find(|t| t.library_id == track.library_id && t.file_path == track.file_path)
            .map(|t| t.id);

        let outcome = match existing {
            Some(id) => {
                track.id = id;
                UpsertOutcome::Updated
            }
            None => UpsertOutcome::Inserted,
        };
        let id = track.id;
        self.tracks.insert(id, track);
        (id, outcome)
    }
}

/// Process-local store
///
/// Every catalogue mutation bumps [`metadata_writes`](Self::metadata_writes);
/// library bookkeeping and embeddings are not counted.
#[derive(Debug, Default)]
pub struct InMemoryLibraryStore {
    state: RwLock<Catalogue>,
    writes: AtomicU64,
}

impl InMemoryLibraryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn track_count(&self) -> usize {
        self.state.read().await.tracks.len()
    }

    pub async fn artists(&self) -> Vec<ArtistRecord> {
        self.state.read().await.artists.values().cloned().collect()
    }

    pub async fn albums(&self) -> Vec<AlbumRecord> {
        self.state.read().await.albums.values().cloned().collect()
    }

    pub async fn genres(&self) -> Vec<GenreRecord> {
        self.state.read().await.genres.values().cloned().collect()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LibraryStore for InMemoryLibraryStore {
    async fn register_library(&self, library: MusicLibrary) -> WorkerResult<()> {
        self.state
            .write()
            .await
            .libraries
            .insert(library.id, library);
        Ok(())
    }

    async fn library(&self, id: Uuid) -> WorkerResult<Option<MusicLibrary>> {
        Ok(self.state.read().await.libraries.get(&id).cloned())
    }

    async fn libraries(&self) -> WorkerResult<Vec<MusicLibrary>> {
        Ok(self.state.read().await.libraries.values().cloned().collect())
    }

    async fn mark_scanned(
        &self,
        library_id: Uuid,
        at: DateTime<Utc>,
    ) -> WorkerResult<Option<DateTime<Utc>>> {
        let mut state = self.state.write().await;
        let library = state.libraries.get_mut(&library_id).ok_or_else(|| {
            crate::error::WorkerError::NotFound(format!("library {}", library_id))
        })?;
        Ok(library.last_scan.replace(at))
    }

    async fn upsert_artist(&self, name: &str) -> WorkerResult<Uuid> {
        let (id, wrote) = self.state.write().await.artist_id(name);
        if wrote {
            self.record_write();
        }
        Ok(id)
    }

    async fn upsert_album(
        &self,
        artist_id: Uuid,
        title: &str,
        year: Option<u32>,
    ) -> WorkerResult<Uuid> {
        let (id, wrote) = self.state.write().await.album_id(artist_id, title, year);
        if wrote {
            self.record_write();
        }
        Ok(id)
    }

    async fn upsert_genre(&self, name: &str) -> WorkerResult<Uuid> {
        let (id, wrote) = self.state.write().await.genre_id(name);
        if wrote {
            self.record_write();
        }
        Ok(id)
    }

    async fn upsert_track(&self, track: TrackRecord) -> WorkerResult<(Uuid, UpsertOutcome)> {
        let upserted = self.state.write().await.put_track(track);
        self.record_write();
        Ok(upserted)
    }

    async fn upsert_tagged_track(
        &self,
        tags: CatalogueTags,
        mut track: TrackRecord,
    ) -> WorkerResult<(Uuid, UpsertOutcome)> {
        let mut state = self.state.write().await;

        let (artist_id, _) = state.artist_id(&tags.artist);
        track.artist_id = artist_id;
        track.album_id = tags.album.as_ref().map(|album| {
            let owner_id = match &album.artist {
                Some(owner) => state.artist_id(owner).0,
                None => artist_id,
            };
            state.album_id(owner_id, &album.title, tags.year).0
        });
        track.genre_id = tags.genre.as_deref().map(|genre| state.genre_id(genre).0);

        let upserted = state.put_track(track);
        self.record_write();
        Ok(upserted)
    }

    async fn track(&self, id: Uuid) -> WorkerResult<Option<TrackRecord>> {
        Ok(self.state.read().await.tracks.get(&id).cloned())
    }

    async fn track_by_path(
        &self,
        library_id: Uuid,
        path: &Path,
    ) -> WorkerResult<Option<TrackRecord>> {
        Ok(self
            .state
            .read()
            .await
            .tracks
            .values()
            .find(|t| t.library_id == library_id && t.file_path == path)
            .cloned())
    }

    async fn tracks_in_library(&self, library_id: Uuid) -> WorkerResult<Vec<TrackRecord>> {
        Ok(self
            .state
            .read()
            .await
            .tracks
            .values()
            .filter(|t| t.library_id == library_id)
            .cloned()
            .collect())
    }

    async fn remove_tracks(&self, ids: &[Uuid]) -> WorkerResult<usize> {
        let mut state = self.state.write().await;
        let mut removed = 0;
        for id in ids {
            if state.tracks.remove(id).is_some() {
                state.embeddings.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            self.record_write();
        }
        Ok(removed)
    }

    async fn prune_orphans(&self) -> WorkerResult<usize> {
        let mut state = self.state.write().await;
        let Catalogue {
            artists,
            albums,
            genres,
            tracks,
            ..
        } = &mut *state;

        let before = artists.len() + albums.len() + genres.len();

        albums.retain(|id, _| tracks.values().any(|t| t.album_id == Some(*id)));
        genres.retain(|id, _| tracks.values().any(|t| t.genre_id == Some(*id)));
        artists.retain(|id, _| {
            tracks.values().any(|t| t.artist_id == *id)
                || albums.values().any(|a| a.artist_id == *id)
        });

        let pruned = before - (artists.len() + albums.len() + genres.len());
        if pruned > 0 {
            self.record_write();
        }
        Ok(pruned)
    }

    async fn save_embedding(&self, embedding: TrackEmbedding) -> WorkerResult<()> {
        self.state
            .write()
            .await
            .embeddings
            .insert(embedding.track_id, embedding);
        Ok(())
    }

    async fn embedding(&self, track_id: Uuid) -> WorkerResult<Option<TrackEmbedding>> {
        Ok(self.state.read().await.embeddings.get(&track_id).cloned())
    }
}
