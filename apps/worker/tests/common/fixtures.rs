//! Test fixtures for worker integration tests
//!
//! Provides temporary music libraries populated with small WAV files, corrupt
//! files and the helpers to register them with a store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reef_shared_config::TranscodeConfig;
use reef_worker::{InMemoryLibraryStore, LibraryStore, MusicLibrary};
use tempfile::TempDir;

/// Sample rate of generated fixtures
pub const FIXTURE_SAMPLE_RATE: u32 = 8000;

/// Generate a mono sine tone
pub fn tone(seconds: f32, frequency: f32) -> Vec<i16> {
    let count = (seconds * FIXTURE_SAMPLE_RATE as f32) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / FIXTURE_SAMPLE_RATE as f32;
            ((t * frequency * std::f32::consts::TAU).sin() * 8000.0) as i16
        })
        .collect()
}

/// Write a 16-bit PCM mono WAV file
pub fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) {
    let data_len = (samples.len() * 2) as u32;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    std::fs::write(path, bytes).expect("Failed to write WAV fixture");
}

/// A music library in a temporary directory
pub struct TestLibrary {
    dir: TempDir,
    pub library: MusicLibrary,
}

impl TestLibrary {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp library");
        let root = dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp library");
        Self {
            dir,
            library: MusicLibrary::new(root),
        }
    }

    /// Create the library and register it with `store`
    pub async fn registered(store: &InMemoryLibraryStore) -> Self {
        let library = Self::new();
        store
            .register_library(library.library.clone())
            .await
            .expect("Failed to register library");
        library
    }

    pub fn root(&self) -> &Path {
        &self.library.root
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    /// Add a playable track; `seconds` controls the file size
    pub fn add_track(&self, relative: &str, seconds: f32) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        write_wav(&path, FIXTURE_SAMPLE_RATE, &tone(seconds, 440.0));
        path
    }

    /// Add a file with an audio extension that no parser accepts
    pub fn add_corrupt(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(&path, b"this is not a flac stream at all").expect("Failed to write file");
        path
    }

    /// Add a file the scanner must ignore
    pub fn add_other(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        std::fs::write(&path, b"cover").expect("Failed to write file");
        path
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.path(relative)).expect("Failed to remove file");
    }

    pub fn temp_dir(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// Store with one registered library
pub async fn store_with_library() -> (Arc<InMemoryLibraryStore>, TestLibrary) {
    let store = Arc::new(InMemoryLibraryStore::new());
    let library = TestLibrary::registered(&store).await;
    (store, library)
}

/// Transcode configuration rooted in a temp directory
pub fn transcode_config(work_dir: &Path) -> TranscodeConfig {
    TranscodeConfig {
        max_concurrent: 4,
        playlist_timeout_secs: 5,
        idle_timeout_secs: 300,
        ..TranscodeConfig::with_work_dir(work_dir)
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
