//! Tag and property extraction for audio files

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use lofty::{Accessor, AudioFile, ItemKey, Probe, TaggedFileExt};

use crate::error::{WorkerError, WorkerResult};

/// Supported audio file extensions
/// Includes common lossy and lossless formats
pub const AUDIO_EXTENSIONS: &[&str] = &[
    // Lossy formats
    "mp3", "ogg", "opus", "aac", "m4a", "wma", "mpc", "ape", // Lossless formats
    "flac", "wav", "aiff", "aif", "alac", "dsf", "dff", "wv", // Container formats
    "m4b", "m4p", "m4r", "mp4", "3gp", "webm",
];

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Check if a file path has a supported audio extension
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Lowercase and collapse runs of whitespace
pub fn normalize_name(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `artist|album|title`, each part normalized
pub fn natural_key(artist: &str, album: Option<&str>, title: &str) -> String {
    format!(
        "{}|{}|{}",
        normalize_name(artist),
        normalize_name(album.unwrap_or("")),
        normalize_name(title)
    )
}

/// Size and modification time used for incremental change detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

impl FileStamp {
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let modified: SystemTime = meta.modified()?;
        Ok(Self {
            size: meta.len(),
            modified_at: DateTime::<Utc>::from(modified),
        })
    }
}

/// Extracted metadata from an audio file
#[derive(Debug, Clone, PartialEq)]
pub struct AudioMetadata {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<u32>,
    pub genre: Option<String>,
    pub duration_ms: u64,
}

impl AudioMetadata {
    pub fn natural_key(&self) -> String {
        natural_key(&self.artist, self.album.as_deref(), &self.title)
    }

    /// Artist the album is filed under
    pub fn album_owner(&self) -> &str {
        self.album_artist.as_deref().unwrap_or(&self.artist)
    }
}

/// Extract metadata from an audio file using lofty
pub fn extract_metadata(path: &Path) -> WorkerResult<AudioMetadata> {
    let path_str = path.display().to_string();

    let tagged_file = Probe::open(path)
        .map_err(|e| WorkerError::metadata_extraction(path_str.clone(), format!("open: {}", e)))?
        .read()
        .map_err(|e| WorkerError::metadata_extraction(path_str.clone(), format!("read: {}", e)))?;

    let duration_ms = tagged_file.properties().duration().as_millis() as u64;

    let tag = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag());

    // Untagged files are titled after their file name
    let fallback_title = || {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path_str.clone())
    };

    let metadata = match tag {
        Some(tag) => AudioMetadata {
            title: non_empty(tag.title().map(|s| s.into_owned())).unwrap_or_else(fallback_title),
            artist: non_empty(tag.artist().map(|s| s.into_owned()))
                .unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
            album: non_empty(tag.album().map(|s| s.into_owned())),
            album_artist: non_empty(tag.get_string(&ItemKey::AlbumArtist).map(|s| s.to_string())),
            track_number: tag.track(),
            disc_number: tag.disk(),
            year: tag.year(),
            genre: non_empty(tag.genre().map(|g| g.into_owned())),
            duration_ms,
        },
        None => AudioMetadata {
            title: fallback_title(),
            artist: UNKNOWN_ARTIST.to_string(),
            album: None,
            album_artist: None,
            track_number: None,
            disc_number: None,
            year: None,
            genre: None,
            duration_ms,
        },
    };

    Ok(metadata)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
