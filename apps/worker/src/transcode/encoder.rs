//! Encoder command construction
//!
//! An [`Encoder`] turns a transcoding request into the command line of an
//! external process. [`FfmpegEncoder`] is the production implementation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Output format for transcoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeFormat {
    Mp3,
    #[default]
    Aac,
    Opus,
    Flac,
}

impl TranscodeFormat {
    /// Parse format from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "aac" | "m4a" => Some(Self::Aac),
            "opus" | "ogg" => Some(Self::Opus),
            "flac" => Some(Self::Flac),
            _ => None,
        }
    }

    /// Container and codec arguments for a single output file
    fn ffmpeg_args(&self) -> &'static [&'static str] {
        match self {
            Self::Mp3 => &["-f", "mp3", "-c:a", "libmp3lame"],
            Self::Aac => &["-f", "adts", "-c:a", "aac"],
            Self::Opus => &["-f", "opus", "-c:a", "libopus"],
            Self::Flac => &["-f", "flac", "-c:a", "flac"],
        }
    }

    /// Codec used inside MPEG-TS HLS segments, if the format can be segmented
    fn hls_codec(&self) -> Option<&'static str> {
        match self {
            Self::Mp3 => Some("libmp3lame"),
            Self::Aac => Some("aac"),
            Self::Opus | Self::Flac => None,
        }
    }

    pub fn supports_hls(&self) -> bool {
        self.hls_codec().is_some()
    }

    /// Get default bitrate for format (in kbps)
    pub fn default_bitrate(&self) -> u32 {
        match self {
            Self::Mp3 => 320,
            Self::Aac => 256,
            Self::Opus => 128,
            Self::Flac => 0, // Lossless, no bitrate
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, Self::Flac)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Flac => "flac",
        }
    }

    /// Get MIME type for format
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Aac => "audio/aac",
            Self::Opus => "audio/opus",
            Self::Flac => "audio/flac",
        }
    }
}

impl FromStr for TranscodeFormat {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| WorkerError::InvalidTranscodeRequest(format!("unsupported format: {}", s)))
    }
}

impl std::fmt::Display for TranscodeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Where the encoder writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeTarget {
    SingleFile {
        output: PathBuf,
    },
    Hls {
        playlist: PathBuf,
        /// printf-style pattern, e.g. `segment_%05d.ts`
        segment_pattern: PathBuf,
        segment_secs: u32,
    },
}

/// Everything an encoder needs to build its command line
#[derive(Debug, Clone)]
pub struct EncodeRequest<'a> {
    pub source: &'a Path,
    pub job_dir: &'a Path,
    pub target: &'a EncodeTarget,
    pub format: TranscodeFormat,
    /// kbps; ignored by lossless formats
    pub bitrate: u32,
}

/// A ready-to-spawn command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodePlan {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl EncodePlan {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Builds encoder command lines
pub trait Encoder: Send + Sync {
    fn plan(&self, request: &EncodeRequest<'_>) -> EncodePlan;
}

/// FFmpeg command lines
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Encoder for FfmpegEncoder {
    fn plan(&self, request: &EncodeRequest<'_>) -> EncodePlan {
        let plan = EncodePlan::new(self.ffmpeg_path.as_os_str())
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
            .arg("-i")
            .arg(request.source)
            // Audio only; cover art streams would otherwise be encoded too
            .args(["-vn", "-map", "0:a:0"]);

        let bitrate = (!request.format.is_lossless() && request.bitrate > 0)
            .then(|| format!("{}k", request.bitrate));

        match request.target {
            EncodeTarget::SingleFile { output } => {
                let mut plan = plan.args(request.format.ffmpeg_args().iter().copied());
                if let Some(bitrate) = bitrate {
                    plan = plan.arg("-b:a").arg(bitrate);
                }
                plan.arg(output)
            }
            EncodeTarget::Hls {
                playlist,
                segment_pattern,
                segment_secs,
            } => {
                let codec = request.format.hls_codec().unwrap_or("aac");
                let mut plan = plan.arg("-c:a").arg(codec);
                if let Some(bitrate) = bitrate {
                    plan = plan.arg("-b:a").arg(bitrate);
                }
                plan.args(["-f", "hls", "-hls_time"])
                    .arg(segment_secs.to_string())
                    .args(["-hls_playlist_type", "event", "-hls_segment_filename"])
                    .arg(segment_pattern)
                    .arg(playlist)
            }
        }
    }
}
