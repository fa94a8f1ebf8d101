//! Transcoding request and job snapshot types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::encoder::TranscodeFormat;
use super::process::ProcessState;
use crate::models::TrackRef;

/// Kind of output a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeRequestType {
    /// One progressively written file
    SingleFile,
    /// HLS playlist plus MPEG-TS segments
    Hls,
}

/// What the caller wants transcoded; not retained once the job starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingJobRequest {
    pub source_track: TrackRef,
    pub request_type: TranscodeRequestType,
    /// Target bitrate in kbps
    pub bitrate: u32,
    #[serde(default)]
    pub format: TranscodeFormat,
}

impl TranscodingJobRequest {
    pub fn new(source_track: TrackRef, request_type: TranscodeRequestType, bitrate: u32) -> Self {
        Self {
            source_track,
            request_type,
            bitrate,
            format: TranscodeFormat::default(),
        }
    }

    pub fn single_file(source_track: TrackRef, bitrate: u32) -> Self {
        Self::new(source_track, TranscodeRequestType::SingleFile, bitrate)
    }

    pub fn hls(source_track: TrackRef, bitrate: u32) -> Self {
        Self::new(source_track, TranscodeRequestType::Hls, bitrate)
    }

    pub fn with_format(mut self, format: TranscodeFormat) -> Self {
        self.format = format;
        self
    }
}

/// Point-in-time view of a transcoding job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodingJob {
    pub id: Uuid,
    pub source_track: TrackRef,
    /// Set for single-file jobs
    pub output_path: Option<PathBuf>,
    /// Set for HLS jobs
    pub hls_playlist_path: Option<PathBuf>,
    pub request_type: TranscodeRequestType,
    pub requested_format: TranscodeFormat,
    pub bitrate: u32,
    pub process_exited: bool,
    pub process_state: ProcessState,
}

impl TranscodingJob {
    /// Output is complete and can be served with a known length
    pub fn is_complete(&self) -> bool {
        self.process_state.is_success()
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.process_state.failure_reason()
    }
}
