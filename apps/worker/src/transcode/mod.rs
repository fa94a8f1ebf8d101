//! On-demand audio transcoding
//!
//! Jobs run an external encoder into a per-job directory and their output
//! can be streamed while it is being written.

pub mod encoder;
pub mod job;
pub mod manager;
pub mod process;
pub mod stream;

pub use encoder::{EncodePlan, EncodeRequest, EncodeTarget, Encoder, FfmpegEncoder, TranscodeFormat};
pub use job::{TranscodeRequestType, TranscodingJob, TranscodingJobRequest};
pub use manager::{RequestScope, TranscodeJobManager, PLAYLIST_FILE_NAME, SEGMENT_PATTERN};
pub use process::{ProcessState, SupervisedProcess};
pub use stream::{ByteStream, TrackStream, HLS_PLAYLIST_CONTENT_TYPE, HLS_SEGMENT_CONTENT_TYPE};
