//! Byte streams handed to HTTP handlers

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{stream, TryStreamExt};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;

use super::process::ProcessState;

pub const HLS_PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const HLS_SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Read size while following a growing file
const CHUNK_SIZE: usize = 64 * 1024;

/// How often a follower re-checks a file that has not grown
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Audio handed to the caller; dropping it closes the underlying file
pub struct TrackStream {
    pub stream: ByteStream,
    pub content_type: String,
    /// Known only once the output is complete
    pub length: Option<u64>,
    pub file_name: String,
}

impl TrackStream {
    /// Drain the stream into memory
    pub async fn read_to_end(self) -> io::Result<Vec<u8>> {
        self.stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }
}

impl fmt::Debug for TrackStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackStream")
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// Last time a job's output was requested or read
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream a finished file
pub fn file_stream(file: File) -> ByteStream {
    Box::pin(ReaderStream::new(file))
}

/// Stream an in-memory snapshot
pub fn snapshot_stream(bytes: Bytes) -> ByteStream {
    Box::pin(stream::iter(std::iter::once(Ok(bytes))))
}

/// Follow a file an encoder is still writing
///
/// Yields data as it is appended and ends once the process has exited
/// successfully and everything was read. If the process fails, the data
/// written so far is yielded followed by an error item.
pub fn follow_file(
    path: PathBuf,
    state: watch::Receiver<ProcessState>,
    activity: Arc<Activity>,
) -> ByteStream {
    let follower = Follower {
        path,
        file: None,
        state,
        activity,
        done: false,
    };

    Box::pin(stream::unfold(follower, |mut follower| async move {
        if follower.done {
            return None;
        }
        match follower.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), follower)),
            Ok(None) => None,
            Err(e) => {
                follower.done = true;
                Some((Err(e), follower))
            }
        }
    }))
}

struct Follower {
    path: PathBuf,
    file: Option<File>,
    state: watch::Receiver<ProcessState>,
    activity: Arc<Activity>,
    done: bool,
}

impl Follower {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Taken before reading: a terminal state seen here means every
            // byte was already on disk when the read hit EOF
            let observed = self.state.borrow().clone();

            if self.file.is_none() {
                match File::open(&self.path).await {
                    Ok(file) => self.file = Some(file),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        if observed.is_terminal() {
                            return Err(failure(&observed, "encoder produced no output"));
                        }
                        self.wait_for_progress().await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let Some(file) = self.file.as_mut() else {
                continue;
            };

            let mut buf = vec![0u8; CHUNK_SIZE];
            let n = file.read(&mut buf).await?;
            if n > 0 {
                buf.truncate(n);
                self.activity.touch();
                return Ok(Some(Bytes::from(buf)));
            }

            if observed.is_terminal() {
                if observed.is_success() {
                    return Ok(None);
                }
                return Err(failure(&observed, "encoder failed"));
            }
            self.wait_for_progress().await?;
        }
    }

    async fn wait_for_progress(&mut self) -> io::Result<()> {
        tokio::select! {
            changed = self.state.changed() => changed.map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "encoder supervisor stopped")
            }),
            _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => Ok(()),
        }
    }
}

fn failure(state: &ProcessState, fallback: &str) -> io::Error {
    let reason = state
        .failure_reason()
        .unwrap_or_else(|| fallback.to_string());
    io::Error::new(io::ErrorKind::Other, reason)
}
