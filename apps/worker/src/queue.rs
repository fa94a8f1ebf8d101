//! Typed FIFO job queues
//!
//! A `JobQueue<T>` is a thin layer over a tokio mpsc channel: any number of
//! producers hold a cloneable [`QueueSender`], exactly one worker loop owns
//! the [`QueueReceiver`] and drains it. Queues default to unbounded; a
//! capacity can be configured together with a [`BackpressurePolicy`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// What a bounded queue does with a producer when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Suspend the producer until capacity frees up
    #[default]
    Block,
    /// Fail the enqueue with [`QueueError::Full`]
    Reject,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown backpressure policy '{}'", other)),
        }
    }
}

/// Capacity settings for a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueConfig {
    /// `None` means unbounded
    pub capacity: Option<usize>,
    pub backpressure: BackpressurePolicy,
}

impl QueueConfig {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize, backpressure: BackpressurePolicy) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            backpressure,
        }
    }

    /// Build from an environment-style capacity where 0 means unbounded
    pub fn from_capacity(capacity: usize, backpressure: BackpressurePolicy) -> Self {
        if capacity == 0 {
            Self::unbounded()
        } else {
            Self::bounded(capacity, backpressure)
        }
    }
}

/// Errors returned to producers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue '{0}' is closed")]
    Closed(String),

    #[error("queue '{queue}' is full (capacity {capacity})")]
    Full { queue: String, capacity: usize },
}

struct Shared {
    name: String,
    pending: AtomicUsize,
}

/// A `pending` increment that is rolled back unless the job was sent
///
/// Counted before the send so the consumer can never decrement first. A
/// producer that fails, or whose parked `enqueue` is dropped, releases it.
struct PendingSlot<'a> {
    pending: &'a AtomicUsize,
    committed: bool,
}

impl<'a> PendingSlot<'a> {
    fn reserve(pending: &'a AtomicUsize) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self {
            pending,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

enum SenderInner<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

enum ReceiverInner<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// Producer half; clone it for every producer
pub struct QueueSender<T> {
    inner: SenderInner<T>,
    shared: Arc<Shared>,
    config: QueueConfig,
}

/// Consumer half; owned by exactly one worker loop
pub struct QueueReceiver<T> {
    inner: ReceiverInner<T>,
    shared: Arc<Shared>,
}

/// A named queue before it is split between producers and its consumer
pub struct JobQueue<T> {
    sender: QueueSender<T>,
    receiver: QueueReceiver<T>,
}

impl<T> JobQueue<T> {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            pending: AtomicUsize::new(0),
        });

        let (sender, receiver) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (SenderInner::Bounded(tx), ReceiverInner::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (SenderInner::Unbounded(tx), ReceiverInner::Unbounded(rx))
            }
        };

        Self {
            sender: QueueSender {
                inner: sender,
                shared: shared.clone(),
                config,
            },
            receiver: QueueReceiver {
                inner: receiver,
                shared,
            },
        }
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, QueueConfig::unbounded())
    }

    pub fn sender(&self) -> QueueSender<T> {
        self.sender.clone()
    }

    pub fn split(self) -> (QueueSender<T>, QueueReceiver<T>) {
        (self.sender, self.receiver)
    }
}

impl<T> QueueSender<T> {
    /// Append a job to the queue
    ///
    /// Never waits on an unbounded queue. On a bounded queue that is full the
    /// configured policy either waits for a free slot or rejects the job.
    pub async fn enqueue(&self, job: T) -> Result<(), QueueError> {
        let slot = PendingSlot::reserve(&self.shared.pending);

        match &self.inner {
            SenderInner::Unbounded(tx) => tx.send(job).map_err(|_| self.closed())?,
            SenderInner::Bounded(tx) => match self.config.backpressure {
                BackpressurePolicy::Block => tx.send(job).await.map_err(|_| self.closed())?,
                BackpressurePolicy::Reject => self.try_send_bounded(tx, job)?,
            },
        }

        slot.commit();
        Ok(())
    }

    /// Append a job without ever waiting
    pub fn try_enqueue(&self, job: T) -> Result<(), QueueError> {
        let slot = PendingSlot::reserve(&self.shared.pending);

        match &self.inner {
            SenderInner::Unbounded(tx) => tx.send(job).map_err(|_| self.closed())?,
            SenderInner::Bounded(tx) => self.try_send_bounded(tx, job)?,
        }

        slot.commit();
        Ok(())
    }

    fn try_send_bounded(&self, tx: &mpsc::Sender<T>, job: T) -> Result<(), QueueError> {
        tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full {
                queue: self.shared.name.clone(),
                capacity: self.config.capacity.unwrap_or_default(),
            },
            mpsc::error::TrySendError::Closed(_) => self.closed(),
        })
    }

    fn closed(&self) -> QueueError {
        QueueError::Closed(self.shared.name.clone())
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.is_closed(),
            SenderInner::Unbounded(tx) => tx.is_closed(),
        }
    }

    /// Jobs enqueued but not yet dequeued
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            SenderInner::Bounded(tx) => SenderInner::Bounded(tx.clone()),
            SenderInner::Unbounded(tx) => SenderInner::Unbounded(tx.clone()),
        };
        Self {
            inner,
            shared: self.shared.clone(),
            config: self.config,
        }
    }
}

impl<T> fmt::Debug for QueueSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSender")
            .field("name", &self.shared.name)
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<T> QueueReceiver<T> {
    /// Wait for the next job
    ///
    /// Returns `None` once the queue is closed and its backlog drained.
    pub async fn dequeue(&mut self) -> Option<T> {
        let job = match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        };

        if job.is_some() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    /// Stop accepting new jobs; already queued jobs can still be dequeued
    pub fn close(&mut self) {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.close(),
            ReceiverInner::Unbounded(rx) => rx.close(),
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<T> fmt::Debug for QueueReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueReceiver")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<T> fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.sender.shared.name)
            .field("config", &self.sender.config)
            .finish()
    }
}
