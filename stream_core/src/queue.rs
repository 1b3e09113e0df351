//! Relay queue: the hand-off between the provider's frame callbacks and the
//! task that drains audio towards the client.
//!
//! The producer half is synchronous and never blocks, so it can be called from
//! a provider callback running on any thread. The consumer half is async and
//! suspends in [`RelayConsumer::dequeue`] until a frame or the terminal marker
//! is available. The queue holds any number of frames but at most
//! `max_buffered_bytes` of audio; a frame that would exceed the ceiling trips
//! [`StreamError::QueueOverflow`], which is fatal to the session.
//!
//! The ceiling is never exceeded: the frame that would cross it is refused
//! itself, not the one after it. Frames already accepted stay deliverable.
//!
//! Dropping the last producer handle without closing the queue reads as
//! [`StreamError::UpstreamInterrupted`] on the consumer side.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::frame::AudioFrame;

/// Default backpressure ceiling: roughly three minutes of 24 kHz mono PCM.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;

/// Receiver of provider callbacks.
///
/// Implementations must return quickly and must not assume they run on the
/// same thread or runtime as whoever consumes the audio.
pub trait FrameSink: Send + Sync + 'static {
    /// Hand over one frame. Returns `false` once the sink accepts no more
    /// frames, so the caller can stop reading from the provider.
    fn on_frame(&self, data: Bytes) -> bool;
    /// The provider signalled that the request is fully spoken.
    fn on_complete(&self);
    /// The provider side failed; frames delivered so far stay valid.
    fn on_error(&self, err: StreamError);
}

enum Item {
    Frame(AudioFrame),
    End,
    Failed(StreamError),
}

/// What the consumer gets back from [`RelayConsumer::dequeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued {
    Frame(AudioFrame),
    EndOfStream,
    Error(StreamError),
}

impl Dequeued {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Dequeued::Frame(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted with the given local sequence index
    Queued(u64),
    /// The queue was already closed; the frame was discarded and logged
    DroppedAfterClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub buffered_bytes: usize,
    pub frames_enqueued: u64,
    pub protocol_violations: u64,
}

struct WriteHalf {
    tx: Option<mpsc::UnboundedSender<Item>>,
    next_seq: u64,
}

struct Shared {
    ceiling: usize,
    buffered: AtomicUsize,
    violations: AtomicU64,
    producers: AtomicUsize,
    writer: Mutex<WriteHalf>,
}

impl Shared {
    // The critical section is a few field updates and a non-blocking send; a
    // panic inside it cannot leave the state half-written, so poison is ignored.
    fn lock_writer(&self) -> MutexGuard<'_, WriteHalf> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a queue that holds at most `max_buffered_bytes` of undelivered audio.
pub fn relay_queue(max_buffered_bytes: usize) -> (RelayProducer, RelayConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        ceiling: max_buffered_bytes,
        buffered: AtomicUsize::new(0),
        violations: AtomicU64::new(0),
        producers: AtomicUsize::new(1),
        writer: Mutex::new(WriteHalf {
            tx: Some(tx),
            next_seq: 0,
        }),
    });
    (
        RelayProducer {
            shared: shared.clone(),
        },
        RelayConsumer {
            shared,
            rx,
            delivered: 0,
            finished: false,
        },
    )
}

/// Write side of the relay queue. Cheap to clone, safe to use from any thread.
pub struct RelayProducer {
    shared: Arc<Shared>,
}

impl Clone for RelayProducer {
    fn clone(&self) -> Self {
        self.shared.producers.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for RelayProducer {
    fn drop(&mut self) {
        if self.shared.producers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut half = self.shared.lock_writer();
        if let Some(tx) = half.tx.take() {
            warn!(frames = half.next_seq, "Relay producer dropped without closing the queue");
            let _ = tx.send(Item::Failed(StreamError::UpstreamInterrupted {
                frames: half.next_seq,
                reason: "producer went away without a completion signal".to_string(),
            }));
        }
    }
}

impl RelayProducer {
    /// Append a frame without blocking.
    ///
    /// A frame is refused when the buffered total plus its own length would
    /// pass the ceiling.
    pub fn enqueue(&self, data: Bytes) -> Result<EnqueueOutcome, StreamError> {
        let len = data.len();
        let mut half = self.shared.lock_writer();

        if half.tx.is_none() {
            self.shared.violations.fetch_add(1, Ordering::Relaxed);
            warn!(bytes = len, "Frame enqueued after the relay queue was closed; dropping it");
            return Ok(EnqueueOutcome::DroppedAfterClose);
        }

        let buffered = self.shared.buffered.load(Ordering::Acquire);
        if buffered + len > self.shared.ceiling {
            let err = StreamError::QueueOverflow {
                buffered: buffered + len,
                ceiling: self.shared.ceiling,
            };
            warn!(buffered, frame_bytes = len, ceiling = self.shared.ceiling, "Relay queue overflow");
            if let Some(tx) = half.tx.take() {
                let _ = tx.send(Item::Failed(err.clone()));
            }
            return Err(err);
        }

        let seq = half.next_seq;
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        let sent = match half.tx.as_ref() {
            Some(tx) => tx.send(Item::Frame(AudioFrame::new(seq, data))).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            half.tx = None;
            debug!(seq, "Relay consumer is gone; dropping frame");
            return Ok(EnqueueOutcome::DroppedAfterClose);
        }
        half.next_seq += 1;
        Ok(EnqueueOutcome::Queued(seq))
    }

    /// Mark the end of input. The terminal marker (end-of-stream, or `err`)
    /// is queued behind every frame already accepted. Returns `false` if the
    /// queue was already closed.
    pub fn close_for_writes(&self, err: Option<StreamError>) -> bool {
        let mut half = self.shared.lock_writer();
        match half.tx.take() {
            Some(tx) => {
                let item = match err {
                    Some(err) => Item::Failed(err),
                    None => Item::End,
                };
                let _ = tx.send(item);
                true
            }
            None => {
                if let Some(err) = err {
                    debug!(%err, "Relay queue already closed; terminal error not queued");
                }
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_writer().tx.is_none()
    }

    pub fn stats(&self) -> QueueStats {
        let frames_enqueued = self.shared.lock_writer().next_seq;
        QueueStats {
            buffered_bytes: self.shared.buffered.load(Ordering::Acquire),
            frames_enqueued,
            protocol_violations: self.shared.violations.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for RelayProducer {
    fn on_frame(&self, data: Bytes) -> bool {
        match self.enqueue(data) {
            Ok(EnqueueOutcome::Queued(_)) => true,
            Ok(EnqueueOutcome::DroppedAfterClose) => false,
            Err(_) => false,
        }
    }

    fn on_complete(&self) {
        self.close_for_writes(None);
    }

    fn on_error(&self, err: StreamError) {
        self.close_for_writes(Some(err));
    }
}

/// Read side of the relay queue. Exactly one consumer exists per queue.
pub struct RelayConsumer {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Item>,
    delivered: u64,
    finished: bool,
}

impl RelayConsumer {
    /// Wait for the next item.
    ///
    /// Frames come out in enqueue order; the terminal marker comes last and is
    /// repeated as `EndOfStream` on every later call. Cancel safe.
    pub async fn dequeue(&mut self) -> Dequeued {
        if self.finished {
            return Dequeued::EndOfStream;
        }
        match self.rx.recv().await {
            Some(Item::Frame(frame)) => {
                self.shared.buffered.fetch_sub(frame.len(), Ordering::AcqRel);
                self.delivered += 1;
                Dequeued::Frame(frame)
            }
            Some(Item::End) => {
                self.finished = true;
                Dequeued::EndOfStream
            }
            Some(Item::Failed(err)) => {
                self.finished = true;
                Dequeued::Error(err)
            }
            // Only if the sender went away without `Drop` running.
            None => {
                self.finished = true;
                Dequeued::Error(StreamError::UpstreamInterrupted {
                    frames: self.delivered,
                    reason: "producer went away without a completion signal".to_string(),
                })
            }
        }
    }

    /// Frames handed out so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Drain the queue as a stream that ends after the terminal item.
    pub fn into_stream(mut self) -> impl Stream<Item = Dequeued> + Send {
        async_stream::stream! {
            loop {
                let item = self.dequeue().await;
                let terminal = item.is_terminal();
                yield item;
                if terminal {
                    break;
                }
            }
        }
    }
}
