//! Client-side assembly of streamed audio into one playable payload.
//!
//! Frames accumulate until the stream is finalized, which happens exactly once
//! and by whichever comes first:
//!
//! * an explicit end-of-stream message,
//! * an in-band error (the partial audio is kept),
//! * the inactivity fallback: no frame for `quiet_window` after at least one
//!   frame has arrived.
//!
//! The fallback only exists because some upstreams never send a completion
//! marker. When it fires a warning is logged so that case shows up in
//! production logs.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::format::AudioFormat;
use crate::pcm;

pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub quiet_window: Duration,
    pub format: AudioFormat,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            quiet_window: DEFAULT_QUIET_WINDOW,
            format: AudioFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Nothing received yet. Not complete, just not started.
    Idle,
    Receiving,
    Finalized,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    EndOfStream,
    InactivityTimeout,
    Error,
}

/// Immutable result of finalization.
#[derive(Debug, Clone)]
pub struct AssembledAudio {
    /// Ordered concatenation of every frame received before finalization
    pub pcm: Bytes,
    pub frames: usize,
    pub format: AudioFormat,
    pub reason: FinalizeReason,
    pub error: Option<StreamError>,
}

impl AssembledAudio {
    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        self.format.duration_ms(self.pcm.len())
    }

    /// Decode to normalized samples for a player.
    pub fn samples(&self) -> Vec<f32> {
        pcm::decode_linear16(&self.pcm)
    }

    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, hound::Error> {
        pcm::encode_wav(&self.pcm, &self.format)
    }

    pub fn to_wav_base64(&self) -> Result<String, hound::Error> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.to_wav_bytes()?))
    }
}

/// What the player should do with a finished session.
#[derive(Debug, Clone)]
pub enum PlaybackOutcome {
    Complete(AssembledAudio),
    /// Some audio arrived before the failure; it may still be worth playing.
    Partial {
        audio: AssembledAudio,
        error: StreamError,
    },
    /// Failed before any audio arrived.
    Failed(StreamError),
}

impl PlaybackOutcome {
    pub fn audio(&self) -> Option<&AssembledAudio> {
        match self {
            PlaybackOutcome::Complete(audio) | PlaybackOutcome::Partial { audio, .. } => Some(audio),
            PlaybackOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&StreamError> {
        match self {
            PlaybackOutcome::Complete(_) => None,
            PlaybackOutcome::Partial { error, .. } | PlaybackOutcome::Failed(error) => Some(error),
        }
    }
}

impl From<AssembledAudio> for PlaybackOutcome {
    fn from(audio: AssembledAudio) -> Self {
        match audio.error.clone() {
            None => PlaybackOutcome::Complete(audio),
            Some(error) if audio.is_empty() => PlaybackOutcome::Failed(error),
            Some(error) => PlaybackOutcome::Partial { audio, error },
        }
    }
}

struct AssemblyBuffer {
    frames: Vec<Bytes>,
    total_bytes: usize,
    last_receipt: Option<Instant>,
    state: AssemblerState,
    payload: Option<AssembledAudio>,
    trigger: Option<oneshot::Sender<AssembledAudio>>,
    discarded: u64,
}

struct Inner {
    config: AssemblerConfig,
    buffer: Mutex<AssemblyBuffer>,
    wake: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, AssemblyBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finalize(&self, reason: FinalizeReason, error: Option<StreamError>) -> bool {
        let mut buffer = self.lock();
        if matches!(buffer.state, AssemblerState::Finalized | AssemblerState::Terminal) {
            debug!(?reason, "Assembler already finalized; ignoring");
            return false;
        }

        let mut pcm = BytesMut::with_capacity(buffer.total_bytes);
        for frame in &buffer.frames {
            pcm.extend_from_slice(frame);
        }
        let audio = AssembledAudio {
            pcm: pcm.freeze(),
            frames: buffer.frames.len(),
            format: self.config.format,
            reason,
            error,
        };
        buffer.frames.clear();
        buffer.state = AssemblerState::Finalized;
        buffer.payload = Some(audio.clone());
        if let Some(trigger) = buffer.trigger.take() {
            let _ = trigger.send(audio.clone());
        }
        drop(buffer);
        self.wake.notify_one();

        match reason {
            FinalizeReason::EndOfStream => {
                info!(frames = audio.frames, bytes = audio.pcm.len(), "Audio finalized on end-of-stream");
            }
            FinalizeReason::InactivityTimeout => {
                warn!(
                    frames = audio.frames,
                    bytes = audio.pcm.len(),
                    quiet_window_ms = self.config.quiet_window.as_millis() as u64,
                    "No end-of-stream received; audio finalized by the inactivity fallback"
                );
            }
            FinalizeReason::Error => {
                warn!(
                    frames = audio.frames,
                    bytes = audio.pcm.len(),
                    error = ?audio.error,
                    "Audio finalized after stream error"
                );
            }
        }
        true
    }
}

/// Resolves once with the finalized payload, or `None` if the assembler was
/// closed before anything finalized it.
pub struct PlaybackTrigger {
    rx: oneshot::Receiver<AssembledAudio>,
}

impl Future for PlaybackTrigger {
    type Output = Option<AssembledAudio>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

pub struct ChunkAssembler {
    inner: Arc<Inner>,
}

impl ChunkAssembler {
    /// Create an assembler and start its inactivity watchdog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AssemblerConfig) -> (Self, PlaybackTrigger) {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            config,
            buffer: Mutex::new(AssemblyBuffer {
                frames: Vec::new(),
                total_bytes: 0,
                last_receipt: None,
                state: AssemblerState::Idle,
                payload: None,
                trigger: Some(tx),
                discarded: 0,
            }),
            wake: Notify::new(),
        });
        tokio::spawn(watchdog(inner.clone()));
        (Self { inner }, PlaybackTrigger { rx })
    }

    /// Buffer a frame. Returns `false` if it arrived after finalization and
    /// was discarded.
    pub fn on_frame(&self, data: Bytes) -> bool {
        let mut buffer = self.inner.lock();
        match buffer.state {
            AssemblerState::Finalized | AssemblerState::Terminal => {
                buffer.discarded += 1;
                warn!(bytes = data.len(), "Frame arrived after finalization; discarding it");
                false
            }
            AssemblerState::Idle | AssemblerState::Receiving => {
                let first = buffer.state == AssemblerState::Idle;
                buffer.state = AssemblerState::Receiving;
                buffer.total_bytes += data.len();
                buffer.frames.push(data);
                buffer.last_receipt = Some(Instant::now());
                drop(buffer);
                if first {
                    self.inner.wake.notify_one();
                }
                true
            }
        }
    }

    pub fn on_end_of_stream(&self) -> bool {
        self.finalize(FinalizeReason::EndOfStream)
    }

    pub fn on_error(&self, err: StreamError) -> bool {
        self.inner.finalize(FinalizeReason::Error, Some(err))
    }

    /// Finalize now. Returns `true` only for the call that actually did it;
    /// every later call is a no-op.
    pub fn finalize(&self, reason: FinalizeReason) -> bool {
        self.inner.finalize(reason, None)
    }

    /// Stop the watchdog and refuse further frames.
    pub fn close(&self) {
        let mut buffer = self.inner.lock();
        if buffer.state != AssemblerState::Terminal {
            buffer.state = AssemblerState::Terminal;
            buffer.trigger = None;
        }
        drop(buffer);
        self.inner.wake.notify_one();
    }

    pub fn state(&self) -> AssemblerState {
        self.inner.lock().state
    }

    pub fn payload(&self) -> Option<AssembledAudio> {
        self.inner.lock().payload.clone()
    }

    pub fn discarded_frames(&self) -> u64 {
        self.inner.lock().discarded
    }
}

impl Drop for ChunkAssembler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn watchdog(inner: Arc<Inner>) {
    let quiet = inner.config.quiet_window;
    loop {
        let deadline = {
            let buffer = inner.lock();
            match buffer.state {
                AssemblerState::Finalized | AssemblerState::Terminal => return,
                AssemblerState::Idle => None,
                AssemblerState::Receiving => buffer.last_receipt.map(|at| at + quiet),
            }
        };

        match deadline {
            None => inner.wake.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let quiet_since = {
                            let buffer = inner.lock();
                            buffer.state == AssemblerState::Receiving
                                && buffer.last_receipt.is_some_and(|at| at + quiet <= Instant::now())
                        };
                        if quiet_since {
                            inner.finalize(FinalizeReason::InactivityTimeout, None);
                        }
                    }
                    _ = inner.wake.notified() => {}
                }
            }
        }
    }
}
