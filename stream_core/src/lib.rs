//! Streaming core shared by the relay server and its clients.
//!
//! * [`queue`] bridges callback-driven provider output to an async consumer.
//! * [`assembler`] turns received frames into one playable payload, exactly
//!   once per session.
//! * [`protocol`] defines the control messages that travel next to the audio.
mod format;
mod frame;
mod pcm;

pub mod assembler;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod session;

pub use assembler::{
    AssembledAudio, AssemblerConfig, AssemblerState, ChunkAssembler, FinalizeReason, PlaybackOutcome,
    PlaybackTrigger, DEFAULT_QUIET_WINDOW,
};
pub use error::StreamError;
pub use format::{AudioFormat, Encoding, CHANNELS, SAMPLE_RATE};
pub use frame::AudioFrame;
pub use pcm::{decode_linear16, encode_wav};
pub use protocol::{parse_client_request, ControlMessage};
pub use queue::{
    relay_queue, Dequeued, EnqueueOutcome, FrameSink, QueueStats, RelayConsumer, RelayProducer,
    DEFAULT_MAX_BUFFERED_BYTES,
};
pub use session::{Session, SessionState, SynthesisRequest, DEFAULT_MODEL, MAX_TEXT_LENGTH};
