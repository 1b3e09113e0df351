//! Receiving side of a synthesis session.
//!
//! The same assembly loop runs in both deployment modes; only the source of
//! frames differs:
//!
//! * [`StreamMode::Relay`]: frames arrive from the relay server's WebSocket.
//! * [`StreamMode::Direct`]: a credential is fetched from the token endpoint
//!   and this process talks to the provider itself, through its own relay
//!   queue.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use stream_core::{
    relay_queue, AssemblerConfig, AudioFrame, ChunkAssembler, ControlMessage, Dequeued, PlaybackOutcome,
    RelayConsumer, StreamError, SynthesisRequest, DEFAULT_MAX_BUFFERED_BYTES,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::credential::{Credential, TokenResponse};
use crate::upstream::{UpstreamConfig, UpstreamSession};

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub enum StreamMode {
    Relay {
        /// WebSocket URL of the relay, e.g. `ws://localhost:8000/ws`
        url: String,
    },
    Direct {
        /// HTTP URL handing out provider credentials
        token_url: String,
        upstream: UpstreamConfig,
        queue_max_bytes: usize,
    },
}

impl StreamMode {
    pub fn direct(token_url: impl Into<String>, upstream: UpstreamConfig) -> Self {
        StreamMode::Direct {
            token_url: token_url.into(),
            upstream,
            queue_max_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamMode::Relay { .. } => "relay",
            StreamMode::Direct { .. } => "direct",
        }
    }
}

pub struct SpeechClient {
    mode: StreamMode,
    assembler: AssemblerConfig,
    http: reqwest::Client,
}

impl SpeechClient {
    pub fn new(mode: StreamMode, assembler: AssemblerConfig) -> Self {
        Self {
            mode,
            assembler,
            http: reqwest::Client::new(),
        }
    }

    pub fn mode(&self) -> &StreamMode {
        &self.mode
    }

    /// Run one synthesis session and wait until its audio is playable.
    ///
    /// Errors are returned only when the session could not start; anything
    /// that fails once audio may be flowing is reported in the outcome.
    pub async fn speak(&self, request: &SynthesisRequest) -> Result<PlaybackOutcome, StreamError> {
        request.validate()?;
        let mut source = match &self.mode {
            StreamMode::Relay { url } => FrameSource::relay(url, request).await?,
            StreamMode::Direct {
                token_url,
                upstream,
                queue_max_bytes,
            } => {
                let credential = fetch_credential(&self.http, token_url).await?;
                FrameSource::direct(upstream, request, &credential, *queue_max_bytes).await?
            }
        };
        info!(mode = self.mode.name(), "Speech session started");

        let outcome = assemble(&mut source, self.assembler.clone()).await;
        source.shutdown().await;
        Ok(outcome)
    }
}

/// GET a provider credential from the token endpoint.
pub async fn fetch_credential(http: &reqwest::Client, token_url: &str) -> Result<Credential, StreamError> {
    let response = http
        .get(token_url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| StreamError::IssuanceFailed(e.to_string()))?;
    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| StreamError::IssuanceFailed(format!("malformed token response: {e}")))?;
    let credential = Credential::from(body);
    if credential.is_expired() {
        return Err(StreamError::IssuanceFailed("token endpoint returned an expired credential".to_string()));
    }
    Ok(credential)
}

enum FrameSource {
    Relay { ws: RelayStream, received: u64 },
    Direct { upstream: UpstreamSession, frames: RelayConsumer },
}

impl FrameSource {
    async fn relay(url: &str, request: &SynthesisRequest) -> Result<Self, StreamError> {
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| StreamError::UpstreamUnavailable(format!("relay unreachable: {e}")))?;
        let body = serde_json::json!({
            "text": request.text,
            "model": request.model,
            "format": request.format,
        });
        ws.send(Message::text(body.to_string()))
            .await
            .map_err(|e| StreamError::DeliveryFailed(format!("could not send request to relay: {e}")))?;
        Ok(FrameSource::Relay { ws, received: 0 })
    }

    async fn direct(
        config: &UpstreamConfig,
        request: &SynthesisRequest,
        credential: &Credential,
        queue_max_bytes: usize,
    ) -> Result<Self, StreamError> {
        let (producer, frames) = relay_queue(queue_max_bytes);
        let upstream = UpstreamSession::open_with_retry(config, request, credential, Arc::new(producer)).await?;
        Ok(FrameSource::Direct { upstream, frames })
    }

    async fn next(&mut self) -> Dequeued {
        match self {
            FrameSource::Direct { frames, .. } => frames.dequeue().await,
            FrameSource::Relay { ws, received } => loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = AudioFrame::new(*received, data);
                        *received += 1;
                        return Dequeued::Frame(frame);
                    }
                    Some(Ok(Message::Text(text))) => match ControlMessage::from_json(text.as_str()) {
                        Some(ControlMessage::SessionStarted { session_id, model, .. }) => {
                            debug!(%session_id, %model, "Relay session started");
                        }
                        Some(ControlMessage::EndOfStream) => return Dequeued::EndOfStream,
                        Some(ControlMessage::Error { code, message }) => {
                            return Dequeued::Error(StreamError::from_wire(&code, message));
                        }
                        None => warn!(text = %text.as_str(), "Unrecognised control message from relay"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Dequeued::Error(StreamError::DeliveryFailed(
                            "relay closed the connection without end-of-stream".to_string(),
                        ));
                    }
                    Some(Err(e)) => return Dequeued::Error(StreamError::DeliveryFailed(e.to_string())),
                    Some(Ok(_)) => {}
                }
            },
        }
    }

    async fn shutdown(self) {
        match self {
            FrameSource::Relay { mut ws, .. } => {
                let _ = ws.close(None).await;
            }
            FrameSource::Direct { upstream, .. } => upstream.close().await,
        }
    }
}

async fn assemble(source: &mut FrameSource, config: AssemblerConfig) -> PlaybackOutcome {
    let (assembler, mut trigger) = ChunkAssembler::new(config);
    let audio = loop {
        tokio::select! {
            biased;
            audio = &mut trigger => break audio,
            item = source.next() => match item {
                Dequeued::Frame(frame) => {
                    assembler.on_frame(frame.into_bytes());
                }
                Dequeued::EndOfStream => {
                    assembler.on_end_of_stream();
                }
                Dequeued::Error(err) => {
                    assembler.on_error(err);
                }
            },
        }
    };
    assembler.close();

    match audio {
        Some(audio) => {
            // Decoded once, after finalization, for the player.
            let samples = audio.samples();
            info!(
                frames = audio.frames,
                bytes = audio.pcm.len(),
                samples = samples.len(),
                duration_ms = audio.duration_ms(),
                reason = ?audio.reason,
                "Audio ready for playback"
            );
            PlaybackOutcome::from(audio)
        }
        None => PlaybackOutcome::Failed(StreamError::DeliveryFailed(
            "session ended before any audio was finalized".to_string(),
        )),
    }
}
