//! Connection to the speech provider's streaming endpoint.
//!
//! One [`UpstreamSession`] speaks one request: it connects, submits the text,
//! and hands every binary frame to a [`FrameSink`] from its own reader task.
//! Completion and failures reach the sink the same way, after the frames they
//! follow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use stream_core::{FrameSink, StreamError, SynthesisRequest};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credential::Credential;

pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.deepgram.com/v1/speak";

type ProviderStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub connect_timeout: Duration,
    /// Longest wait for the next frame or the completion signal
    pub frame_timeout: Duration,
    /// How long `close()` waits for the reader to release the connection
    pub close_grace: Duration,
    /// Base delay before the single reconnect attempt
    pub retry_backoff: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl UpstreamConfig {
    /// Provider URL with the voice and fixed output format in the query.
    pub fn endpoint(&self, request: &SynthesisRequest) -> Result<Url, StreamError> {
        let sample_rate = request.format.sample_rate.to_string();
        Url::parse_with_params(
            &self.url,
            &[
                ("model", request.model.as_str()),
                ("encoding", request.format.encoding.as_str()),
                ("sample_rate", sample_rate.as_str()),
            ],
        )
        .map_err(|e| StreamError::InvalidRequest(format!("Invalid upstream URL {}: {e}", self.url)))
    }
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ProviderCommand<'a> {
    Speak { text: &'a str },
    Flush,
    Close,
}

impl ProviderCommand<'_> {
    fn to_message(&self) -> Message {
        Message::text(serde_json::to_string(self).unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ProviderEvent {
    Metadata {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        model_name: Option<String>,
    },
    Flushed {
        #[serde(default)]
        sequence_id: Option<u64>,
    },
    Warning {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    Error {
        #[serde(default, alias = "err_msg")]
        description: Option<String>,
        #[serde(default, alias = "err_code")]
        code: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Handle to one in-flight synthesis on the provider.
///
/// Dropping the handle without calling [`close`](Self::close) also stops the
/// reader, but without waiting for the connection to be released.
pub struct UpstreamSession {
    id: Uuid,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    close_grace: Duration,
}

impl UpstreamSession {
    /// Connect, submit `request`, and start delivering frames to `sink`.
    pub async fn open(
        config: &UpstreamConfig,
        request: &SynthesisRequest,
        credential: &Credential,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, StreamError> {
        request.validate()?;
        let url = config.endpoint(request)?;
        let id = Uuid::new_v4();

        let mut ws = connect(&url, credential, config.connect_timeout).await?;
        for command in [ProviderCommand::Speak { text: &request.text }, ProviderCommand::Flush] {
            ws.send(command.to_message())
                .await
                .map_err(|e| StreamError::UpstreamUnavailable(format!("failed to submit request: {e}")))?;
        }
        info!(upstream_id = %id, model = %request.model, chars = request.text.chars().count(), "Synthesis request submitted");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = tokio::spawn(read_frames(id, ws, sink, shutdown_rx, config.frame_timeout));

        Ok(Self {
            id,
            shutdown,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
            close_grace: config.close_grace,
        })
    }

    /// Like [`open`](Self::open), but retries once after a jittered backoff
    /// when the provider could not be reached at all.
    pub async fn open_with_retry(
        config: &UpstreamConfig,
        request: &SynthesisRequest,
        credential: &Credential,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, StreamError> {
        match Self::open(config, request, credential, sink.clone()).await {
            Err(err) if err.is_retryable() => {
                let base = config.retry_backoff.as_millis() as u64;
                let jitter = rand::thread_rng().gen_range(0..=base / 2);
                let delay = Duration::from_millis(base + jitter);
                warn!(%err, delay_ms = delay.as_millis() as u64, "Upstream unavailable; retrying once");
                tokio::time::sleep(delay).await;
                Self::open(config, request, credential, sink).await
            }
            other => other,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the provider connection. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(upstream_id = %self.id, "Upstream already closed");
            return;
        }
        let _ = self.shutdown.send(true);

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut reader) = reader {
            match tokio::time::timeout(self.close_grace, &mut reader).await {
                Ok(_) => debug!(upstream_id = %self.id, "Upstream connection released"),
                Err(_) => {
                    warn!(
                        upstream_id = %self.id,
                        grace_ms = self.close_grace.as_millis() as u64,
                        "Upstream did not close within the grace period; aborting reader"
                    );
                    reader.abort();
                }
            }
        }
    }
}

async fn connect(url: &Url, credential: &Credential, timeout: Duration) -> Result<ProviderStream, StreamError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamError::InvalidRequest(format!("Invalid upstream URL: {e}")))?;
    let auth = HeaderValue::from_str(&credential.authorization_header())
        .map_err(|_| StreamError::InvalidRequest("Credential is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, auth);

    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(StreamError::UpstreamUnavailable(e.to_string())),
        Err(_) => Err(StreamError::UpstreamUnavailable(format!(
            "connect timed out after {}s",
            timeout.as_secs_f32()
        ))),
    }
}

// A connection lost before the first frame never really came up.
fn connection_lost(frames: u64, reason: String) -> StreamError {
    if frames == 0 {
        StreamError::UpstreamUnavailable(reason)
    } else {
        StreamError::UpstreamInterrupted { frames, reason }
    }
}

async fn read_frames(
    id: Uuid,
    mut ws: ProviderStream,
    sink: Arc<dyn FrameSink>,
    mut shutdown: watch::Receiver<bool>,
    frame_timeout: Duration,
) {
    let mut frames = 0u64;

    // `None` means the sink already knows: either the owner stopped us and
    // the interruption was reported here, or the sink refused input.
    let outcome: Option<Result<(), StreamError>> = loop {
        let next = tokio::select! {
            _ = shutdown.changed() => {
                debug!(upstream_id = %id, frames, "Upstream reader stopped by owner");
                sink.on_error(StreamError::UpstreamInterrupted {
                    frames,
                    reason: "upstream closed before completion".to_string(),
                });
                break None;
            }
            next = tokio::time::timeout(frame_timeout, ws.next()) => next,
        };

        let message = match next {
            Err(_) => break Some(Err(StreamError::UpstreamTimeout(frame_timeout))),
            Ok(None) => break Some(Err(connection_lost(frames, "connection ended without completion".to_string()))),
            Ok(Some(Err(e))) => break Some(Err(connection_lost(frames, e.to_string()))),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(data) => {
                frames += 1;
                if !sink.on_frame(data) {
                    warn!(upstream_id = %id, frames, "Frame sink refused input; stopping upstream reader");
                    break None;
                }
            }
            Message::Text(text) => match serde_json::from_str::<ProviderEvent>(text.as_str()) {
                Ok(ProviderEvent::Flushed { sequence_id }) => {
                    info!(upstream_id = %id, frames, ?sequence_id, "Upstream completed");
                    break Some(Ok(()));
                }
                Ok(ProviderEvent::Metadata { request_id, model_name }) => {
                    debug!(upstream_id = %id, ?request_id, ?model_name, "Upstream metadata");
                }
                Ok(ProviderEvent::Warning { description, code }) => {
                    warn!(upstream_id = %id, ?code, ?description, "Upstream warning");
                }
                Ok(ProviderEvent::Error { description, code }) => {
                    let reason = format!(
                        "provider error {}: {}",
                        code.as_deref().unwrap_or("unknown"),
                        description.as_deref().unwrap_or("no description")
                    );
                    break Some(Err(connection_lost(frames, reason)));
                }
                Ok(ProviderEvent::Other) => debug!(upstream_id = %id, "Ignoring upstream event"),
                Err(e) => warn!(upstream_id = %id, error = %e, "Unparseable upstream message"),
            },
            Message::Close(frame) => {
                let reason = match frame {
                    Some(frame) => format!("provider closed the connection ({}: {})", frame.code, frame.reason.as_str()),
                    None => "provider closed the connection".to_string(),
                };
                break Some(Err(connection_lost(frames, reason)));
            }
            _ => {}
        }
    };

    match outcome {
        Some(Ok(())) => sink.on_complete(),
        Some(Err(err)) => {
            warn!(upstream_id = %id, frames, error = %err, "Upstream failed");
            sink.on_error(err);
        }
        None => {}
    }

    // Best effort: the socket may already be gone.
    let goodbye = async {
        let _ = ws.send(ProviderCommand::Close.to_message()).await;
        let _ = ws.close(None).await;
    };
    let _ = tokio::time::timeout(Duration::from_secs(1), goodbye).await;
}
