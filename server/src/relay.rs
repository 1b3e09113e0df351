//! Backend relay: the browser speaks to `/ws`, this process speaks to the
//! provider, and audio frames are forwarded as they arrive.
//!
//! One connection can carry many requests. Each request runs as its own
//! session: `session_started`, the audio frames, then `end_of_stream` or
//! `error`. Requests that arrive while a session is streaming wait their
//! turn.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use provider_core::{Credential, UpstreamSession};
use stream_core::{
    parse_client_request, relay_queue, ControlMessage, Dequeued, Session, SessionState, StreamError,
    SynthesisRequest,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::ClientChannel;
use crate::state::AppState;

type BrowserChannel = ClientChannel<SplitSink<WebSocket, Message>>;
type BrowserStream = SplitStream<WebSocket>;

/// How a session ended, from the point of view of the connection loop.
enum SessionEnd {
    Completed,
    Failed(StreamError),
    /// The browser went away; nothing more can be sent on this connection.
    ClientGone(StreamError),
}

pub async fn relay_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

async fn serve_connection(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let (sink, mut incoming) = socket.split();
    let mut channel = ClientChannel::new(sink, state.config.send_timeout());
    let mut pending: VecDeque<String> = VecDeque::new();

    state.metrics.record_connection();
    info!(%connection_id, "Relay client connected");

    loop {
        let raw = match pending.pop_front() {
            Some(raw) => raw,
            None => match tokio::time::timeout(state.config.session_timeout(), incoming.next()).await {
                Err(_) => {
                    info!(%connection_id, "Relay client idle; closing connection");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    info!(%connection_id, "Relay client disconnected");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(%connection_id, error = %e, "Relay client socket error");
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => text.as_str().to_owned(),
                Ok(Some(Ok(Message::Binary(_)))) => {
                    warn!(%connection_id, "Ignoring binary message from relay client");
                    continue;
                }
                Ok(Some(Ok(_))) => continue,
            },
        };

        let request = match parse_client_request(&raw, &state.config.default_model) {
            Ok(request) => request,
            Err(err) => {
                warn!(%connection_id, error = %err, "Rejected relay request");
                if channel.send_error(&err).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if let SessionEnd::ClientGone(_) = run_session(&state, &mut channel, &mut incoming, &mut pending, request).await
        {
            break;
        }
    }

    channel.close().await;
    debug!(%connection_id, frames = channel.frames_sent(), bytes = channel.bytes_sent(), "Relay connection closed");
}

/// Relay one synthesis request end to end and release everything it held.
async fn run_session(
    state: &AppState,
    channel: &mut BrowserChannel,
    incoming: &mut BrowserStream,
    pending: &mut VecDeque<String>,
    request: SynthesisRequest,
) -> SessionEnd {
    let session = Session::new(&request);
    let session_id = session.id;
    state.registry.register(session.clone()).await;
    state.metrics.record_session_started();
    info!(%session_id, model = %request.model, chars = request.text.chars().count(), "Relay session started");

    let end = match stream_session(state, &session, channel, incoming, pending, &request).await {
        Ok(end) => end,
        Err(err) => {
            warn!(%session_id, error = %err, "Relay session could not start");
            match channel.send_error(&err).await {
                Ok(()) => SessionEnd::Failed(err),
                Err(delivery) => SessionEnd::ClientGone(delivery),
            }
        }
    };

    let final_state = match &end {
        SessionEnd::Completed => {
            state.metrics.record_session_completed();
            SessionState::Completed
        }
        SessionEnd::Failed(err) | SessionEnd::ClientGone(err) => {
            state.metrics.record_session_failed(err);
            SessionState::Failed
        }
    };
    state.registry.transition(session_id, final_state).await;
    state.registry.remove(session_id).await;
    info!(%session_id, state = ?final_state, "Relay session finished");
    end
}

/// Everything after the `session_started` message. An `Err` means the
/// session never got going and nothing has been relayed yet.
async fn stream_session(
    state: &AppState,
    session: &Session,
    channel: &mut BrowserChannel,
    incoming: &mut BrowserStream,
    pending: &mut VecDeque<String>,
    request: &SynthesisRequest,
) -> Result<SessionEnd, StreamError> {
    let session_id = session.id;
    if let Err(err) = channel.send_control(&ControlMessage::session_started(session)).await {
        return Ok(SessionEnd::ClientGone(err));
    }

    let (producer, mut frames) = relay_queue(state.config.queue_max_bytes);
    let credential = Credential::new(
        state.config.api_key.clone(),
        chrono::Utc::now() + chrono::Duration::seconds(state.config.session_timeout_secs as i64),
    );
    let upstream = Arc::new(
        UpstreamSession::open_with_retry(&state.config.upstream_config(), request, &credential, Arc::new(producer))
            .await?,
    );
    state.registry.attach_upstream(session_id, upstream.clone()).await;
    state.registry.transition(session_id, SessionState::Streaming).await;

    let session_timeout = state.config.session_timeout();
    let mut last_activity = Instant::now();

    let end = loop {
        tokio::select! {
            item = frames.dequeue() => {
                last_activity = Instant::now();
                match item {
                    Dequeued::Frame(frame) => {
                        let bytes = frame.len();
                        if let Err(err) = channel.send(frame).await {
                            warn!(%session_id, error = %err, "Client stopped accepting audio");
                            break SessionEnd::ClientGone(err);
                        }
                        state.metrics.record_frame(bytes);
                    }
                    Dequeued::EndOfStream => {
                        break match channel.send_end_of_stream().await {
                            Ok(()) => SessionEnd::Completed,
                            Err(err) => SessionEnd::ClientGone(err),
                        };
                    }
                    Dequeued::Error(err) => {
                        warn!(%session_id, error = %err, delivered = frames.delivered(), "Relay session failed");
                        break match channel.send_error(&err).await {
                            Ok(()) => SessionEnd::Failed(err),
                            Err(delivery) => SessionEnd::ClientGone(delivery),
                        };
                    }
                }
            }
            message = incoming.next() => {
                last_activity = Instant::now();
                match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!(%session_id, queued = pending.len() + 1, "Request queued behind active session");
                        pending.push_back(text.as_str().to_owned());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%session_id, "Client disconnected mid-stream");
                        break SessionEnd::ClientGone(StreamError::DeliveryFailed(
                            "client disconnected mid-stream".to_string(),
                        ));
                    }
                    Some(Err(e)) => {
                        break SessionEnd::ClientGone(StreamError::DeliveryFailed(e.to_string()));
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = tokio::time::sleep_until(last_activity + session_timeout) => {
                let err = StreamError::SessionTimeout(session_timeout);
                warn!(%session_id, "No activity on the relay session; timing out");
                break match channel.send_error(&err).await {
                    Ok(()) => SessionEnd::Failed(err),
                    Err(delivery) => SessionEnd::ClientGone(delivery),
                };
            }
        }
    };

    upstream.close().await;
    Ok(end)
}
