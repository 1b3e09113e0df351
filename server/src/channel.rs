//! Delivery of audio and control messages to the browser.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use stream_core::{AudioFrame, ControlMessage, StreamError};
use tracing::debug;

/// Outbound half of a browser WebSocket.
///
/// Every send is bounded by `send_timeout`; a peer that stops reading turns
/// into [`StreamError::DeliveryFailed`] instead of stalling the relay.
pub struct ClientChannel<S> {
    sink: S,
    send_timeout: Duration,
    frames_sent: u64,
    bytes_sent: u64,
}

impl<S> ClientChannel<S>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    pub fn new(sink: S, send_timeout: Duration) -> Self {
        Self {
            sink,
            send_timeout,
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    async fn deliver(&mut self, message: Message) -> Result<(), StreamError> {
        match tokio::time::timeout(self.send_timeout, self.sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StreamError::DeliveryFailed(format!("client unreachable: {e}"))),
            Err(_) => Err(StreamError::DeliveryFailed(format!(
                "client did not accept data within {:?}",
                self.send_timeout
            ))),
        }
    }

    /// Forward one audio frame as a binary message.
    pub async fn send(&mut self, frame: AudioFrame) -> Result<(), StreamError> {
        let seq = frame.seq;
        let len = frame.len();
        self.deliver(Message::Binary(frame.into_bytes())).await?;
        self.frames_sent += 1;
        self.bytes_sent += len as u64;
        debug!(seq, bytes = len, "Frame delivered");
        Ok(())
    }

    pub async fn send_control(&mut self, message: &ControlMessage) -> Result<(), StreamError> {
        self.deliver(Message::Text(message.to_json().into())).await
    }

    pub async fn send_end_of_stream(&mut self) -> Result<(), StreamError> {
        self.send_control(&ControlMessage::EndOfStream).await
    }

    pub async fn send_error(&mut self, err: &StreamError) -> Result<(), StreamError> {
        self.send_control(&ControlMessage::error(err)).await
    }

    /// Close the outbound half. Errors are ignored: the peer may be gone.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(self.send_timeout, self.sink.close()).await;
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}
