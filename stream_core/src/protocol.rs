//! Messages exchanged between the relay and the browser.
//!
//! Audio travels as binary WebSocket frames with no envelope. Everything else
//! is a JSON text frame tagged by `type`, so a reader can tell a graceful
//! `end_of_stream` apart from the socket simply going away.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StreamError;
use crate::format::{AudioFormat, Encoding};
use crate::session::{Session, SynthesisRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SessionStarted {
        session_id: Uuid,
        model: String,
        encoding: Encoding,
        sample_rate: u32,
        channels: u16,
    },
    EndOfStream,
    Error {
        code: String,
        message: String,
    },
}

impl ControlMessage {
    pub fn session_started(session: &Session) -> Self {
        ControlMessage::SessionStarted {
            session_id: session.id,
            model: session.model.clone(),
            encoding: session.format.encoding,
            sample_rate: session.format.sample_rate,
            channels: session.format.channels,
        }
    }

    pub fn error(err: &StreamError) -> Self {
        ControlMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Body of a text frame sent by the browser to start a session.
#[derive(Debug, Deserialize)]
struct ClientRequest {
    text: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    format: Option<AudioFormat>,
}

/// Build a synthesis request from a browser text frame.
///
/// JSON objects (`{"text": "...", "model": "..."}`) are parsed as such; any
/// other text is taken verbatim as the words to speak.
pub fn parse_client_request(raw: &str, default_model: &str) -> Result<SynthesisRequest, StreamError> {
    let trimmed = raw.trim();
    let request = if trimmed.starts_with('{') {
        let parsed: ClientRequest = serde_json::from_str(trimmed)
            .map_err(|e| StreamError::InvalidRequest(format!("Malformed request: {e}")))?;
        SynthesisRequest {
            text: parsed.text,
            model: parsed.model.unwrap_or_else(|| default_model.to_string()),
            format: parsed.format.unwrap_or_default(),
        }
    } else {
        SynthesisRequest::new(raw, default_model)
    };
    request.validate()?;
    Ok(request)
}
