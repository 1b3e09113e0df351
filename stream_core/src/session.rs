//! Synthesis sessions: one request/response cycle against the provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StreamError;
use crate::format::AudioFormat;

/// Maximum characters accepted in a single synthesis request
pub const MAX_TEXT_LENGTH: usize = 2000;
/// Voice model used when the client does not name one
pub const DEFAULT_MODEL: &str = "aura-asteria-en";

/// What the provider is asked to speak, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub format: AudioFormat,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            format: AudioFormat::default(),
        }
    }

    /// Reject anything the provider would refuse, before a connection exists.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.text.trim().is_empty() {
            return Err(StreamError::InvalidRequest("Text cannot be empty".to_string()));
        }
        let chars = self.text.chars().count();
        if chars > MAX_TEXT_LENGTH {
            return Err(StreamError::InvalidRequest(format!(
                "Text too long ({} characters, max {})",
                chars, MAX_TEXT_LENGTH
            )));
        }
        if !is_valid_model_id(&self.model) {
            return Err(StreamError::InvalidRequest(format!(
                "Invalid voice model: {:?}. Expected letters, digits, '.', '_' or '-' (e.g. aura-asteria-en)",
                self.model
            )));
        }
        self.format.validate()
    }
}

// Model ids end up in a query string, so keep them to a safe alphabet.
fn is_valid_model_id(model: &str) -> bool {
    !model.is_empty()
        && model.len() <= 64
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Opening,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub model: String,
    pub format: AudioFormat,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(request: &SynthesisRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: request.model.clone(),
            format: request.format,
            state: SessionState::Opening,
            created_at: Utc::now(),
        }
    }

    /// Advance the lifecycle. Finished sessions never move again.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.is_finished() {
            return false;
        }
        self.state = next;
        true
    }
}
