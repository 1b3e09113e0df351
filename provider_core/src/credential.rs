//! Short-lived credentials for talking to the provider directly.
//!
//! Issuance policy lives outside this crate; the relay only needs something
//! that hands out a token and an expiry, and a way to attach that token to the
//! provider handshake.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stream_core::StreamError;
use tracing::info;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Value for the `Authorization` header of the provider handshake.
    pub fn authorization_header(&self) -> String {
        format!("Token {}", self.token)
    }
}

// Keep tokens out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Body returned by the token endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<TokenResponse> for Credential {
    fn from(resp: TokenResponse) -> Self {
        Credential::new(resp.token, resp.expires_at)
    }
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue_token(&self, scope: &str) -> Result<Credential, StreamError>;
}

/// Hands out the configured API key with a nominal expiry.
///
/// Suitable for demos only: the key itself does not expire.
pub struct StaticKeyIssuer {
    api_key: String,
    ttl: Duration,
}

impl StaticKeyIssuer {
    pub fn new(api_key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            ttl,
        }
    }
}

#[async_trait]
impl CredentialIssuer for StaticKeyIssuer {
    async fn issue_token(&self, scope: &str) -> Result<Credential, StreamError> {
        if self.api_key.trim().is_empty() {
            return Err(StreamError::IssuanceFailed("no API key configured".to_string()));
        }
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| StreamError::IssuanceFailed(format!("invalid token TTL: {e}")))?;
        info!(scope, ttl_secs = self.ttl.as_secs(), "Issuing provider credential");
        Ok(Credential::new(self.api_key.clone(), Utc::now() + ttl))
    }
}
