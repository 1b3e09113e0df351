//! Provider-facing half of the speech relay: the upstream WebSocket session,
//! credentials for direct connections, and the receiving client used in both
//! deployment modes.
pub mod client;
pub mod credential;
pub mod upstream;

pub use client::{fetch_credential, SpeechClient, StreamMode};
pub use credential::{Credential, CredentialIssuer, StaticKeyIssuer, TokenResponse};
pub use upstream::{UpstreamConfig, UpstreamSession, DEFAULT_UPSTREAM_URL};
