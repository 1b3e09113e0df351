use std::sync::Arc;

use provider_core::{CredentialIssuer, StaticKeyIssuer};

use crate::config::ServerConfig;
use crate::metrics::RelayMetrics;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: SessionRegistry,
    pub metrics: RelayMetrics,
    pub issuer: Arc<dyn CredentialIssuer>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let issuer = Arc::new(StaticKeyIssuer::new(config.api_key.clone(), config.token_ttl()));
        Self::with_issuer(config, issuer)
    }

    /// Build the state around a custom credential issuer.
    pub fn with_issuer(config: ServerConfig, issuer: Arc<dyn CredentialIssuer>) -> Self {
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            metrics: RelayMetrics::new(),
            issuer,
        }
    }
}
