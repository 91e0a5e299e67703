//! Shared gateway state.

use std::sync::Arc;

use sqlx::PgPool;

use {
    spherical_auth::TokenStore,
    spherical_config::ConfigHandle,
    spherical_hashverifier::{SigningIdentity, VerifierClient},
};

pub struct GatewayState {
    pub config: ConfigHandle,
    pub pool: PgPool,
    pub tokens: Arc<TokenStore>,
    pub verifier: Arc<VerifierClient>,
    pub identity: Arc<SigningIdentity>,
    pub http: reqwest::Client,
    /// `https`/`wss` in production; `http`/`ws` for meshes whose TLS is
    /// terminated in front of the node (and for tests).
    pub http_scheme: &'static str,
    pub ws_scheme: &'static str,
}

impl GatewayState {
    /// Our configured hostname.
    #[must_use]
    pub fn hostname(&self) -> String {
        self.config.snapshot().hostname
    }
}
