use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::Config;
use crate::gateway::{Hub, HubHandle};
use crate::middleware::auth::TokenVerifier;

/// Per-key token bucket for rate limiting.
#[derive(Clone)]
pub struct RateLimitBucket {
    pub remaining: u32,
    pub last_refill: Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub auth: Arc<TokenVerifier>,
    pub config: Arc<Config>,
    pub rate_limits: Arc<DashMap<String, RateLimitBucket>>,
}

impl AppState {
    /// Start a hub with the configured limits and wrap it for the router.
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Self {
        let hub = Hub::spawn(config.hub.clone());
        Self {
            hub,
            auth: Arc::new(TokenVerifier::new(&config.jwt_secret)),
            config: Arc::new(config),
            rate_limits: Arc::new(DashMap::new()),
        }
    }
}
