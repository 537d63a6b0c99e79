use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulse_domain::config::DaemonConfig;
use pulse_queue::Queue;

use crate::concurrency::ConcurrencyGuard;

/// Shared application state passed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<Queue>,
    pub concurrency: Arc<ConcurrencyGuard>,
    pub started_at: DateTime<Utc>,
    /// SHA-256 digest of the configured bearer token. Never the plaintext
    /// token itself — only the hash is kept resident past startup.
    pub api_token_hash: Arc<[u8]>,
    pub daemon_config: Arc<DaemonConfig>,
}

impl AppState {
    pub fn new(
        queue: Arc<Queue>,
        concurrency: Arc<ConcurrencyGuard>,
        api_token_hash: Vec<u8>,
        daemon_config: Arc<DaemonConfig>,
    ) -> Self {
        Self {
            queue,
            concurrency,
            started_at: Utc::now(),
            api_token_hash: api_token_hash.into(),
            daemon_config,
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}
