//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use relaypass_core::CoreService;
use relaypass_shared::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub core: Arc<CoreService>,
    /// Bearer token for the operator endpoints, compared constant-time.
    pub admin_token: Arc<String>,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        let core = Arc::new(CoreService::new(config, pool.clone()));
        Self {
            pool,
            core,
            admin_token: Arc::new(config.admin_token.clone()),
        }
    }
}
