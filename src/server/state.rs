use std::sync::Arc;
use std::time::Instant;

use crate::cache::RedisDistributedCache;
use crate::config::Settings;
use crate::manager::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<SessionManager>,
    /// Set when the node runs against Redis; used for health checks
    pub redis: Option<Arc<RedisDistributedCache>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        manager: Arc<SessionManager>,
        redis: Option<Arc<RedisDistributedCache>>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            manager,
            redis,
            start_time: Instant::now(),
        }
    }
}
