use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::device::DeviceResolver;
use crate::core::registry::JobRegistry;

/// Everything a job or an RPC handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: JobRegistry,
    pub resolver: Arc<dyn DeviceResolver>,
    /// Parent of every job's cancellation token.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: AppConfig, resolver: Arc<dyn DeviceResolver>) -> Self {
        Self {
            config: Arc::new(config),
            registry: JobRegistry::new(),
            resolver,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }
}
