// =============================================================================
// Application context — shared handles for the API and session layers
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::broadcast::Broadcaster;
use crate::bus::publisher::EventPublisher;
use crate::config::Config;
use crate::risk::{EmergencyCoordinator, EmergencyLatch, PolicyStore, RiskGate};
use crate::session::SessionMap;
use crate::state::Aggregator;

/// Everything a request handler can reach. Wrapped in `Arc` and handed to
/// axum as router state.
pub struct AppContext {
    pub config: Config,
    pub aggregator: Arc<Aggregator>,
    pub broadcaster: Arc<Broadcaster>,
    pub sessions: Arc<SessionMap>,
    pub gate: Arc<RiskGate>,
    pub policies: Arc<PolicyStore>,
    pub latch: Arc<EmergencyLatch>,
    pub coordinator: Arc<EmergencyCoordinator>,
    pub publisher: EventPublisher,
    /// Service-wide shutdown signal; sessions watch it for the cancellation
    /// cascade.
    pub shutdown: watch::Receiver<bool>,
    pub started_at: Instant,
}

impl AppContext {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
