// =============================================================================
// Risk — pre-trade gate, policies, simulation, emergency coordination
// =============================================================================

pub mod emergency;
pub mod gate;
pub mod policy;
pub mod simulation;

pub use emergency::{CircuitBreaker, EmergencyCoordinator, EmergencyLatch, EmergencyStopState};
pub use gate::{BatchResult, CheckDecision, RiskGate, Violation};
pub use policy::{Policy, PolicyOp, PolicyScope, PolicyStore, Severity};
pub use simulation::{OrderRequest, RiskMetrics};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::bus::publisher::EventPublisher;

/// Periodic risk monitor: compute current metrics for the primary account
/// and publish them on `risk.metrics`. Upstream failures are logged and
/// skipped — monitoring must never take the service down.
pub async fn run_monitor(
    gate: Arc<RiskGate>,
    publisher: EventPublisher,
    account_id: String,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(account_id = %account_id, interval_secs = interval.as_secs(), "risk monitor started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("risk monitor shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                match gate.current_metrics(&account_id).await {
                    Ok(metrics) => publisher.risk_metrics(&metrics),
                    Err(e) => debug!(error = %e, "risk metrics unavailable this cycle"),
                }
            }
        }
    }
}
