// =============================================================================
// Outbound event publisher — subject routing with a bounded queue
// =============================================================================
//
// Callers enqueue without blocking; a single drain task performs the actual
// bus publish. Overflow drops the event and counts it — a stalled bus must
// never back up the risk gate or the aggregator.
// =============================================================================

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Bus, BusMessage};
use crate::telemetry;

/// Handle for enqueueing outbound domain events.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<BusMessage>,
}

impl EventPublisher {
    /// Spawn the drain task and return the shared handle.
    pub fn spawn(
        bus: Arc<dyn Bus>,
        capacity: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<BusMessage>(capacity);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("publisher shutting down");
                            break;
                        }
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        let subject = msg.subject.clone();
                        if let Err(e) = bus.publish(msg).await {
                            warn!(subject = %subject, error = %e, "bus publish failed");
                        }
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Serialize `value` and enqueue it on `subject`. Never blocks; overflow
    /// drops the event with a counter.
    pub fn publish_json<T: Serialize>(&self, subject: impl Into<String>, value: &T) {
        let subject = subject.into();
        let msg = match BusMessage::json(subject.clone(), value) {
            Ok(m) => m,
            Err(e) => {
                warn!(subject = %subject, error = %e, "failed to serialise outbound event");
                return;
            }
        };
        if self.tx.try_send(msg).is_err() {
            counter!(telemetry::BUS_PUBLISH_DROPS, 1);
            warn!(subject = %subject, "publisher queue full — event dropped");
        }
    }

    // ── Subject helpers ─────────────────────────────────────────────────

    pub fn order_update<T: Serialize>(&self, symbol: &str, value: &T) {
        self.publish_json(format!("orders.updates.{symbol}"), value);
    }

    pub fn config_update<T: Serialize>(&self, kind: &str, value: &T) {
        self.publish_json(format!("config.{kind}"), value);
    }

    pub fn risk_alert<T: Serialize>(&self, level: &str, value: &T) {
        self.publish_json(format!("risk.alerts.{level}"), value);
    }

    pub fn emergency<T: Serialize>(&self, value: &T) {
        self.publish_json("risk.emergency", value);
    }

    pub fn risk_metrics<T: Serialize>(&self, value: &T) {
        self.publish_json("risk.metrics", value);
    }
}

// =============================================================================
// Tests
// =============================================================================
