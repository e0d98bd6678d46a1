// =============================================================================
// Emergency stop — process-local latch, bus coordination, circuit breaker
// =============================================================================
//
// The latch is one mutex-guarded record. While active, every pre-trade
// check is rejected. Activation is announced on `risk.emergency` so sibling
// instances converge; transitions are appended to the durable store.
// Re-enabling trading requires the stop to be marked completed first.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::publisher::EventPublisher;
use crate::error::{Error, Result};
use crate::risk::policy::PolicyStore;
use crate::state::EmergencyNotice;

// ---------------------------------------------------------------------------
// Latch
// ---------------------------------------------------------------------------

/// Emergency-stop record. `completed` means the stop's order-cancel and
/// position-close work has finished; only then may trading be re-enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyStopState {
    pub active: bool,
    pub stopped_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub triggered_by: Option<String>,
    pub orders_cancelled: u32,
    pub positions_closed: u32,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct EmergencyLatch {
    state: Mutex<EmergencyStopState>,
}

impl EmergencyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn status(&self) -> EmergencyStopState {
        self.state.lock().clone()
    }

    /// Activate the latch. Returns the new state, or `None` when it was
    /// already active (the first trigger wins).
    pub fn trigger(&self, reason: &str, triggered_by: &str) -> Option<EmergencyStopState> {
        let mut state = self.state.lock();
        if state.active {
            return None;
        }
        *state = EmergencyStopState {
            active: true,
            stopped_at: Some(Utc::now()),
            reason: Some(reason.to_string()),
            triggered_by: Some(triggered_by.to_string()),
            ..Default::default()
        };
        Some(state.clone())
    }

    /// Converge on an activation announced by a sibling instance. Returns
    /// whether this call changed the latch.
    pub fn absorb_remote(&self, notice: &EmergencyNotice) -> bool {
        let mut state = self.state.lock();
        if state.active {
            return false;
        }
        *state = EmergencyStopState {
            active: true,
            stopped_at: Some(notice.stopped_at),
            reason: Some(notice.reason.clone()),
            triggered_by: Some(notice.triggered_by.clone()),
            ..Default::default()
        };
        true
    }

    /// Record that the stop's cancel/close work finished.
    pub fn mark_completed(&self, orders_cancelled: u32, positions_closed: u32) -> Result<EmergencyStopState> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Error::Conflict("no emergency stop in progress".into()));
        }
        state.orders_cancelled = orders_cancelled;
        state.positions_closed = positions_closed;
        state.completed = true;
        state.completed_at = Some(Utc::now());
        Ok(state.clone())
    }

    /// Clear the latch. Only a completed stop may be cleared.
    pub fn re_enable(&self) -> Result<EmergencyStopState> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Error::Conflict("trading is not stopped".into()));
        }
        if !state.completed {
            return Err(Error::Conflict(
                "emergency stop not completed — cancel/close work still pending".into(),
            ));
        }
        *state = EmergencyStopState::default();
        Ok(state.clone())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Couples latch transitions to the bus announcement and the durable log.
pub struct EmergencyCoordinator {
    latch: Arc<EmergencyLatch>,
    publisher: EventPublisher,
    store: Arc<PolicyStore>,
}

impl EmergencyCoordinator {
    pub fn new(latch: Arc<EmergencyLatch>, publisher: EventPublisher, store: Arc<PolicyStore>) -> Self {
        Self {
            latch,
            publisher,
            store,
        }
    }

    /// Trip the latch. The first caller publishes `risk.emergency` and
    /// persists the transition; later callers are no-ops.
    pub fn trigger(&self, reason: &str, triggered_by: &str) -> bool {
        let Some(state) = self.latch.trigger(reason, triggered_by) else {
            return false;
        };
        warn!(reason, triggered_by, "EMERGENCY STOP ACTIVATED");
        self.store.record_emergency(&state);
        self.publisher.emergency(&EmergencyNotice {
            reason: reason.to_string(),
            triggered_by: triggered_by.to_string(),
            stopped_at: state.stopped_at.unwrap_or_else(Utc::now),
        });
        true
    }

    /// Record cancel/close completion and persist the transition.
    pub fn complete(&self, orders_cancelled: u32, positions_closed: u32) -> Result<EmergencyStopState> {
        let state = self.latch.mark_completed(orders_cancelled, positions_closed)?;
        info!(orders_cancelled, positions_closed, "emergency stop completed");
        self.store.record_emergency(&state);
        Ok(state)
    }

    /// Re-enable trading after a completed stop.
    pub fn re_enable(&self) -> Result<()> {
        let state = self.latch.re_enable()?;
        info!("trading re-enabled");
        self.store.record_emergency(&state);
        self.publisher
            .config_update("trading", &serde_json::json!({ "enabled": true }));
        Ok(())
    }

    pub fn status(&self) -> EmergencyStopState {
        self.latch.status()
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Rolling window over consecutive hard rejections. An approval resets the
/// run; reaching the threshold within the window reports a trip.
pub struct CircuitBreaker {
    window: Duration,
    threshold: u32,
    hits: Mutex<VecDeque<Instant>>,
}

impl CircuitBreaker {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            hits: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one violation; returns `true` when the threshold is reached
    /// within the window.
    pub fn record_violation(&self) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        hits.push_back(now);
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        hits.len() >= self.threshold as usize
    }

    /// An approval breaks the consecutive run.
    pub fn record_pass(&self) {
        self.hits.lock().clear();
    }

    pub fn violation_count(&self) -> usize {
        self.hits.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
