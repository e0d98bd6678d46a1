// =============================================================================
// Stream ingestor — bus messages in, typed events out
// =============================================================================
//
// Subscribes to the configured subject patterns and normalizes payloads into
// `EngineEvent`s for the aggregator. Malformed payloads are counted and
// dropped; per-key staleness (an older update for an entity we have already
// seen newer data for) is counted and dropped. Nothing on this path blocks
// the bus: the bus layer's delivery channel absorbs bursts and sheds load
// with a counter if the aggregator ever falls behind.
//
// Market ticks are also written into the price cache (the cache's only
// writer), and emergency announcements latch the local emergency record so
// sibling instances converge.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusMessage};
use crate::cache::PriceCache;
use crate::risk::emergency::EmergencyLatch;
use crate::state::{EngineEvent, EmergencyNotice};
use crate::telemetry;
use crate::types::Channel;

pub struct Ingestor {
    bus: Arc<dyn Bus>,
    patterns: Vec<String>,
    events_tx: mpsc::Sender<EngineEvent>,
    prices: Arc<PriceCache>,
    latch: Arc<EmergencyLatch>,
    /// Latest accepted `updated_at` per (channel, entity key).
    latest: Mutex<HashMap<(Channel, String), DateTime<Utc>>>,
}

impl Ingestor {
    pub fn new(
        bus: Arc<dyn Bus>,
        patterns: Vec<String>,
        events_tx: mpsc::Sender<EngineEvent>,
        prices: Arc<PriceCache>,
        latch: Arc<EmergencyLatch>,
    ) -> Self {
        Self {
            bus,
            patterns,
            events_tx,
            prices,
            latch,
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Consume bus messages until shutdown. Transport reconnects are the bus
    /// client's concern; this loop never exits on a bad message.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut messages = match self.bus.subscribe(self.patterns.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "ingestor failed to subscribe — no events will flow");
                return;
            }
        };
        info!(patterns = ?self.patterns, "ingestor subscribed");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("ingestor shutting down");
                        break;
                    }
                }
                message = messages.recv() => {
                    match message {
                        Some(message) => self.handle(message).await,
                        None => {
                            warn!("bus delivery channel closed — ingestor exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, message: BusMessage) {
        let event = match EngineEvent::decode(&message.subject, &message.payload) {
            Ok(event) => event,
            Err(e) => {
                counter!(telemetry::INGEST_DECODE_ERRORS, 1);
                warn!(subject = %message.subject, error = %e, "dropped undecodable message");
                return;
            }
        };

        if self.is_stale(&event) {
            counter!(telemetry::INGEST_STALE_DROPS, 1);
            debug!(subject = %message.subject, "dropped stale event");
            return;
        }

        // Side effects before forwarding: the price cache is written only
        // here, and emergency notices converge the local latch even when
        // they originate on a sibling instance.
        match &event {
            EngineEvent::MarketTick { symbol, tick } => {
                self.prices.record_price(symbol, tick.last_price, tick.updated_at);
            }
            EngineEvent::EmergencyStop(notice) => {
                self.absorb_emergency(notice);
            }
            _ => {}
        }

        // Single-producer channel into the aggregator preserves arrival
        // order per subject. Awaiting here backpressures only our own
        // delivery buffer, never the bus connection.
        if self.events_tx.send(event).await.is_err() {
            warn!("aggregator channel closed — event discarded");
        }
    }

    fn is_stale(&self, event: &EngineEvent) -> bool {
        let Some(key) = event.monotonic_key() else {
            return false;
        };
        let updated_at = event.updated_at();

        let mut latest = self.latest.lock();
        match latest.get(&key) {
            Some(seen) if *seen > updated_at => true,
            _ => {
                latest.insert(key, updated_at);
                false
            }
        }
    }

    fn absorb_emergency(&self, notice: &EmergencyNotice) {
        if self.latch.absorb_remote(notice) {
            warn!(
                reason = %notice.reason,
                triggered_by = %notice.triggered_by,
                "emergency stop absorbed from bus"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
