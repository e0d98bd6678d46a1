// =============================================================================
// Broadcaster — per-client differential fan-out
// =============================================================================
//
// One tick loop per cadence class (fast ~100 ms, slow ~250 ms) walks its
// clients; there is no per-client ticker task, so fan-out cost stays bounded
// at high client counts. A tick per client:
//
//   1. read the aggregator snapshot (shared Arc, taken once per pass)
//   2. project by the client's subscription set
//   3. cheap staleness check against per-channel mutation sequences
//   4. serialize changed channels, fingerprint (FNV-1a), suppress no-op
//      churn that hashes identically
//   5. build one snapshot (diff-from-empty for newly subscribed channels)
//      or update frame and encode it in the client's wire format
//   6. non-blocking enqueue with drop-oldest; a slow consumer loses its own
//      oldest frame and never stalls the pass
//
// Encode timing and frame sizes are observed after the per-client
// bookkeeping lock is released.
// =============================================================================

pub mod queue;

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BroadcasterConfig;
use crate::state::Aggregator;
use crate::telemetry;
use crate::types::{Channel, ChannelSet, ClientKind, WireFormat};
use crate::wire::{self, JsonMap, ServerFrame};
use queue::{Outbound, PushOutcome, SendQueue};

// ---------------------------------------------------------------------------
// Client bookkeeping
// ---------------------------------------------------------------------------

/// Per-channel delivery bookkeeping. Owned by the broadcaster; the session
/// layer only requests changes through the registry API.
#[derive(Debug, Default)]
struct DeliveryState {
    /// Aggregator channel sequence as of the last delivered payload.
    delivered_seq: [u64; 5],
    /// Fingerprint of the last delivered serialized payload per channel.
    fingerprints: [Option<u64>; 5],
    /// Channels owed a diff-from-empty snapshot (new subscription, refresh).
    need_full: ChannelSet,
}

/// One registered streaming client.
pub struct ClientEntry {
    pub id: String,
    pub kind: ClientKind,
    pub format: WireFormat,
    pub created_at: DateTime<Utc>,
    pub queue: Arc<SendQueue>,
    subscriptions: Mutex<ChannelSet>,
    delivery: Mutex<DeliveryState>,
    last_delivered_seq: AtomicU64,
}

impl ClientEntry {
    pub fn subscriptions(&self) -> ChannelSet {
        *self.subscriptions.lock()
    }

    /// Sequence carried by the most recently enqueued frame.
    pub fn last_delivered_seq(&self) -> u64 {
        self.last_delivered_seq.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

pub struct Broadcaster {
    clients: RwLock<HashMap<String, Arc<ClientEntry>>>,
    aggregator: Arc<Aggregator>,
    cfg: BroadcasterConfig,
}

impl Broadcaster {
    pub fn new(aggregator: Arc<Aggregator>, cfg: BroadcasterConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            aggregator,
            cfg,
        })
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.cfg
    }

    /// Register a client. The send queue is created by the session layer,
    /// which also remains its sole closer.
    pub fn register(
        &self,
        id: String,
        kind: ClientKind,
        format: WireFormat,
        queue: Arc<SendQueue>,
    ) -> Arc<ClientEntry> {
        let entry = Arc::new(ClientEntry {
            id: id.clone(),
            kind,
            format,
            created_at: Utc::now(),
            queue,
            subscriptions: Mutex::new(ChannelSet::empty()),
            delivery: Mutex::new(DeliveryState::default()),
            last_delivered_seq: AtomicU64::new(0),
        });
        self.clients.write().insert(id.clone(), entry.clone());
        info!(client = %id, kind = ?kind, format = ?format, "client registered");
        entry
    }

    /// Remove a client from the registry. The caller owns queue closure.
    pub fn unregister(&self, id: &str) -> Option<Arc<ClientEntry>> {
        let entry = self.clients.write().remove(id);
        if entry.is_some() {
            info!(client = %id, "client unregistered");
        }
        entry
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Widen a client's subscription set. Newly added channels are owed a
    /// full snapshot on the next tick. Returns the channels actually added.
    pub fn subscribe(&self, id: &str, channels: ChannelSet) -> ChannelSet {
        let Some(entry) = self.clients.read().get(id).cloned() else {
            return ChannelSet::empty();
        };
        let added = {
            let mut subs = entry.subscriptions.lock();
            let added = channels.difference(*subs);
            *subs = subs.union(channels);
            added
        };
        if !added.is_empty() {
            let mut delivery = entry.delivery.lock();
            delivery.need_full = delivery.need_full.union(added);
        }
        added
    }

    /// Narrow a client's subscription set.
    pub fn unsubscribe(&self, id: &str, channels: ChannelSet) {
        let Some(entry) = self.clients.read().get(id).cloned() else {
            return;
        };
        let mut subs = entry.subscriptions.lock();
        *subs = subs.difference(channels);
        let mut delivery = entry.delivery.lock();
        delivery.need_full = delivery.need_full.difference(channels);
    }

    /// Force a full snapshot of the client's current subscriptions.
    pub fn request_refresh(&self, id: &str) {
        let Some(entry) = self.clients.read().get(id).cloned() else {
            return;
        };
        let subs = entry.subscriptions();
        entry.delivery.lock().need_full = subs;
    }

    /// Run both cadence loops until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let fast = tokio::spawn(
            self.clone()
                .cadence_loop(ClientKind::Fast, self.cfg.fast_interval_ms, shutdown.clone()),
        );
        let slow = tokio::spawn(
            self.clone()
                .cadence_loop(ClientKind::Slow, self.cfg.slow_interval_ms, shutdown),
        );
        let _ = fast.await;
        let _ = slow.await;
    }

    async fn cadence_loop(
        self: Arc<Self>,
        kind: ClientKind,
        interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(kind = ?kind, interval_ms, "cadence loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(kind = ?kind, "cadence loop shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick_clients(kind);
                }
            }
        }
    }

    /// One scheduler pass over every client of `kind`. Public so tests can
    /// drive ticks deterministically instead of sleeping on wall-clock.
    pub fn tick_clients(&self, kind: ClientKind) {
        // Clone the Arcs out so no registry lock is held across
        // serialization or enqueueing.
        let clients: Vec<Arc<ClientEntry>> = {
            let clients = self.clients.read();
            clients
                .values()
                .filter(|c| c.kind == kind)
                .cloned()
                .collect()
        };
        if clients.is_empty() {
            return;
        }

        let snapshot = self.aggregator.snapshot();
        for entry in clients {
            self.tick_client(&entry, &snapshot);
        }
    }

    /// Diff-and-send for one client against one snapshot generation.
    fn tick_client(&self, entry: &ClientEntry, state: &crate::state::ConsolidatedState) {
        let subs = entry.subscriptions();
        if subs.is_empty() {
            return;
        }

        let mut payload = JsonMap::new();
        let mut served_full = false;
        {
            let mut delivery = entry.delivery.lock();
            let need_full = delivery.need_full.intersect(subs);

            for channel in subs.iter() {
                let idx = channel.index();
                let is_full = need_full.contains(channel);

                // Cheap staleness gate: skip untouched channels without
                // serializing anything.
                let channel_seq = state.channel_seq[idx];
                if !is_full && channel_seq <= delivery.delivered_seq[idx] {
                    continue;
                }

                let value = state.channel_value(channel);
                let bytes = match serde_json::to_vec(&value) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(client = %entry.id, channel = %channel, error = %e, "channel projection failed");
                        continue;
                    }
                };
                let fingerprint = fnv64(&bytes);

                if !is_full && delivery.fingerprints[idx] == Some(fingerprint) {
                    // Mutation hashed identical to what the client already
                    // has; record the sequence so the gate stays cheap.
                    delivery.delivered_seq[idx] = channel_seq;
                    continue;
                }

                payload.insert(channel.as_str().to_string(), value);
                delivery.fingerprints[idx] = Some(fingerprint);
                delivery.delivered_seq[idx] = channel_seq;
                served_full |= is_full;
            }

            if payload.is_empty() {
                return;
            }
            delivery.need_full = delivery.need_full.difference(need_full);
        }

        let frame = if served_full {
            ServerFrame::snapshot(state.sequence, payload)
        } else {
            ServerFrame::update(state.sequence, payload)
        };

        let encode_started = Instant::now();
        let encoded = match wire::encode_frame(&frame, entry.format) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(client = %entry.id, error = %e, "frame encode failed");
                return;
            }
        };
        histogram!(telemetry::FRAME_ENCODE_SECONDS, encode_started.elapsed().as_secs_f64());
        histogram!(telemetry::FRAME_BYTES, encoded.payload.len() as f64);

        match entry.queue.push(Outbound::Frame(encoded)) {
            PushOutcome::Queued => {
                entry.last_delivered_seq.store(state.sequence, Ordering::Relaxed);
            }
            PushOutcome::DroppedOldest => {
                counter!(telemetry::SLOW_CONSUMER_DROPS, 1);
                warn!(client = %entry.id, "slow consumer — dropped oldest frame");
                entry.last_delivered_seq.store(state.sequence, Ordering::Relaxed);
            }
            PushOutcome::Closed => {
                debug!(client = %entry.id, "queue closed — frame discarded");
            }
        }
    }
}

fn fnv64(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

// =============================================================================
// Tests
// =============================================================================
