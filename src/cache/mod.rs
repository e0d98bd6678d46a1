// =============================================================================
// Price/state cache — short-TTL lookups for the hot paths
// =============================================================================
//
// The price cache is read-mostly: the ingestor writes on every market tick,
// the risk gate and broadcaster read. Reads are served from the local TTL
// map; misses may consult the remote store (cross-instance sharing) with
// single-flight coalescing. Writes flow through a bounded flusher channel so
// ingest never blocks on the store.
// =============================================================================

pub mod account;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use store::KvStore;

/// Capacity of the write-through flusher channel.
const FLUSH_CAPACITY: usize = 4096;

/// Latest observed price for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

pub struct PriceCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, PricePoint>>,
    store: Arc<dyn KvStore>,
    /// Symbols with a remote fetch in flight; followers wait on the receiver.
    inflight: Mutex<HashMap<String, watch::Receiver<bool>>>,
    flush_tx: mpsc::Sender<(String, PricePoint)>,
}

impl PriceCache {
    /// Create the cache and spawn its write-through flusher.
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Arc<Self> {
        let (flush_tx, mut flush_rx) = mpsc::channel::<(String, PricePoint)>(FLUSH_CAPACITY);

        {
            let store = store.clone();
            tokio::task::spawn_blocking(move || {
                while let Some((symbol, point)) = flush_rx.blocking_recv() {
                    if let Ok(json) = serde_json::to_string(&point) {
                        store.set(&price_key(&symbol), &json);
                    }
                }
            });
        }

        Arc::new(Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            store,
            inflight: Mutex::new(HashMap::new()),
            flush_tx,
        })
    }

    /// Local TTL read. Returns the price and its age, or a miss when no tick
    /// arrived within the TTL. Never touches the remote store — this is the
    /// risk gate's sub-millisecond path.
    pub fn get_price(&self, symbol: &str) -> Option<(f64, Duration)> {
        let point = *self.entries.read().get(symbol)?;
        let age = age_of(&point);
        (age <= self.ttl).then_some((point.price, age))
    }

    /// Record a tick from the ingestor. Older-than-latest updates are
    /// dropped. Returns whether the entry was accepted.
    pub fn record_price(&self, symbol: &str, price: f64, updated_at: DateTime<Utc>) -> bool {
        let point = PricePoint { price, updated_at };
        {
            let mut entries = self.entries.write();
            match entries.get(symbol) {
                Some(existing) if existing.updated_at > updated_at => return false,
                _ => {
                    entries.insert(symbol.to_string(), point);
                }
            }
        }

        // Write-through is best effort; a full flusher just skips the share.
        if self.flush_tx.try_send((symbol.to_string(), point)).is_err() {
            debug!(symbol, "price flusher busy — remote share skipped");
        }
        true
    }

    /// Read with remote fallback. Concurrent misses for one symbol coalesce
    /// into a single store lookup: the first caller becomes the leader and
    /// fetches; followers wait for its completion signal.
    pub async fn fetch_price(&self, symbol: &str) -> Option<(f64, Duration)> {
        if let Some(hit) = self.get_price(symbol) {
            return Some(hit);
        }

        enum Role {
            Leader(watch::Sender<bool>),
            Follower(watch::Receiver<bool>),
        }

        let role = {
            let mut inflight = self.inflight.lock();
            match inflight.get(symbol) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    inflight.insert(symbol.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                self.remote_fetch(symbol).await;
                // Remove before signalling so no late follower can clone a
                // receiver that will never observe the send.
                self.inflight.lock().remove(symbol);
                let _ = tx.send(true);
                self.get_price(symbol)
            }
            Role::Follower(mut rx) => {
                if rx.changed().await.is_err() {
                    // Leader future was dropped mid-fetch; clear its slot so
                    // the next miss can elect a fresh leader.
                    self.inflight.lock().remove(symbol);
                }
                self.get_price(symbol)
            }
        }
    }

    async fn remote_fetch(&self, symbol: &str) {
        let store = self.store.clone();
        let key = price_key(symbol);
        let fetched = tokio::task::spawn_blocking(move || store.get(&key)).await.ok().flatten();

        let Some(json) = fetched else { return };
        let Ok(point) = serde_json::from_str::<PricePoint>(&json) else {
            debug!(symbol, "undecodable remote price entry");
            return;
        };
        if age_of(&point) > self.ttl {
            return;
        }

        let mut entries = self.entries.write();
        match entries.get(symbol) {
            Some(existing) if existing.updated_at >= point.updated_at => {}
            _ => {
                entries.insert(symbol.to_string(), point);
            }
        }
    }

    /// Number of locally cached symbols (test helper).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn price_key(symbol: &str) -> String {
    format!("price:{symbol}")
}

fn age_of(point: &PricePoint) -> Duration {
    (Utc::now() - point.updated_at).to_std().unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
