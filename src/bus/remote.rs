// =============================================================================
// Remote bus client — WebSocket transport with bounded-backoff reconnect
// =============================================================================
//
// Frames are JSON text messages:
//   publish:    {"op": "publish", "subject": "...", "payload": <json>}
//   subscribe:  {"op": "subscribe", "patterns": ["market.>", ...]}
//   delivery:   {"op": "message", "subject": "...", "payload": <json>}
//
// The connection task re-issues the union of all local subscriptions after
// every reconnect. Backoff doubles per failed attempt up to
// `reconnect_attempts` doublings, then plateaus; the process never exits
// because the bus is away.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{matches_any, Bus, BusMessage};
use crate::config::BusConfig;
use crate::error::{Error, Result};

/// Capacity of the outbound publish queue.
const OUTBOUND_CAPACITY: usize = 4096;

/// Backoff plateau regardless of attempt count.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct BusFrame {
    op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patterns: Option<Vec<String>>,
}

struct Subscription {
    patterns: Vec<String>,
    tx: mpsc::Sender<BusMessage>,
}

pub struct RemoteBus {
    outbound: mpsc::Sender<BusFrame>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl RemoteBus {
    /// Create the client and spawn its connection task.
    pub fn spawn(cfg: BusConfig) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let subscriptions: Arc<RwLock<Vec<Subscription>>> = Arc::new(RwLock::new(Vec::new()));

        let bus = Arc::new(Self {
            outbound: outbound_tx,
            subscriptions: subscriptions.clone(),
        });

        tokio::spawn(run_connection(cfg, outbound_rx, subscriptions));
        bus
    }

    fn all_patterns(&self) -> Vec<String> {
        let subs = self.subscriptions.read();
        let mut patterns: Vec<String> = subs.iter().flat_map(|s| s.patterns.clone()).collect();
        patterns.sort();
        patterns.dedup();
        patterns
    }
}

#[async_trait]
impl Bus for RemoteBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        let payload: serde_json::Value = serde_json::from_slice(&message.payload)?;
        let frame = BusFrame {
            op: "publish".to_string(),
            subject: Some(message.subject),
            payload: Some(payload),
            patterns: None,
        };
        self.outbound
            .try_send(frame)
            .map_err(|_| Error::UpstreamUnavailable("bus outbound queue full".into()))
    }

    async fn subscribe(&self, patterns: Vec<String>) -> Result<mpsc::Receiver<BusMessage>> {
        if patterns.is_empty() {
            return Err(Error::InvalidInput("subscription needs at least one pattern".into()));
        }
        let (tx, rx) = mpsc::channel(super::SUBSCRIBER_CAPACITY);
        self.subscriptions.write().push(Subscription {
            patterns: patterns.clone(),
            tx,
        });

        // Tell the server; harmless if the connection is down, the reconnect
        // path re-issues the full pattern union.
        let frame = BusFrame {
            op: "subscribe".to_string(),
            subject: None,
            payload: None,
            patterns: Some(self.all_patterns()),
        };
        let _ = self.outbound.try_send(frame);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run_connection(
    cfg: BusConfig,
    mut outbound: mpsc::Receiver<BusFrame>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
) {
    let mut attempt: u32 = 0;

    loop {
        match connect_async(&cfg.url).await {
            Ok((stream, _response)) => {
                info!(url = %cfg.url, "bus connected");
                attempt = 0;

                let (mut write, mut read) = stream.split();

                // Re-issue the union of all local subscriptions.
                let patterns: Vec<String> = {
                    let subs = subscriptions.read();
                    let mut p: Vec<String> =
                        subs.iter().flat_map(|s| s.patterns.clone()).collect();
                    p.sort();
                    p.dedup();
                    p
                };
                if !patterns.is_empty() {
                    let frame = BusFrame {
                        op: "subscribe".to_string(),
                        subject: None,
                        payload: None,
                        patterns: Some(patterns),
                    };
                    if let Ok(text) = serde_json::to_string(&frame) {
                        if write.send(Message::Text(text)).await.is_err() {
                            warn!("bus subscribe frame failed — reconnecting");
                            continue;
                        }
                    }
                }

                // Pump until either direction fails.
                loop {
                    tokio::select! {
                        frame = outbound.recv() => {
                            let Some(frame) = frame else {
                                debug!("bus outbound channel closed — connection task exiting");
                                return;
                            };
                            let text = match serde_json::to_string(&frame) {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(error = %e, "failed to serialise bus frame");
                                    continue;
                                }
                            };
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!(error = %e, "bus write failed — reconnecting");
                                break;
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    deliver(&subscriptions, &text);
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "bus read error — reconnecting");
                                    break;
                                }
                                None => {
                                    warn!("bus stream ended — reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(url = %cfg.url, error = %e, "bus connect failed");
            }
        }

        let capped = attempt.min(cfg.reconnect_attempts);
        let wait = cfg
            .reconnect_wait()
            .saturating_mul(1u32 << capped.min(16))
            .min(MAX_BACKOFF);
        attempt = attempt.saturating_add(1);
        debug!(attempt, wait_ms = wait.as_millis() as u64, "bus reconnect backoff");
        tokio::time::sleep(wait).await;
    }
}

fn deliver(subscriptions: &RwLock<Vec<Subscription>>, text: &str) {
    let frame: BusFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "undecodable bus frame");
            return;
        }
    };
    if frame.op != "message" {
        return;
    }
    let (Some(subject), Some(payload)) = (frame.subject, frame.payload) else {
        warn!("bus message frame missing subject or payload");
        return;
    };
    let payload = match serde_json::to_vec(&payload) {
        Ok(p) => p,
        Err(_) => return,
    };

    let subs = subscriptions.read();
    for sub in subs.iter() {
        if matches_any(&sub.patterns, &subject) {
            let message = BusMessage {
                subject: subject.clone(),
                payload: payload.clone(),
            };
            if sub.tx.try_send(message).is_err() {
                metrics::counter!(crate::telemetry::BUS_DELIVERY_DROPS, 1);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
