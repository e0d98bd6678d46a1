// =============================================================================
// Message bus — subject-addressed pub/sub
// =============================================================================
//
// Two transports behind one trait: an in-process bus (tests and single-node
// deployments, selected by `mem://`) and a WebSocket bus client with
// bounded-backoff reconnect. Subjects are dot-separated tokens; subscription
// patterns support `*` (exactly one token) and `>` (one or more trailing
// tokens).
//
// Delivery is best-effort and never blocks a publisher: a subscriber whose
// channel is full loses the message and a counter records the loss.
// =============================================================================

pub mod publisher;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::telemetry;

/// Capacity of each subscriber's delivery channel.
const SUBSCRIBER_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Messages & subjects
// ---------------------------------------------------------------------------

/// One subject-addressed message. The payload is the serialized JSON body.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Build a message by serializing `value` as JSON.
    pub fn json<T: Serialize>(subject: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self {
            subject: subject.into(),
            payload: serde_json::to_vec(value)?,
        })
    }
}

/// Match a subject against a subscription pattern.
///
/// `*` matches exactly one token; a trailing `>` matches one or more
/// remaining tokens. `>` anywhere else never matches.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return pat.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

/// True if `subject` matches any of `patterns`.
pub fn matches_any(patterns: &[String], subject: &str) -> bool {
    patterns.iter().any(|p| subject_matches(p, subject))
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish one message. Implementations must not block beyond their
    /// internal queue capacity; overflow is an error the caller may drop on.
    async fn publish(&self, message: BusMessage) -> Result<()>;

    /// Subscribe to a set of subject patterns. Messages matching any pattern
    /// are delivered on the returned channel.
    async fn subscribe(&self, patterns: Vec<String>) -> Result<mpsc::Receiver<BusMessage>>;
}

/// Build the bus selected by the configuration.
pub fn connect(cfg: &BusConfig) -> Arc<dyn Bus> {
    if cfg.is_in_process() {
        Arc::new(InProcessBus::new())
    } else {
        remote::RemoteBus::spawn(cfg.clone())
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

struct Subscription {
    patterns: Vec<String>,
    tx: mpsc::Sender<BusMessage>,
}

/// Loopback bus: publishers and subscribers inside one process. This is the
/// production path for single-node deployments and the substrate for the
/// end-to-end test suite.
#[derive(Default)]
pub struct InProcessBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions (test helper).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        let mut closed_any = false;
        {
            let subs = self.subscriptions.read();
            for sub in subs.iter() {
                if !matches_any(&sub.patterns, &message.subject) {
                    continue;
                }
                match sub.tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        counter!(telemetry::BUS_DELIVERY_DROPS, 1);
                        warn!(subject = %message.subject, "subscriber channel full — message dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed_any = true,
                }
            }
        }

        if closed_any {
            self.subscriptions.write().retain(|s| !s.tx.is_closed());
        }
        Ok(())
    }

    async fn subscribe(&self, patterns: Vec<String>) -> Result<mpsc::Receiver<BusMessage>> {
        if patterns.is_empty() {
            return Err(Error::InvalidInput("subscription needs at least one pattern".into()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscriptions.write().push(Subscription { patterns, tx });
        Ok(rx)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_subject_matches() {
        assert!(subject_matches("risk.emergency", "risk.emergency"));
        assert!(!subject_matches("risk.emergency", "risk.alerts"));
        assert!(!subject_matches("risk.emergency", "risk.emergency.extra"));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(subject_matches("market.*", "market.BTCUSDT"));
        assert!(!subject_matches("market.*", "market.BTCUSDT.depth"));
        assert!(!subject_matches("market.*", "market"));
        assert!(subject_matches("orders.*.BTCUSDT", "orders.updates.BTCUSDT"));
    }

    #[test]
    fn tail_matches_one_or_more_tokens() {
        assert!(subject_matches("market.>", "market.BTCUSDT"));
        assert!(subject_matches("market.>", "market.BTCUSDT.depth.5"));
        assert!(!subject_matches("market.>", "market"));
        assert!(!subject_matches("market.>", "orders.BTCUSDT"));
        assert!(subject_matches(">", "anything.at.all"));
    }

    #[test]
    fn tail_must_be_last_token() {
        assert!(!subject_matches("market.>.depth", "market.BTCUSDT.depth"));
    }

    #[tokio::test]
    async fn in_process_delivery_respects_patterns() {
        let bus = InProcessBus::new();
        let mut market = bus.subscribe(vec!["market.>".to_string()]).await.unwrap();
        let mut orders = bus.subscribe(vec!["orders.updates.>".to_string()]).await.unwrap();

        bus.publish(BusMessage::json("market.BTCUSDT", &serde_json::json!({"p": 1})).unwrap())
            .await
            .unwrap();

        let msg = market.recv().await.unwrap();
        assert_eq!(msg.subject, "market.BTCUSDT");
        assert!(orders.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe(vec![">".to_string()]).await.unwrap();
        assert_eq!(bus.subscription_count(), 1);

        drop(rx);
        bus.publish(BusMessage::json("market.X", &serde_json::json!({})).unwrap())
            .await
            .unwrap();
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn empty_pattern_list_is_rejected() {
        let bus = InProcessBus::new();
        assert!(bus.subscribe(Vec::new()).await.is_err());
    }
}
