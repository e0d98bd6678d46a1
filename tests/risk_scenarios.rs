// =============================================================================
// Risk gate scenarios — approvals, policy rejections, emergency trip
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use meridian::bus::publisher::EventPublisher;
use meridian::bus::{Bus, BusMessage, InProcessBus};
use meridian::cache::account::{AccountSource, AccountState};
use meridian::cache::store::MemoryStore;
use meridian::cache::PriceCache;
use meridian::config::RiskConfig;
use meridian::error::{Error, Result};
use meridian::risk::policy::default_policies;
use meridian::risk::{
    EmergencyCoordinator, EmergencyLatch, OrderRequest, PolicyStore, RiskGate,
};
use meridian::types::{OrderType, Side};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct StubAccounts {
    state: Mutex<Option<AccountState>>,
}

#[async_trait]
impl AccountSource for StubAccounts {
    async fn account_state(&self, _account_id: &str) -> Result<AccountState> {
        self.state
            .lock()
            .clone()
            .ok_or_else(|| Error::AccountUnavailable("account monitor offline".into()))
    }
}

struct Harness {
    gate: Arc<RiskGate>,
    prices: Arc<PriceCache>,
    latch: Arc<EmergencyLatch>,
    emergency_rx: mpsc::Receiver<BusMessage>,
    _shutdown: watch::Sender<bool>,
}

async fn harness(account: Option<AccountState>) -> Harness {
    let cfg = RiskConfig::default();
    let store: Arc<dyn meridian::cache::store::KvStore> = Arc::new(MemoryStore::new());
    let prices = PriceCache::new(store.clone(), Duration::from_secs(10));
    let policies = Arc::new(PolicyStore::open(
        store,
        Duration::from_secs(60),
        default_policies(&cfg),
    ));

    let bus = Arc::new(InProcessBus::new());
    let emergency_rx = bus.subscribe(vec!["risk.emergency".to_string()]).await.unwrap();

    let latch = Arc::new(EmergencyLatch::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (publisher, _task) =
        EventPublisher::spawn(bus.clone() as Arc<dyn Bus>, 64, shutdown_rx);
    let coordinator = Arc::new(EmergencyCoordinator::new(
        latch.clone(),
        publisher.clone(),
        policies.clone(),
    ));

    let gate = Arc::new(RiskGate::new(
        prices.clone(),
        Arc::new(StubAccounts {
            state: Mutex::new(account),
        }),
        policies,
        coordinator,
        publisher,
        cfg,
    ));

    Harness {
        gate,
        prices,
        latch,
        emergency_rx,
        _shutdown: shutdown_tx,
    }
}

fn account(equity: f64, peak: f64, daily_start: f64) -> AccountState {
    AccountState {
        account_id: "primary".into(),
        total_balance: equity,
        available_balance: equity,
        margin_used: 0.0,
        unrealized_pnl: 0.0,
        peak_equity: peak,
        daily_start_equity: daily_start,
        balances: Default::default(),
        positions: Vec::new(),
        updated_at: Utc::now(),
    }
}

fn market_buy(symbol: &str, quantity: f64) -> OrderRequest {
    OrderRequest {
        account_id: None,
        symbol: symbol.into(),
        side: Side::Buy,
        order_type: OrderType::Market,
        quantity,
        price: None,
        strategy_id: None,
    }
}

// ---------------------------------------------------------------------------
// S4 — clean approval
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_clean_order_is_approved() {
    let mut h = harness(Some(account(100_000.0, 100_000.0, 100_000.0))).await;
    h.prices.record_price("BTCUSDT", 50_000.0, Utc::now());

    let decision = h.gate.check_order(&market_buy("BTCUSDT", 0.1)).await.unwrap();

    assert!(decision.approved);
    assert!(decision.violations.is_empty());
    assert!(decision.processing_time_us > 0);
    let metrics = decision.metrics.unwrap();
    assert!(metrics.leverage < 1.0);
    assert!(h.emergency_rx.try_recv().is_err());
    assert!(!h.latch.is_active());
}

// ---------------------------------------------------------------------------
// S5 — hard drawdown rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_drawdown_past_hard_limit_rejects() {
    let h = harness(Some(account(79_000.0, 100_000.0, 100_000.0))).await;
    h.prices.record_price("BTCUSDT", 50_000.0, Utc::now());

    let decision = h.gate.check_order(&market_buy("BTCUSDT", 0.01)).await.unwrap();

    assert!(!decision.approved);
    assert_eq!(decision.reason_code.as_deref(), Some("policy_violation"));
    assert!(decision
        .violations
        .iter()
        .any(|v| v.policy_name == "Max Drawdown"));
    // 21 % drawdown breaches the hard limit but not the 25 % emergency one.
    assert!(!h.latch.is_active());
}

// ---------------------------------------------------------------------------
// S6 — emergency trip, bus announcement, latch absorption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_emergency_drawdown_trips_latch_and_publishes_once() {
    let mut h = harness(Some(account(74_000.0, 100_000.0, 100_000.0))).await;
    h.prices.record_price("BTCUSDT", 50_000.0, Utc::now());

    let decision = h.gate.check_order(&market_buy("BTCUSDT", 0.01)).await.unwrap();
    assert!(!decision.approved);
    assert!(h.latch.is_active());

    // Exactly one risk.emergency event on the bus.
    let event = tokio::time::timeout(Duration::from_secs(1), h.emergency_rx.recv())
        .await
        .expect("emergency event published")
        .unwrap();
    assert_eq!(event.subject, "risk.emergency");
    let payload: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
    assert!(payload["reason"].as_str().unwrap().contains("Emergency Drawdown"));
    assert!(h.emergency_rx.try_recv().is_err());

    // Every subsequent check short-circuits on the latch, whatever the
    // inputs look like.
    for request in [market_buy("BTCUSDT", 0.001), market_buy("ETHUSDT", 99.0)] {
        let decision = h.gate.check_order(&request).await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.reason_code.as_deref(), Some("emergency_stop_active"));
    }
}

// ---------------------------------------------------------------------------
// Property 6 — decisions are total, never mocked
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_account_data_is_an_error_not_an_approval() {
    let h = harness(None).await;
    h.prices.record_price("BTCUSDT", 50_000.0, Utc::now());

    let err = h.gate.check_order(&market_buy("BTCUSDT", 0.1)).await.unwrap_err();
    assert_eq!(err.code(), "account_unavailable");
}

#[tokio::test]
async fn stale_price_is_an_error_not_a_fallback() {
    let h = harness(Some(account(100_000.0, 100_000.0, 100_000.0))).await;
    // A tick well past the 10 s harness TTL.
    h.prices.record_price(
        "BTCUSDT",
        50_000.0,
        Utc::now() - chrono::Duration::seconds(60),
    );

    let err = h.gate.check_order(&market_buy("BTCUSDT", 0.1)).await.unwrap_err();
    assert_eq!(err.code(), "price_unavailable");
}

// ---------------------------------------------------------------------------
// Property 7 — the latch absorbs everything while active
// ---------------------------------------------------------------------------

#[tokio::test]
async fn active_latch_absorbs_all_orders_until_reenabled() {
    let h = harness(Some(account(100_000.0, 100_000.0, 100_000.0))).await;
    h.prices.record_price("BTCUSDT", 50_000.0, Utc::now());

    h.latch.trigger("maintenance", "test");
    let decision = h.gate.check_order(&market_buy("BTCUSDT", 0.1)).await.unwrap();
    assert_eq!(decision.reason_code.as_deref(), Some("emergency_stop_active"));

    // Re-enable needs completion first, then trading resumes.
    assert!(h.latch.re_enable().is_err());
    h.latch.mark_completed(0, 0).unwrap();
    h.latch.re_enable().unwrap();

    let decision = h.gate.check_order(&market_buy("BTCUSDT", 0.1)).await.unwrap();
    assert!(decision.approved);
}

// ---------------------------------------------------------------------------
// Circuit breaker — repeated hard rejections trip the latch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_hard_rejections_trip_the_breaker() {
    let mut h = harness(Some(account(79_000.0, 100_000.0, 100_000.0))).await;
    h.prices.record_price("BTCUSDT", 50_000.0, Utc::now());

    // Default threshold is 5 consecutive hard violations in the window.
    for _ in 0..5 {
        let decision = h.gate.check_order(&market_buy("BTCUSDT", 0.01)).await.unwrap();
        assert!(!decision.approved);
    }
    assert!(h.latch.is_active());

    let event = tokio::time::timeout(Duration::from_secs(1), h.emergency_rx.recv())
        .await
        .expect("breaker publishes emergency")
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
    assert!(payload["reason"].as_str().unwrap().contains("circuit breaker"));
}
