// =============================================================================
// Streaming transport — real WebSocket sessions against the served router
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use meridian::app::AppContext;
use meridian::broadcast::Broadcaster;
use meridian::bus::publisher::EventPublisher;
use meridian::bus::{Bus, InProcessBus};
use meridian::cache::account::{AccountSource, AccountState};
use meridian::cache::store::MemoryStore;
use meridian::cache::PriceCache;
use meridian::config::Config;
use meridian::error::{Error, Result};
use meridian::risk::policy::default_policies;
use meridian::risk::{EmergencyCoordinator, EmergencyLatch, PolicyStore, RiskGate};
use meridian::session::SessionMap;
use meridian::state::{AccountSummary, Aggregator, EngineEvent};

struct NoAccounts;

#[async_trait]
impl AccountSource for NoAccounts {
    async fn account_state(&self, _account_id: &str) -> Result<AccountState> {
        Err(Error::AccountUnavailable("not configured in this test".into()))
    }
}

struct Server {
    addr: std::net::SocketAddr,
    ctx: Arc<AppContext>,
    shutdown: watch::Sender<bool>,
}

async fn serve(mut config: Config) -> Server {
    config.server.port = 0;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store: Arc<dyn meridian::cache::store::KvStore> = Arc::new(MemoryStore::new());
    let prices = PriceCache::new(store.clone(), Duration::from_secs(10));
    let policies = Arc::new(PolicyStore::open(
        store,
        Duration::from_secs(60),
        default_policies(&config.risk),
    ));
    let bus = Arc::new(InProcessBus::new()) as Arc<dyn Bus>;
    let (publisher, _task) = EventPublisher::spawn(bus, 64, shutdown_rx.clone());
    let latch = Arc::new(EmergencyLatch::new());
    let coordinator = Arc::new(EmergencyCoordinator::new(
        latch.clone(),
        publisher.clone(),
        policies.clone(),
    ));
    let gate = Arc::new(RiskGate::new(
        prices,
        Arc::new(NoAccounts),
        policies.clone(),
        coordinator.clone(),
        publisher.clone(),
        config.risk.clone(),
    ));

    let aggregator = Aggregator::new();
    let broadcaster = Broadcaster::new(aggregator.clone(), config.broadcaster.clone());
    tokio::spawn(broadcaster.clone().run(shutdown_rx.clone()));

    let ctx = Arc::new(AppContext {
        config,
        aggregator,
        broadcaster,
        sessions: SessionMap::new(),
        gate,
        policies,
        latch,
        coordinator,
        publisher,
        shutdown: shutdown_rx.clone(),
        started_at: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = meridian::api::rest::router(ctx.clone());

    let mut server_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let shutdown = async move {
            while server_shutdown.changed().await.is_ok() {
                if *server_shutdown.borrow() {
                    break;
                }
            }
        };
        let _ = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    });

    Server {
        addr,
        ctx,
        shutdown: shutdown_tx,
    }
}

fn account_event(balance: f64) -> EngineEvent {
    EngineEvent::AccountUpdate(AccountSummary {
        total_balance: balance,
        available_balance: balance,
        margin_used: 0.0,
        unrealized_pnl: 0.0,
        balances: Default::default(),
        updated_at: Utc::now(),
    })
}

/// Read server frames until one decodes as JSON, skipping transport pings.
async fn next_json_frame<S>(socket: &mut S) -> serde_json::Value
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("read ok");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn subscribe_snapshot_update_over_the_wire() {
    let server = serve(Config::default()).await;
    // State exists before the client subscribes, so the first frame is a
    // deterministic full snapshot.
    server.ctx.aggregator.apply(account_event(100_000.0)).unwrap();

    let url = format!("ws://{}/ws?type=tui&format=json", server.addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(Message::Text(
            r#"{"type":"subscribe","channels":["account"]}"#.to_string(),
        ))
        .await
        .unwrap();

    let frame = next_json_frame(&mut socket).await;
    assert_eq!(frame["type"], "snapshot");
    assert_eq!(frame["seq"], 1);
    assert_eq!(frame["data"]["account"]["total_balance"], 100_000.0);

    server.ctx.aggregator.apply(account_event(99_000.0)).unwrap();
    let frame = next_json_frame(&mut socket).await;
    assert_eq!(frame["type"], "update");
    assert_eq!(frame["seq"], 2);
    assert_eq!(frame["changes"]["account"]["total_balance"], 99_000.0);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn unknown_channel_gets_error_frame_without_disconnect() {
    let server = serve(Config::default()).await;
    let url = format!("ws://{}/ws?format=json", server.addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(Message::Text(
            r#"{"type":"subscribe","channels":["candles"]}"#.to_string(),
        ))
        .await
        .unwrap();

    let frame = next_json_frame(&mut socket).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error"], "invalid_input");

    // The session is still usable afterwards.
    socket
        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    let frame = next_json_frame(&mut socket).await;
    assert_eq!(frame["type"], "pong");

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn application_ping_answers_pong_with_sequence() {
    let server = serve(Config::default()).await;
    server.ctx.aggregator.apply(account_event(1.0)).unwrap();

    let url = format!("ws://{}/ws?format=json", server.addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(Message::Text(r#"{"type":"ping","timestamp":123}"#.to_string()))
        .await
        .unwrap();
    let frame = next_json_frame(&mut socket).await;
    assert_eq!(frame["type"], "pong");
    assert_eq!(frame["seq"], 1);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn shutdown_cascade_closes_sessions() {
    let server = serve(Config::default()).await;
    let url = format!("ws://{}/ws?format=json", server.addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(Message::Text(
            r#"{"type":"subscribe","channels":["account"]}"#.to_string(),
        ))
        .await
        .unwrap();
    // Wait for the session to register.
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.ctx.sessions.is_empty() {
        assert!(Instant::now() < deadline, "session never registered");
        tokio::task::yield_now().await;
    }

    let _ = server.shutdown.send(true);

    // The server side tears the connection down within the grace window.
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match socket.next().await {
                None => break,
                Some(Err(_)) => break,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket did not close after shutdown");

    let deadline = Instant::now() + Duration::from_secs(3);
    while !server.ctx.sessions.is_empty() {
        assert!(Instant::now() < deadline, "session record not cleaned up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn enabled_auth_with_empty_key_rejects_upgrades() {
    let mut config = Config::default();
    config.auth.enabled = true;
    config.auth.api_key = String::new();
    config.auth.bypass_paths = vec!["/api/v1/health".to_string()];
    let server = serve(config).await;

    let url = format!("ws://{}/ws?format=json", server.addr);
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn token_query_param_authenticates_upgrades() {
    let mut config = Config::default();
    config.auth.enabled = true;
    config.auth.api_key = "streaming-key".to_string();
    config.auth.bypass_paths = Vec::new();
    let server = serve(config).await;

    let denied = format!("ws://{}/ws?format=json&token=wrong", server.addr);
    assert!(tokio_tungstenite::connect_async(&denied).await.is_err());

    let allowed = format!("ws://{}/ws?format=json&token=streaming-key", server.addr);
    assert!(tokio_tungstenite::connect_async(&allowed).await.is_ok());

    let _ = server.shutdown.send(true);
}
