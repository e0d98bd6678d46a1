// =============================================================================
// Meridian — main entry point
// =============================================================================
//
// Startup order: config → stores and caches → bus → aggregator → broadcaster
// → risk gate → HTTP/WS server. Exit codes: 0 clean shutdown, 1 startup
// failure, 2 invalid configuration.
// =============================================================================

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use meridian::app::AppContext;
use meridian::broadcast::Broadcaster;
use meridian::bus::{self, publisher::EventPublisher};
use meridian::cache::account::AccountMonitor;
use meridian::cache::{store, PriceCache};
use meridian::config::Config;
use meridian::ingest::Ingestor;
use meridian::risk::{
    self, policy::default_policies, EmergencyCoordinator, EmergencyLatch, PolicyStore, RiskGate,
};
use meridian::session::SessionMap;
use meridian::state::Aggregator;
use meridian::telemetry;

/// Capacity of the ingestor → aggregator event channel.
const EVENT_CHANNEL_CAPACITY: usize = 4096;
/// Capacity of the outbound publisher queue.
const PUBLISHER_CAPACITY: usize = 1024;

enum StartupError {
    Config(String),
    Runtime(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    telemetry::init_tracing();
    telemetry::describe_metrics();

    match run().await {
        Ok(()) => {
            info!("meridian shut down complete");
            ExitCode::SUCCESS
        }
        Err(StartupError::Config(problems)) => {
            error!("invalid configuration:\n{problems}");
            ExitCode::from(2)
        }
        Err(StartupError::Runtime(e)) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), StartupError> {
    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian — dashboard core + risk gate             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian.json".to_string());
    let mut config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| StartupError::Config(format!("{e:#}")))?
    } else {
        warn!(path = %config_path, "config file not found — using defaults");
        Config::default()
    };
    config.apply_env_overrides();

    let problems = config.validate();
    if !problems.is_empty() {
        return Err(StartupError::Config(problems.join("\n")));
    }
    info!(
        bind = %config.server.bind_addr(),
        bus = %config.bus.url,
        auth = config.auth.enabled,
        "configuration ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 2. Stores & caches ───────────────────────────────────────────────
    let kv = store::open(&config.cache).map_err(StartupError::Runtime)?;
    let prices = PriceCache::new(kv.clone(), config.cache.prices_ttl());
    let policies = Arc::new(PolicyStore::open(
        kv,
        config.cache.policies_ttl(),
        default_policies(&config.risk),
    ));
    let accounts = Arc::new(
        AccountMonitor::new(&config.upstream)
            .map_err(|e| StartupError::Runtime(anyhow::anyhow!(e)))?,
    );

    // ── 3. Bus & publisher ───────────────────────────────────────────────
    let bus = bus::connect(&config.bus);
    let (publisher, publisher_task) =
        EventPublisher::spawn(bus.clone(), PUBLISHER_CAPACITY, shutdown_rx.clone());

    // ── 4. Emergency coordination ────────────────────────────────────────
    let latch = Arc::new(EmergencyLatch::new());
    let coordinator = Arc::new(EmergencyCoordinator::new(
        latch.clone(),
        publisher.clone(),
        policies.clone(),
    ));

    // ── 5. Aggregator & ingestor ─────────────────────────────────────────
    let aggregator = Aggregator::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let aggregator_task = tokio::spawn(aggregator.clone().run(events_rx, shutdown_rx.clone()));

    let ingestor = Ingestor::new(
        bus,
        config.bus.subjects.clone(),
        events_tx,
        prices.clone(),
        latch.clone(),
    );
    let ingestor_task = tokio::spawn(ingestor.run(shutdown_rx.clone()));

    // ── 6. Broadcaster ───────────────────────────────────────────────────
    let broadcaster = Broadcaster::new(aggregator.clone(), config.broadcaster.clone());
    let broadcaster_task = tokio::spawn(broadcaster.clone().run(shutdown_rx.clone()));

    // ── 7. Risk gate & monitor ───────────────────────────────────────────
    let gate = Arc::new(RiskGate::new(
        prices,
        accounts,
        policies.clone(),
        coordinator.clone(),
        publisher.clone(),
        config.risk.clone(),
    ));
    let monitor_task = tokio::spawn(risk::run_monitor(
        gate.clone(),
        publisher.clone(),
        config.risk.account_id.clone(),
        config.risk.monitor_interval(),
        shutdown_rx.clone(),
    ));

    // ── 8. HTTP/WS server ────────────────────────────────────────────────
    let sessions = SessionMap::new();
    let shutdown_timeout = config.server.shutdown_timeout();
    let bind_addr = config.server.bind_addr();

    let ctx = Arc::new(AppContext {
        config,
        aggregator,
        broadcaster,
        sessions: sessions.clone(),
        gate,
        policies,
        latch,
        coordinator,
        publisher,
        shutdown: shutdown_rx.clone(),
        started_at: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))
        .map_err(StartupError::Runtime)?;
    info!(addr = %bind_addr, "server listening");

    let app = meridian::api::rest::router(ctx);
    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let shutdown = async move {
            loop {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
                if *server_shutdown.borrow() {
                    break;
                }
            }
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "server error");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")
        .map_err(StartupError::Runtime)?;
    warn!("shutdown signal received — draining");

    let _ = shutdown_tx.send(true);
    sessions.cancel_all();

    let drain = async {
        let _ = server_task.await;
        let _ = broadcaster_task.await;
        let _ = ingestor_task.await;
        let _ = aggregator_task.await;
        let _ = monitor_task.await;
        let _ = publisher_task.await;
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        warn!("drain window elapsed — forcing exit");
    }

    Ok(())
}
