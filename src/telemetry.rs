// =============================================================================
// Telemetry — tracing init + metric name registry
// =============================================================================
//
// Metrics go through the `metrics` facade; exporter wiring is the deployment's
// concern. Counter and histogram names are centralised here so call sites and
// dashboards agree on spelling.
// =============================================================================

use metrics::{describe_counter, describe_histogram};
use tracing_subscriber::EnvFilter;

/// Frames discarded because a client's send queue was full (drop-oldest).
pub const SLOW_CONSUMER_DROPS: &str = "meridian_slow_consumer_drops";

/// Bus payloads that failed to decode into a typed event.
pub const INGEST_DECODE_ERRORS: &str = "meridian_ingest_decode_errors";

/// Events dropped because a newer update for the same key was already seen.
pub const INGEST_STALE_DROPS: &str = "meridian_ingest_stale_drops";

/// Outbound bus events dropped because the publisher queue was full.
pub const BUS_PUBLISH_DROPS: &str = "meridian_bus_publish_drops";

/// Bus deliveries dropped because a local subscriber's channel was full.
pub const BUS_DELIVERY_DROPS: &str = "meridian_bus_delivery_drops";

/// Time spent encoding one outbound frame, in seconds.
pub const FRAME_ENCODE_SECONDS: &str = "meridian_frame_encode_seconds";

/// Encoded outbound frame size, in bytes.
pub const FRAME_BYTES: &str = "meridian_frame_bytes";

/// End-to-end risk decision latency, in seconds.
pub const RISK_DECISION_SECONDS: &str = "meridian_risk_decision_seconds";

/// Initialise the tracing subscriber from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Register metric descriptions with the installed recorder, if any.
pub fn describe_metrics() {
    describe_counter!(SLOW_CONSUMER_DROPS, "frames dropped for slow consumers");
    describe_counter!(INGEST_DECODE_ERRORS, "undecodable bus payloads");
    describe_counter!(INGEST_STALE_DROPS, "stale events dropped by the ingestor");
    describe_counter!(BUS_PUBLISH_DROPS, "outbound bus events dropped on overflow");
    describe_counter!(BUS_DELIVERY_DROPS, "bus deliveries dropped on subscriber overflow");
    describe_histogram!(FRAME_ENCODE_SECONDS, "outbound frame encode duration");
    describe_histogram!(FRAME_BYTES, "outbound frame size in bytes");
    describe_histogram!(RISK_DECISION_SECONDS, "risk decision latency");
}
