// =============================================================================
// Session layer — WebSocket lifecycle for streaming clients
// =============================================================================
//
// Upgrades happen on `/ws`. Query parameters pick the cadence class
// (`type=tui|web`) and the wire format (`format=binary|json`); when auth is
// enabled a `token` parameter is checked in constant time.
//
// Each connection runs a reader (this task) and a writer task. The writer is
// the only socket writer: data frames and control frames all ride the send
// queue. The cleanup path at the end of the reader is the sole closer of the
// send queue — shutdown, read errors, and pong timeouts all funnel into it,
// and `SendQueue::close` makes the close idempotent.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::auth;
use crate::app::AppContext;
use crate::broadcast::queue::{Outbound, SendQueue};
use crate::types::{ClientKind, WireFormat};
use crate::wire::{self, ClientCommand, ServerFrame};

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

/// One live connection's control record.
pub struct SessionRecord {
    pub id: String,
    pub kind: ClientKind,
    pub format: WireFormat,
    pub created_at: DateTime<Utc>,
    cancel: watch::Sender<bool>,
}

/// Registry of live sessions. Writes only on connect/disconnect.
#[derive(Default)]
pub struct SessionMap {
    inner: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, record: SessionRecord) {
        self.inner.write().insert(record.id.clone(), record);
    }

    fn remove(&self, id: &str) -> Option<SessionRecord> {
        self.inner.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Cancel every live session (forced shutdown path).
    pub fn cancel_all(&self) {
        for record in self.inner.read().values() {
            let _ = record.cancel.send(true);
        }
    }
}

// ---------------------------------------------------------------------------
// Upgrade handler
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// `tui` (fast cadence, default) or `web` (slow cadence).
    #[serde(default, rename = "type")]
    client_type: Option<String>,
    /// `binary` (default) or `json`.
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(ctx): State<Arc<AppContext>>,
) -> Response {
    if !auth::token_allowed(&ctx.config.auth, "/ws", query.token.as_deref()) {
        warn!("websocket upgrade rejected: invalid token");
        return (StatusCode::FORBIDDEN, "invalid or missing token").into_response();
    }

    let kind = ClientKind::from_query(query.client_type.as_deref());
    let format = WireFormat::from_query(query.format.as_deref());

    ws.on_upgrade(move |socket| handle_socket(socket, ctx, kind, format))
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>, kind: ClientKind, format: WireFormat) {
    let id = Uuid::new_v4().to_string();
    info!(client = %id, kind = ?kind, format = ?format, "session opened");

    let queue = SendQueue::new(ctx.broadcaster.config().send_queue_capacity);
    ctx.broadcaster.register(id.clone(), kind, format, queue.clone());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    ctx.sessions.insert(SessionRecord {
        id: id.clone(),
        kind,
        format,
        created_at: Utc::now(),
        cancel: cancel_tx.clone(),
    });

    let (sink, stream) = socket.split();
    let last_pong = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
    let writer_done = Arc::new(Notify::new());

    let writer = tokio::spawn(writer_task(
        sink,
        queue.clone(),
        cancel_rx.clone(),
        ctx.clone(),
        id.clone(),
        last_pong.clone(),
        writer_done.clone(),
    ));

    read_loop(stream, &ctx, &id, format, &queue, cancel_rx, &last_pong, &writer_done).await;

    // Cleanup — the single close path for every exit reason.
    let _ = cancel_tx.send(true);
    ctx.broadcaster.unregister(&id);
    if queue.close() {
        debug!(client = %id, "send queue closed");
    }
    ctx.sessions.remove(&id);
    let _ = tokio::time::timeout(ctx.config.server.shutdown_timeout(), writer).await;
    info!(client = %id, "session closed");
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    ctx: &Arc<AppContext>,
    id: &str,
    format: WireFormat,
    queue: &Arc<SendQueue>,
    mut cancel: watch::Receiver<bool>,
    last_pong: &AtomicI64,
    writer_done: &Notify,
) {
    let mut service_shutdown = ctx.shutdown.clone();

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!(client = %id, "session cancelled");
                    break;
                }
            }
            changed = service_shutdown.changed() => {
                if changed.is_err() || *service_shutdown.borrow() {
                    debug!(client = %id, "service shutting down — closing session");
                    break;
                }
            }
            _ = writer_done.notified() => {
                debug!(client = %id, "writer finished — closing session");
                break;
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => handle_command(ctx, id, format, queue, &text),
                    Some(Ok(Message::Binary(_))) => {
                        // Client commands are JSON text; binary input is noise.
                        debug!(client = %id, "binary client message ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        queue.push(Outbound::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(client = %id, "close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %id, error = %e, "read error");
                        break;
                    }
                    None => {
                        debug!(client = %id, "stream ended");
                        break;
                    }
                }
            }
        }
    }
}

/// Apply one client command. Malformed input answers with an error frame on
/// the client's own connection; it never disconnects anyone.
fn handle_command(
    ctx: &Arc<AppContext>,
    id: &str,
    format: WireFormat,
    queue: &Arc<SendQueue>,
    text: &str,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(client = %id, error = %e, "undecodable client message");
            send_error(queue, ctx, format, "serialization_error");
            return;
        }
    };

    match command {
        ClientCommand::Subscribe { channels, .. } => match wire::parse_channels(&channels) {
            Ok(set) => {
                let added = ctx.broadcaster.subscribe(id, set);
                debug!(client = %id, added = added.len(), "subscription widened");
            }
            Err(e) => {
                warn!(client = %id, error = %e, "subscribe rejected");
                send_error(queue, ctx, format, e.code());
            }
        },
        ClientCommand::Unsubscribe { channels, .. } => match wire::parse_channels(&channels) {
            Ok(set) => ctx.broadcaster.unsubscribe(id, set),
            Err(e) => send_error(queue, ctx, format, e.code()),
        },
        ClientCommand::Refresh { .. } => ctx.broadcaster.request_refresh(id),
        ClientCommand::Ping { .. } => {
            let frame = ServerFrame::pong(ctx.aggregator.sequence());
            match wire::encode_frame(&frame, format) {
                Ok(encoded) => {
                    queue.push(Outbound::Frame(encoded));
                }
                Err(e) => warn!(client = %id, error = %e, "pong encode failed"),
            }
        }
    }
}

fn send_error(queue: &SendQueue, ctx: &AppContext, format: WireFormat, code: &str) {
    let frame = ServerFrame::error(ctx.aggregator.sequence(), code);
    if let Ok(encoded) = wire::encode_frame(&frame, format) {
        queue.push(Outbound::Frame(encoded));
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drain the send queue to the socket; own the ping timer and the pong
/// deadline. Exits on cancel, queue closure, write failure, or a missed
/// pong window.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    queue: Arc<SendQueue>,
    mut cancel: watch::Receiver<bool>,
    ctx: Arc<AppContext>,
    id: String,
    last_pong: Arc<AtomicI64>,
    done: Arc<Notify>,
) {
    let cfg = ctx.broadcaster.config();
    let write_timeout = cfg.write_timeout();
    let pong_timeout_ms = cfg.pong_timeout().as_millis() as i64;

    let mut ping = tokio::time::interval(cfg.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; treat it as the baseline.
    ping.tick().await;

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            item = queue.pop() => {
                let Some(item) = item else {
                    debug!(client = %id, "send queue drained and closed");
                    break;
                };
                let message = match item {
                    Outbound::Frame(encoded) if encoded.is_binary => Message::Binary(encoded.payload),
                    Outbound::Frame(encoded) => match String::from_utf8(encoded.payload) {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            warn!(client = %id, error = %e, "non-utf8 json frame dropped");
                            continue;
                        }
                    },
                    Outbound::Ping(data) => Message::Ping(data),
                    Outbound::Pong(data) => Message::Pong(data),
                };
                match tokio::time::timeout(write_timeout, sink.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(client = %id, error = %e, "write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(client = %id, "write deadline exceeded");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let silent_ms = Utc::now().timestamp_millis()
                    - last_pong.load(Ordering::Relaxed);
                if silent_ms > pong_timeout_ms {
                    warn!(client = %id, silent_ms, "pong window missed — closing");
                    break;
                }
                match tokio::time::timeout(write_timeout, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(client = %id, "ping write failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.close().await;
    done.notify_waiters();
    done.notify_one();
}

// =============================================================================
// Tests
// =============================================================================
//
// Full connect/command/cleanup flows need a live socket and are covered by
// the integration suite; here we pin down the registry semantics.

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> (SessionRecord, watch::Receiver<bool>) {
        let (cancel, rx) = watch::channel(false);
        (
            SessionRecord {
                id: id.to_string(),
                kind: ClientKind::Fast,
                format: WireFormat::Json,
                created_at: Utc::now(),
                cancel,
            },
            rx,
        )
    }

    #[test]
    fn registry_insert_remove() {
        let sessions = SessionMap::new();
        let (rec, _rx) = record("a");
        sessions.insert(rec);
        assert_eq!(sessions.len(), 1);

        assert!(sessions.remove("a").is_some());
        assert!(sessions.remove("a").is_none());
        assert!(sessions.is_empty());
    }

    #[test]
    fn cancel_all_signals_every_session() {
        let sessions = SessionMap::new();
        let (rec_a, rx_a) = record("a");
        let (rec_b, rx_b) = record("b");
        sessions.insert(rec_a);
        sessions.insert(rec_b);

        sessions.cancel_all();
        assert!(*rx_a.borrow());
        assert!(*rx_b.borrow());
    }
}
