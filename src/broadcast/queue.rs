// =============================================================================
// Per-client send queue — bounded, drop-oldest, closed exactly once
// =============================================================================
//
// Single producer (the broadcaster's tick) and single consumer (the client's
// writer task). `push` never blocks: when the queue is full the oldest
// pending frame is discarded to make room for the newest. `close` reports
// whether this call performed the close, so the session cleanup path can be
// the sole closer even when shutdown paths race.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::wire::EncodedFrame;

/// One item bound for the socket. Control frames ride the same queue so the
/// writer task remains the only socket writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(EncodedFrame),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The newest frame was queued after evicting the oldest.
    DroppedOldest,
    Closed,
}

struct Inner {
    buffer: VecDeque<Outbound>,
    closed: bool,
}

pub struct SendQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Non-blocking enqueue with drop-oldest backpressure.
    pub fn push(&self, item: Outbound) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let outcome = if inner.buffer.len() >= self.capacity {
                inner.buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            inner.buffer.push_back(item);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Await the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.buffer.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            // notify_one stores a permit when nobody is waiting yet, so a
            // push between the unlock above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Close the queue. Returns `true` only for the call that performed the
    /// close; every later call is a no-op returning `false`.
    pub fn close(&self) -> bool {
        let first = {
            let mut inner = self.inner.lock();
            if inner.closed {
                false
            } else {
                inner.closed = true;
                true
            }
        };
        if first {
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    /// Total frames evicted by drop-oldest.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
