// =============================================================================
// Aggregator — single-writer owner of the consolidated state
// =============================================================================
//
// One task applies events in arrival order; every other component reads
// immutable snapshots through an `ArcSwap`. A mutation clones the current
// state (the maps are small — symbols, open orders, strategies), applies the
// event, bumps the sequence and swaps the new generation in. Handed-out
// snapshots are never mutated in place, so readers see either generation
// N-1 or N, never a torn mix.
//
// The coarse change feed carries `{sequence, channels}`; per-client diffs
// are the broadcaster's job.
// =============================================================================

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::state::events::EngineEvent;
use crate::state::model::{ConsolidatedState, StrategyRunState};
use crate::types::{Channel, ChannelSet};

/// Capacity of the coarse change-feed broadcast.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Coarse "something changed" signal: which channels were touched by the
/// mutation that produced `sequence`.
#[derive(Debug, Clone, Copy)]
pub struct ChangeNotice {
    pub sequence: u64,
    pub channels: ChannelSet,
}

pub struct Aggregator {
    current: ArcSwap<ConsolidatedState>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl Aggregator {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Arc::new(Self {
            current: ArcSwap::from_pointee(ConsolidatedState::default()),
            changes,
        })
    }

    /// Immutable snapshot of the current generation.
    pub fn snapshot(&self) -> Arc<ConsolidatedState> {
        self.current.load_full()
    }

    /// Sequence of the current generation.
    pub fn sequence(&self) -> u64 {
        self.current.load().sequence
    }

    /// Subscribe to the coarse change feed.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }

    /// Apply one event. Returns the change notice, or `None` when the event
    /// was a no-op (stale tick, empty mutation).
    ///
    /// Single-writer contract: only the `run` loop (and tests) call this;
    /// concurrent callers would race the clone-and-swap.
    pub fn apply(&self, event: EngineEvent) -> Option<ChangeNotice> {
        let mut next = ConsolidatedState::clone(&self.current.load());

        let channels = apply_event(&mut next, event)?;

        next.sequence += 1;
        next.timestamp = Utc::now();
        let sequence = next.sequence;
        for channel in channels.iter() {
            next.channel_seq[channel.index()] = sequence;
        }
        next.check_account_identity();

        self.current.store(Arc::new(next));

        let notice = ChangeNotice { sequence, channels };
        // No receivers is fine; the broadcaster polls on cadence anyway.
        let _ = self.changes.send(notice);
        Some(notice)
    }

    /// Single-writer apply loop. Malformed or stale events are skipped;
    /// the loop only exits on shutdown or channel close.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("aggregator loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("aggregator shutting down");
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(notice) = self.apply(event) {
                                debug!(
                                    sequence = notice.sequence,
                                    channels = notice.channels.len(),
                                    "state advanced"
                                );
                            }
                        }
                        None => {
                            warn!("event channel closed — aggregator exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Mutate `state` with `event`; returns the touched channels, or `None` for
/// a no-op.
fn apply_event(state: &mut ConsolidatedState, event: EngineEvent) -> Option<ChannelSet> {
    let mut channels = ChannelSet::empty();

    match event {
        EngineEvent::MarketTick { symbol, tick } => {
            // Invariant: per-symbol updated_at never regresses.
            if let Some(existing) = state.market_data.get(&symbol) {
                if existing.updated_at > tick.updated_at {
                    debug!(symbol = %symbol, "stale tick dropped by aggregator");
                    return None;
                }
            }
            state.market_data.insert(symbol.clone(), tick);
            channels.insert(Channel::MarketData);

            // Re-marking moves positions on this symbol too.
            if state.positions.contains_key(&symbol) {
                channels.insert(Channel::Positions);
            }
            state.remark_positions();
        }
        EngineEvent::OrderUpdate(order) => {
            state.orders.insert(order.order_id.clone(), order);
            channels.insert(Channel::Orders);
        }
        EngineEvent::PositionUpdate(position) => {
            let symbol = position.symbol.clone();
            if position.quantity == 0.0 {
                state.positions.remove(&symbol);
            } else {
                state.positions.insert(symbol, position);
            }
            state.remark_positions();
            channels.insert(Channel::Positions);
        }
        EngineEvent::AccountUpdate(account) => {
            state.account = Some(account);
            channels.insert(Channel::Account);
        }
        EngineEvent::StrategyHeartbeat(strategy) => {
            state.strategies.insert(strategy.strategy_id.clone(), strategy);
            channels.insert(Channel::Strategies);
        }
        EngineEvent::EmergencyStop(notice) => {
            warn!(reason = %notice.reason, triggered_by = %notice.triggered_by, "emergency stop reflected in state");
            for strategy in state.strategies.values_mut() {
                strategy.status = StrategyRunState::EmergencyStopped;
                strategy.updated_at = notice.stopped_at;
            }
            channels.insert(Channel::Strategies);
        }
    }

    (!channels.is_empty()).then_some(channels)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{AccountSummary, MarketTicker, StrategyStatus};
    use crate::types::Side;
    use chrono::Duration as ChronoDuration;

    fn tick(price: f64, at: chrono::DateTime<Utc>) -> MarketTicker {
        MarketTicker {
            last_price: price,
            bid: price - 1.0,
            ask: price + 1.0,
            high_24h: 0.0,
            low_24h: 0.0,
            volume_24h: 0.0,
            updated_at: at,
        }
    }

    fn market_event(symbol: &str, price: f64, at: chrono::DateTime<Utc>) -> EngineEvent {
        EngineEvent::MarketTick {
            symbol: symbol.to_string(),
            tick: tick(price, at),
        }
    }

    #[test]
    fn sequence_is_strictly_monotonic() {
        let agg = Aggregator::new();
        let now = Utc::now();

        let n1 = agg.apply(market_event("BTCUSDT", 50_000.0, now)).unwrap();
        let n2 = agg
            .apply(market_event("BTCUSDT", 50_001.0, now + ChronoDuration::milliseconds(1)))
            .unwrap();
        let n3 = agg
            .apply(market_event("ETHUSDT", 3_000.0, now + ChronoDuration::milliseconds(2)))
            .unwrap();

        assert_eq!(n1.sequence, 1);
        assert_eq!(n2.sequence, 2);
        assert_eq!(n3.sequence, 3);
        assert_eq!(agg.sequence(), 3);
    }

    #[test]
    fn stale_ticks_are_noops() {
        let agg = Aggregator::new();
        let now = Utc::now();

        agg.apply(market_event("BTCUSDT", 50_000.0, now)).unwrap();
        let stale = agg.apply(market_event(
            "BTCUSDT",
            49_000.0,
            now - ChronoDuration::seconds(1),
        ));
        assert!(stale.is_none());
        assert_eq!(agg.sequence(), 1);
        assert_eq!(
            agg.snapshot().market_data["BTCUSDT"].last_price,
            50_000.0
        );
    }

    #[test]
    fn snapshots_are_immutable_generations() {
        let agg = Aggregator::new();
        let now = Utc::now();

        agg.apply(market_event("BTCUSDT", 50_000.0, now));
        let before = agg.snapshot();

        agg.apply(market_event("BTCUSDT", 51_000.0, now + ChronoDuration::seconds(1)));
        let after = agg.snapshot();

        assert_eq!(before.market_data["BTCUSDT"].last_price, 50_000.0);
        assert_eq!(after.market_data["BTCUSDT"].last_price, 51_000.0);
        assert_eq!(before.sequence + 1, after.sequence);
    }

    #[test]
    fn tick_remarks_positions_and_flags_both_channels() {
        let agg = Aggregator::new();
        let now = Utc::now();

        agg.apply(EngineEvent::PositionUpdate(
            crate::state::model::PositionRecord {
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                quantity: 0.5,
                entry_price: 50_000.0,
                mark_price: None,
                unrealized_pnl: None,
                realized_pnl: 0.0,
                liquidation_price: None,
                updated_at: now,
            },
        ))
        .unwrap();

        let notice = agg.apply(market_event("BTCUSDT", 51_000.0, now)).unwrap();
        assert!(notice.channels.contains(Channel::MarketData));
        assert!(notice.channels.contains(Channel::Positions));

        let snapshot = agg.snapshot();
        assert_eq!(
            snapshot.positions["BTCUSDT"].unrealized_pnl,
            Some(500.0)
        );
        assert_eq!(snapshot.channel_seq[Channel::Positions.index()], snapshot.sequence);
    }

    #[test]
    fn zero_quantity_position_is_removed() {
        let agg = Aggregator::new();
        let now = Utc::now();
        let mut position = crate::state::model::PositionRecord {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: 0.5,
            entry_price: 50_000.0,
            mark_price: None,
            unrealized_pnl: None,
            realized_pnl: 0.0,
            liquidation_price: None,
            updated_at: now,
        };
        agg.apply(EngineEvent::PositionUpdate(position.clone())).unwrap();
        assert_eq!(agg.snapshot().positions.len(), 1);

        position.quantity = 0.0;
        position.updated_at = now + ChronoDuration::seconds(1);
        agg.apply(EngineEvent::PositionUpdate(position)).unwrap();
        assert!(agg.snapshot().positions.is_empty());
    }

    #[test]
    fn emergency_stop_marks_all_strategies() {
        let agg = Aggregator::new();
        let now = Utc::now();

        for id in ["momentum", "scalper"] {
            agg.apply(EngineEvent::StrategyHeartbeat(StrategyStatus {
                strategy_id: id.to_string(),
                name: id.to_string(),
                status: StrategyRunState::Running,
                pnl: 0.0,
                trade_count: 0,
                win_rate: 0.0,
                updated_at: now,
            }))
            .unwrap();
        }

        let notice = agg
            .apply(EngineEvent::EmergencyStop(crate::state::events::EmergencyNotice {
                reason: "drawdown".into(),
                triggered_by: "risk_gate".into(),
                stopped_at: now,
            }))
            .unwrap();
        assert!(notice.channels.contains(Channel::Strategies));

        let snapshot = agg.snapshot();
        assert!(snapshot
            .strategies
            .values()
            .all(|s| s.status == StrategyRunState::EmergencyStopped));
    }

    #[test]
    fn change_feed_reports_touched_channels() {
        let agg = Aggregator::new();
        let mut feed = agg.subscribe_changes();
        let now = Utc::now();

        agg.apply(EngineEvent::AccountUpdate(AccountSummary {
            total_balance: 100_000.0,
            available_balance: 100_000.0,
            margin_used: 0.0,
            unrealized_pnl: 0.0,
            balances: Default::default(),
            updated_at: now,
        }))
        .unwrap();

        let notice = feed.try_recv().unwrap();
        assert_eq!(notice.sequence, 1);
        assert!(notice.channels.contains(Channel::Account));
        assert!(!notice.channels.contains(Channel::Orders));
    }
}
