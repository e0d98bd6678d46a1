// =============================================================================
// Engine events — typed events decoded from bus payloads
// =============================================================================
//
// Subject prefixes select the event type; payloads are plain JSON bodies.
// Decoding failures are the ingestor's to count and drop — nothing here
// panics on malformed input.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::model::{
    AccountSummary, MarketTicker, OrderRecord, PositionRecord, StrategyStatus,
};
use crate::types::{Channel, Side};

/// Emergency-stop announcement carried on `risk.emergency`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyNotice {
    pub reason: String,
    pub triggered_by: String,
    pub stopped_at: DateTime<Utc>,
}

/// One typed event on its way into the aggregator.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MarketTick { symbol: String, tick: MarketTicker },
    OrderUpdate(OrderRecord),
    PositionUpdate(PositionRecord),
    AccountUpdate(AccountSummary),
    StrategyHeartbeat(StrategyStatus),
    EmergencyStop(EmergencyNotice),
}

/// Market tick payload as carried on the bus (symbol inline).
#[derive(Debug, Deserialize)]
struct MarketTickPayload {
    symbol: String,
    last_price: f64,
    bid: f64,
    ask: f64,
    #[serde(default)]
    high_24h: f64,
    #[serde(default)]
    low_24h: f64,
    #[serde(default)]
    volume_24h: f64,
    updated_at: DateTime<Utc>,
}

/// Position payload as carried on the bus. Mark price and unrealized PnL are
/// derived by the aggregator, never trusted from upstream.
#[derive(Debug, Deserialize)]
struct PositionPayload {
    symbol: String,
    side: Side,
    quantity: f64,
    entry_price: f64,
    #[serde(default)]
    realized_pnl: f64,
    #[serde(default)]
    liquidation_price: Option<f64>,
    updated_at: DateTime<Utc>,
}

impl EngineEvent {
    /// Decode a bus message into a typed event by subject prefix.
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self> {
        if subject.starts_with("market.") {
            let p: MarketTickPayload = serde_json::from_slice(payload)?;
            Ok(Self::MarketTick {
                symbol: p.symbol,
                tick: MarketTicker {
                    last_price: p.last_price,
                    bid: p.bid,
                    ask: p.ask,
                    high_24h: p.high_24h,
                    low_24h: p.low_24h,
                    volume_24h: p.volume_24h,
                    updated_at: p.updated_at,
                },
            })
        } else if subject.starts_with("orders.updates.") {
            Ok(Self::OrderUpdate(serde_json::from_slice(payload)?))
        } else if subject.starts_with("positions.") {
            let p: PositionPayload = serde_json::from_slice(payload)?;
            Ok(Self::PositionUpdate(PositionRecord {
                symbol: p.symbol,
                side: p.side,
                quantity: p.quantity,
                entry_price: p.entry_price,
                mark_price: None,
                unrealized_pnl: None,
                realized_pnl: p.realized_pnl,
                liquidation_price: p.liquidation_price,
                updated_at: p.updated_at,
            }))
        } else if subject.starts_with("account.") {
            Ok(Self::AccountUpdate(serde_json::from_slice(payload)?))
        } else if subject.starts_with("strategies.") {
            Ok(Self::StrategyHeartbeat(serde_json::from_slice(payload)?))
        } else if subject == "risk.emergency" || subject.starts_with("risk.emergency.") {
            Ok(Self::EmergencyStop(serde_json::from_slice(payload)?))
        } else {
            Err(Error::InvalidInput(format!("unroutable subject {subject}")))
        }
    }

    /// Channel this event mutates.
    pub fn channel(&self) -> Channel {
        match self {
            Self::MarketTick { .. } => Channel::MarketData,
            Self::OrderUpdate(_) => Channel::Orders,
            Self::PositionUpdate(_) => Channel::Positions,
            Self::AccountUpdate(_) => Channel::Account,
            Self::StrategyHeartbeat(_) => Channel::Strategies,
            Self::EmergencyStop(_) => Channel::Strategies,
        }
    }

    /// Per-key monotonicity identity: (channel, entity key).
    pub fn monotonic_key(&self) -> Option<(Channel, String)> {
        match self {
            Self::MarketTick { symbol, .. } => Some((Channel::MarketData, symbol.clone())),
            Self::OrderUpdate(order) => Some((Channel::Orders, order.order_id.clone())),
            Self::PositionUpdate(position) => Some((Channel::Positions, position.symbol.clone())),
            Self::AccountUpdate(_) => Some((Channel::Account, String::new())),
            Self::StrategyHeartbeat(s) => Some((Channel::Strategies, s.strategy_id.clone())),
            // Emergency stops are never dropped as stale.
            Self::EmergencyStop(_) => None,
        }
    }

    /// Event timestamp used for staleness comparison.
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::MarketTick { tick, .. } => tick.updated_at,
            Self::OrderUpdate(order) => order.updated_at,
            Self::PositionUpdate(position) => position.updated_at,
            Self::AccountUpdate(account) => account.updated_at,
            Self::StrategyHeartbeat(strategy) => strategy.updated_at,
            Self::EmergencyStop(notice) => notice.stopped_at,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_market_tick() {
        let payload = serde_json::json!({
            "symbol": "BTCUSDT",
            "last_price": 50000.0,
            "bid": 49999.5,
            "ask": 50000.5,
            "volume_24h": 1234.0,
            "updated_at": "2026-03-01T12:00:00Z"
        });
        let event =
            EngineEvent::decode("market.BTCUSDT", &serde_json::to_vec(&payload).unwrap()).unwrap();
        match event {
            EngineEvent::MarketTick { symbol, tick } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(tick.last_price, 50_000.0);
                assert_eq!(tick.high_24h, 0.0);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn decode_position_strips_upstream_marks() {
        let payload = serde_json::json!({
            "symbol": "BTCUSDT",
            "side": "BUY",
            "quantity": 0.5,
            "entry_price": 50000.0,
            "updated_at": "2026-03-01T12:00:00Z"
        });
        let event =
            EngineEvent::decode("positions.BTCUSDT", &serde_json::to_vec(&payload).unwrap())
                .unwrap();
        match event {
            EngineEvent::PositionUpdate(p) => {
                assert!(p.mark_price.is_none());
                assert!(p.unrealized_pnl.is_none());
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn decode_emergency_on_bare_and_scoped_subjects() {
        let payload = serde_json::json!({
            "reason": "drawdown",
            "triggered_by": "risk_gate",
            "stopped_at": "2026-03-01T12:00:00Z"
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        assert!(matches!(
            EngineEvent::decode("risk.emergency", &bytes).unwrap(),
            EngineEvent::EmergencyStop(_)
        ));
        assert!(matches!(
            EngineEvent::decode("risk.emergency.instance-2", &bytes).unwrap(),
            EngineEvent::EmergencyStop(_)
        ));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        assert!(EngineEvent::decode("market.BTCUSDT", b"{oops").is_err());
    }

    #[test]
    fn decode_rejects_unroutable_subject() {
        let err = EngineEvent::decode("weather.london", b"{}").unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }
}
