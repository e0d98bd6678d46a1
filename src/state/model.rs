// =============================================================================
// Consolidated state model
// =============================================================================
//
// One logical record combining everything the dashboard shows. The
// aggregator owns the only mutable copy; everyone else reads immutable
// snapshots. Wire projection happens per channel via `channel_value`.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{AssetBalance, Channel, OrderStatus, OrderType, Side};

/// Relative tolerance for the account balance identity check.
const BALANCE_TOLERANCE: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Channel records
// ---------------------------------------------------------------------------

/// Latest market data for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTicker {
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub updated_at: DateTime<Utc>,
}

/// One open or recently closed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub filled_quantity: f64,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

/// One open position. `mark_price` and `unrealized_pnl` are derived from
/// market data and absent when no ticker exists for the symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidation_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Account totals plus per-asset balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub total_balance: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub balances: HashMap<String, AssetBalance>,
    pub updated_at: DateTime<Utc>,
}

/// Execution status of one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyRunState {
    Running,
    Paused,
    Stopped,
    EmergencyStopped,
}

impl std::fmt::Display for StrategyRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::EmergencyStopped => write!(f, "emergency_stopped"),
        }
    }
}

/// Heartbeat record for one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStatus {
    pub strategy_id: String,
    pub name: String,
    pub status: StrategyRunState,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub trade_count: u64,
    #[serde(default)]
    pub win_rate: f64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Consolidated state
// ---------------------------------------------------------------------------

/// The aggregator's authoritative record. Cloned copy-on-write per mutation;
/// handed out as immutable `Arc` snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidatedState {
    pub market_data: HashMap<String, MarketTicker>,
    /// Keyed by order_id; the wire carries the values as an array and
    /// consumers re-sort.
    pub orders: HashMap<String, OrderRecord>,
    pub positions: HashMap<String, PositionRecord>,
    pub account: Option<AccountSummary>,
    pub strategies: HashMap<String, StrategyStatus>,
    /// Bumped on every mutation; carried in every outbound frame.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Sequence of the last mutation touching each channel. Broadcaster
    /// bookkeeping, not wire data.
    #[serde(skip_serializing)]
    pub channel_seq: [u64; 5],
}

impl Default for ConsolidatedState {
    fn default() -> Self {
        Self {
            market_data: HashMap::new(),
            orders: HashMap::new(),
            positions: HashMap::new(),
            account: None,
            strategies: HashMap::new(),
            sequence: 0,
            timestamp: Utc::now(),
            channel_seq: [0; 5],
        }
    }
}

impl ConsolidatedState {
    /// Project one channel into its wire value. Maps serialize with sorted
    /// keys (serde_json's default map is ordered), so equal content always
    /// produces equal bytes — the fingerprint diff depends on this.
    pub fn channel_value(&self, channel: Channel) -> serde_json::Value {
        match channel {
            Channel::MarketData => serde_json::to_value(&self.market_data),
            Channel::Orders => {
                let mut orders: Vec<&OrderRecord> = self.orders.values().collect();
                orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
                serde_json::to_value(orders)
            }
            Channel::Positions => serde_json::to_value(&self.positions),
            Channel::Account => serde_json::to_value(&self.account),
            Channel::Strategies => serde_json::to_value(&self.strategies),
        }
        .unwrap_or(serde_json::Value::Null)
    }

    /// Re-derive `mark_price` / `unrealized_pnl` for every position from the
    /// current market data. Positions without a ticker are explicitly
    /// unmarked rather than carrying stale numbers.
    pub fn remark_positions(&mut self) {
        for position in self.positions.values_mut() {
            match self.market_data.get(&position.symbol) {
                Some(ticker) => {
                    let mark = ticker.last_price;
                    position.mark_price = Some(mark);
                    position.unrealized_pnl = Some(
                        position.side.direction() * (mark - position.entry_price) * position.quantity,
                    );
                }
                None => {
                    position.mark_price = None;
                    position.unrealized_pnl = None;
                }
            }
        }
    }

    /// Check the account identity
    /// `total_balance = available_balance + margin_used + Σ unrealized_pnl`.
    /// A violation is logged, never rejected — upstream is authoritative.
    pub fn check_account_identity(&self) {
        let Some(account) = &self.account else { return };

        let position_pnl: f64 = self
            .positions
            .values()
            .filter_map(|p| p.unrealized_pnl)
            .sum();
        let expected = account.available_balance + account.margin_used + position_pnl;
        let tolerance = BALANCE_TOLERANCE * account.total_balance.abs().max(1.0);

        if (account.total_balance - expected).abs() > tolerance {
            warn!(
                total_balance = account.total_balance,
                expected,
                "account balance identity violated"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(price: f64) -> MarketTicker {
        MarketTicker {
            last_price: price,
            bid: price - 0.5,
            ask: price + 0.5,
            high_24h: price * 1.02,
            low_24h: price * 0.98,
            volume_24h: 1_000.0,
            updated_at: Utc::now(),
        }
    }

    fn position(symbol: &str, side: Side, quantity: f64, entry: f64) -> PositionRecord {
        PositionRecord {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: entry,
            mark_price: None,
            unrealized_pnl: None,
            realized_pnl: 0.0,
            liquidation_price: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn remark_prices_positions_from_tickers() {
        let mut state = ConsolidatedState::default();
        state.market_data.insert("BTCUSDT".into(), ticker(51_000.0));
        state
            .positions
            .insert("BTCUSDT".into(), position("BTCUSDT", Side::Buy, 0.5, 50_000.0));

        state.remark_positions();

        let pos = &state.positions["BTCUSDT"];
        assert_eq!(pos.mark_price, Some(51_000.0));
        assert_eq!(pos.unrealized_pnl, Some(500.0));
    }

    #[test]
    fn remark_unmarks_positions_without_ticker() {
        let mut state = ConsolidatedState::default();
        state
            .positions
            .insert("ETHUSDT".into(), position("ETHUSDT", Side::Sell, 1.0, 3_000.0));

        state.remark_positions();

        let pos = &state.positions["ETHUSDT"];
        assert!(pos.mark_price.is_none());
        assert!(pos.unrealized_pnl.is_none());
    }

    #[test]
    fn short_position_pnl_sign() {
        let mut state = ConsolidatedState::default();
        state.market_data.insert("ETHUSDT".into(), ticker(2_900.0));
        state
            .positions
            .insert("ETHUSDT".into(), position("ETHUSDT", Side::Sell, 2.0, 3_000.0));

        state.remark_positions();
        assert_eq!(state.positions["ETHUSDT"].unrealized_pnl, Some(200.0));
    }

    #[test]
    fn orders_channel_is_sorted_array() {
        let mut state = ConsolidatedState::default();
        for id in ["o-2", "o-1", "o-3"] {
            state.orders.insert(
                id.to_string(),
                OrderRecord {
                    order_id: id.to_string(),
                    symbol: "BTCUSDT".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    price: 50_000.0,
                    quantity: 0.1,
                    filled_quantity: 0.0,
                    status: OrderStatus::New,
                    updated_at: Utc::now(),
                },
            );
        }

        let value = state.channel_value(Channel::Orders);
        let ids: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["order_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["o-1", "o-2", "o-3"]);
    }

    #[test]
    fn channel_value_is_deterministic() {
        let mut state = ConsolidatedState::default();
        state.market_data.insert("BTCUSDT".into(), ticker(50_000.0));
        state.market_data.insert("ETHUSDT".into(), ticker(3_000.0));

        let a = serde_json::to_vec(&state.channel_value(Channel::MarketData)).unwrap();
        let b = serde_json::to_vec(&state.clone().channel_value(Channel::MarketData)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_account_serialises_as_null() {
        let state = ConsolidatedState::default();
        assert!(state.channel_value(Channel::Account).is_null());
    }
}
