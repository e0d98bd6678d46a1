// =============================================================================
// Order simulation — prospective account state and post-trade risk metrics
// =============================================================================
//
// Pure arithmetic over the authoritative account state: merge the candidate
// order into the existing positions, recompute notional and margin, and
// derive the metric set the policies evaluate. No I/O here — the gate feeds
// in prices through a lookup closure so this stays trivially testable.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::account::AccountState;
use crate::error::{Error, Result};
use crate::types::{OrderType, Side};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One candidate order submitted to the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    #[serde(default)]
    pub account_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub strategy_id: Option<String>,
}

impl OrderRequest {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(Error::InvalidInput("symbol must not be empty".into()));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if let Some(price) = self.price {
            if !price.is_finite() || price <= 0.0 {
                return Err(Error::InvalidInput(format!("price must be positive, got {price}")));
            }
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err(Error::InvalidInput("limit order requires a price".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Net exposure per symbol after merging the candidate order.
#[derive(Debug, Clone)]
struct NetPosition {
    side: Side,
    quantity: f64,
}

/// Exchange initial-margin rate for cross-margined perpetuals (2 % = 50x
/// exchange maximum). The account-leverage policy is the tighter,
/// configurable limit; this rate only decides outright margin exhaustion.
pub const INITIAL_MARGIN_RATE: f64 = 0.02;

/// Prospective account after the order fills at `exec_price`.
#[derive(Debug, Clone)]
pub struct PostTrade {
    pub equity: f64,
    pub margin_used: f64,
    pub available_balance: f64,
    pub total_notional: f64,
    pub notional_by_symbol: HashMap<String, f64>,
}

/// Simulate the order against the account. `mark_price` resolves current
/// marks for existing positions; entry price is the fallback so a symbol
/// without a fresh tick still carries its exposure.
///
/// Returns a rejection reason when the post-trade margin requirement exceeds
/// equity.
pub fn simulate_order(
    account: &AccountState,
    request: &OrderRequest,
    exec_price: f64,
    mark_price: &dyn Fn(&str) -> Option<f64>,
) -> std::result::Result<PostTrade, String> {
    // Net existing positions by symbol.
    let mut net: HashMap<String, NetPosition> = HashMap::new();
    for position in &account.positions {
        let entry = net.entry(position.symbol.clone()).or_insert(NetPosition {
            side: position.side,
            quantity: 0.0,
        });
        if entry.side == position.side {
            entry.quantity += position.quantity;
        } else if position.quantity > entry.quantity {
            entry.side = position.side;
            entry.quantity = position.quantity - entry.quantity;
        } else {
            entry.quantity -= position.quantity;
        }
    }

    // Merge the candidate order: same side adds exposure, opposite side
    // reduces and may flip.
    {
        let entry = net.entry(request.symbol.clone()).or_insert(NetPosition {
            side: request.side,
            quantity: 0.0,
        });
        if entry.quantity == 0.0 || entry.side == request.side {
            entry.side = request.side;
            entry.quantity += request.quantity;
        } else if request.quantity > entry.quantity {
            entry.side = request.side;
            entry.quantity = request.quantity - entry.quantity;
        } else {
            entry.quantity -= request.quantity;
        }
    }

    // Notional per symbol at current marks; the traded symbol marks at the
    // execution price.
    let mut notional_by_symbol = HashMap::new();
    let mut total_notional = 0.0;
    for (symbol, position) in &net {
        if position.quantity == 0.0 {
            continue;
        }
        let mark = if symbol == &request.symbol {
            exec_price
        } else {
            mark_price(symbol)
                .or_else(|| {
                    account
                        .positions
                        .iter()
                        .find(|p| &p.symbol == symbol)
                        .map(|p| p.entry_price)
                })
                .unwrap_or(0.0)
        };
        let notional = position.quantity * mark;
        total_notional += notional;
        notional_by_symbol.insert(symbol.clone(), notional);
    }

    let equity = account.total_balance;
    let margin_used = total_notional * INITIAL_MARGIN_RATE;

    if margin_used > equity {
        return Err(format!(
            "insufficient margin: required {margin_used:.2}, equity {equity:.2}"
        ));
    }

    Ok(PostTrade {
        equity,
        margin_used,
        available_balance: equity - margin_used,
        total_notional,
        notional_by_symbol,
    })
}

/// Current-portfolio variant: no candidate order, used by the metrics RPC
/// and the periodic monitor.
pub fn portfolio_state(
    account: &AccountState,
    mark_price: &dyn Fn(&str) -> Option<f64>,
) -> PostTrade {
    let mut notional_by_symbol = HashMap::new();
    let mut total_notional = 0.0;
    for position in &account.positions {
        let mark = mark_price(&position.symbol).unwrap_or(position.entry_price);
        let notional = position.quantity * mark;
        total_notional += notional;
        *notional_by_symbol.entry(position.symbol.clone()).or_insert(0.0) += notional;
    }

    PostTrade {
        equity: account.total_balance,
        margin_used: account.margin_used,
        available_balance: account.available_balance,
        total_notional,
        notional_by_symbol,
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Post-trade risk metrics evaluated by the policy set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub leverage: f64,
    pub margin_ratio: f64,
    /// Fractional drawdown from the daily-start equity (0.21 = 21 %).
    pub daily_drawdown: f64,
    /// Fractional drawdown from peak equity.
    pub max_drawdown: f64,
    /// Largest single-symbol share of total notional.
    pub symbol_concentration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concentration_symbol: Option<String>,
    /// Per-symbol share of total notional.
    #[serde(default)]
    pub concentration_by_symbol: HashMap<String, f64>,
    pub total_notional: f64,
    pub equity: f64,
    pub timestamp: DateTime<Utc>,
}

impl RiskMetrics {
    /// Resolve a policy metric key. Symbol-scoped concentration policies
    /// evaluate that symbol's share instead of the maximum.
    pub fn metric(&self, key: &str, scope_symbol: Option<&str>) -> Option<f64> {
        match key {
            "leverage" => Some(self.leverage),
            "margin_ratio" => Some(self.margin_ratio),
            "daily_drawdown" => Some(self.daily_drawdown),
            "max_drawdown" => Some(self.max_drawdown),
            "symbol_concentration" => match scope_symbol {
                Some(symbol) => Some(
                    self.concentration_by_symbol
                        .get(symbol)
                        .copied()
                        .unwrap_or(0.0),
                ),
                None => Some(self.symbol_concentration),
            },
            _ => None,
        }
    }
}

/// Derive the metric set from the account and a (possibly prospective)
/// portfolio state. Drawdowns depend only on equity, so they are identical
/// before and after the candidate order.
pub fn compute_metrics(account: &AccountState, portfolio: &PostTrade) -> RiskMetrics {
    let equity = portfolio.equity;

    let leverage = if equity > 0.0 {
        portfolio.total_notional / equity
    } else if portfolio.total_notional > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let margin_ratio = if equity > 0.0 {
        portfolio.margin_used / equity
    } else {
        0.0
    };

    let daily_drawdown = drawdown(account.daily_start_equity, equity);
    let max_drawdown = drawdown(account.peak_equity, equity);

    let mut concentration_by_symbol = HashMap::new();
    let mut symbol_concentration = 0.0;
    let mut concentration_symbol = None;
    if portfolio.total_notional > 0.0 {
        for (symbol, notional) in &portfolio.notional_by_symbol {
            let share = notional / portfolio.total_notional;
            concentration_by_symbol.insert(symbol.clone(), share);
            if share > symbol_concentration {
                symbol_concentration = share;
                concentration_symbol = Some(symbol.clone());
            }
        }
    }

    RiskMetrics {
        leverage,
        margin_ratio,
        daily_drawdown,
        max_drawdown,
        symbol_concentration,
        concentration_symbol,
        concentration_by_symbol,
        total_notional: portfolio.total_notional,
        equity,
        timestamp: Utc::now(),
    }
}

fn drawdown(reference: f64, equity: f64) -> f64 {
    if reference > 0.0 {
        ((reference - equity) / reference).max(0.0)
    } else {
        0.0
    }
}

// =============================================================================
// Tests
// =============================================================================
