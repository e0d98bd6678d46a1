// =============================================================================
// Account monitor client — authoritative account state over HTTP
// =============================================================================
//
// Account state is fetched from the account-monitor service with a hard
// deadline and a short per-account TTL cache. Failures are loud: callers get
// `account_unavailable` and must propagate it. There is no mock fallback.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::types::{AssetBalance, Side};

/// Per-account cache TTL. Short enough that the risk gate always decides on
/// near-live data, long enough to absorb check-order bursts.
const ACCOUNT_TTL: Duration = Duration::from_millis(500);

/// One open position as reported by the account monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Authoritative account state from the account monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub account_id: String,
    /// Account equity.
    pub total_balance: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    /// Highest equity observed; denominator for max-drawdown.
    pub peak_equity: f64,
    /// Equity at the daily rollover; denominator for daily drawdown.
    pub daily_start_equity: f64,
    #[serde(default)]
    pub balances: HashMap<String, AssetBalance>,
    #[serde(default)]
    pub positions: Vec<AccountPosition>,
    pub updated_at: DateTime<Utc>,
}

/// Source of authoritative account state. The HTTP client implements this;
/// tests substitute a stub.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn account_state(&self, account_id: &str) -> Result<AccountState>;
}

/// HTTP client for the account-monitor service.
pub struct AccountMonitor {
    http: reqwest::Client,
    base_url: String,
    cache: Mutex<HashMap<String, (AccountState, Instant)>>,
}

impl AccountMonitor {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: cfg.account_monitor_url.trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl AccountSource for AccountMonitor {
    async fn account_state(&self, account_id: &str) -> Result<AccountState> {
        if let Some((state, fetched_at)) = self.cache.lock().get(account_id) {
            if fetched_at.elapsed() <= ACCOUNT_TTL {
                return Ok(state.clone());
            }
        }

        let url = format!("{}/accounts/{}/state", self.base_url, account_id);
        debug!(account_id, url = %url, "fetching account state");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::AccountUnavailable(format!("account monitor unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::AccountUnavailable(format!(
                "account monitor returned {}",
                response.status()
            )));
        }

        let state: AccountState = response
            .json()
            .await
            .map_err(|e| Error::AccountUnavailable(format!("undecodable account state: {e}")))?;

        self.cache
            .lock()
            .insert(account_id.to_string(), (state.clone(), Instant::now()));
        Ok(state)
    }
}

// =============================================================================
// Tests
// =============================================================================
