// =============================================================================
// Risk policies — declarative rules over post-trade metrics
// =============================================================================
//
// A policy compares one metric against a threshold with a scope filter.
// Policies live in the durable store under a short-TTL in-process cache;
// writes go through the store and invalidate the cache so every instance
// converges within one TTL.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::cache::store::KvStore;
use crate::config::RiskConfig;
use crate::error::{Error, Result};

/// Store key holding the policy list.
const POLICY_KEY: &str = "risk:policies";
/// Store key holding the emergency transition log.
const EMERGENCY_LOG_KEY: &str = "risk:emergency:log";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Breach severity. Ordering matters: the worst breached severity decides
/// the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Soft,
    Hard,
    Emergency,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl PolicyOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    /// Evaluate `observed <op> threshold`. Equality uses a small epsilon —
    /// these are derived f64 metrics, not exact counters.
    pub fn evaluate(&self, observed: f64, threshold: f64) -> bool {
        const EPSILON: f64 = 1e-9;
        match self {
            Self::Lt => observed < threshold,
            Self::Le => observed <= threshold,
            Self::Gt => observed > threshold,
            Self::Ge => observed >= threshold,
            Self::Eq => (observed - threshold).abs() <= EPSILON,
            Self::Ne => (observed - threshold).abs() > EPSILON,
        }
    }
}

/// Policy scope: the whole account, one symbol, or one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyScope {
    Account,
    Symbol(String),
    Strategy(String),
}

impl PolicyScope {
    /// Whether this policy applies to a check for `symbol` / `strategy`.
    /// Account-scoped policies always apply.
    pub fn applies_to(&self, symbol: &str, strategy: Option<&str>) -> bool {
        match self {
            Self::Account => true,
            Self::Symbol(s) => s == symbol,
            Self::Strategy(s) => strategy == Some(s.as_str()),
        }
    }

    /// Symbol this scope narrows to, if any.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account => write!(f, "account"),
            Self::Symbol(s) => write!(f, "symbol:{s}"),
            Self::Strategy(s) => write!(f, "strategy:{s}"),
        }
    }
}

impl FromStr for PolicyScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "account" {
            return Ok(Self::Account);
        }
        if let Some(symbol) = s.strip_prefix("symbol:") {
            if symbol.is_empty() {
                return Err(Error::InvalidInput("empty symbol scope".into()));
            }
            return Ok(Self::Symbol(symbol.to_string()));
        }
        if let Some(strategy) = s.strip_prefix("strategy:") {
            if strategy.is_empty() {
                return Err(Error::InvalidInput("empty strategy scope".into()));
            }
            return Ok(Self::Strategy(strategy.to_string()));
        }
        Err(Error::InvalidInput(format!("unknown policy scope {s:?}")))
    }
}

impl Serialize for PolicyScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PolicyScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: Error| D::Error::custom(e.to_string()))
    }
}

/// One declarative risk rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    /// Metric key evaluated against post-trade metrics
    /// (leverage, margin_ratio, daily_drawdown, max_drawdown,
    /// symbol_concentration).
    pub metric: String,
    pub operator: PolicyOp,
    pub threshold: f64,
    pub scope: PolicyScope,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

impl Policy {
    pub fn breached(&self, observed: f64) -> bool {
        self.operator.evaluate(observed, self.threshold)
    }
}

/// Default policy set derived from the risk configuration. Seeded into the
/// store on first start.
pub fn default_policies(risk: &RiskConfig) -> Vec<Policy> {
    vec![
        Policy {
            id: "max-leverage".into(),
            name: "Max Leverage".into(),
            severity: Severity::Hard,
            metric: "leverage".into(),
            operator: PolicyOp::Gt,
            threshold: risk.max_leverage,
            scope: PolicyScope::Account,
            enabled: true,
            priority: 10,
            version: 1,
        },
        Policy {
            id: "max-drawdown".into(),
            name: "Max Drawdown".into(),
            severity: Severity::Hard,
            metric: "max_drawdown".into(),
            operator: PolicyOp::Gt,
            threshold: risk.max_drawdown_percent / 100.0,
            scope: PolicyScope::Account,
            enabled: true,
            priority: 20,
            version: 1,
        },
        Policy {
            id: "emergency-drawdown".into(),
            name: "Emergency Drawdown".into(),
            severity: Severity::Emergency,
            metric: "max_drawdown".into(),
            operator: PolicyOp::Gt,
            threshold: risk.emergency_threshold / 100.0,
            scope: PolicyScope::Account,
            enabled: true,
            priority: 30,
            version: 1,
        },
        Policy {
            id: "daily-drawdown".into(),
            name: "Daily Drawdown".into(),
            severity: Severity::Soft,
            metric: "daily_drawdown".into(),
            operator: PolicyOp::Gt,
            threshold: (risk.max_drawdown_percent / 2.0) / 100.0,
            scope: PolicyScope::Account,
            enabled: true,
            priority: 40,
            version: 1,
        },
        Policy {
            id: "margin-ratio".into(),
            name: "Margin Ratio".into(),
            severity: Severity::Soft,
            metric: "margin_ratio".into(),
            operator: PolicyOp::Gt,
            threshold: 0.8,
            scope: PolicyScope::Account,
            enabled: true,
            priority: 50,
            version: 1,
        },
        Policy {
            id: "symbol-concentration".into(),
            name: "Symbol Concentration".into(),
            severity: Severity::Soft,
            metric: "symbol_concentration".into(),
            operator: PolicyOp::Gt,
            threshold: 0.5,
            scope: PolicyScope::Account,
            enabled: true,
            priority: 60,
            version: 1,
        },
    ]
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct CachedPolicies {
    policies: Arc<Vec<Policy>>,
    loaded_at: Instant,
}

/// TTL-cached view over the durable policy collection.
pub struct PolicyStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    cached: Mutex<Option<CachedPolicies>>,
}

impl PolicyStore {
    /// Open the store, seeding `defaults` if no policy list exists yet.
    pub fn open(store: Arc<dyn KvStore>, ttl: Duration, defaults: Vec<Policy>) -> Self {
        if store.get(POLICY_KEY).is_none() {
            match serde_json::to_string(&defaults) {
                Ok(json) => {
                    store.set(POLICY_KEY, &json);
                    info!(count = defaults.len(), "seeded default risk policies");
                }
                Err(e) => warn!(error = %e, "failed to seed default policies"),
            }
        }
        Self {
            store,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Current policy list, refreshed from the store when the TTL lapses.
    pub fn policies(&self) -> Arc<Vec<Policy>> {
        {
            let cached = self.cached.lock();
            if let Some(slot) = cached.as_ref() {
                if slot.loaded_at.elapsed() <= self.ttl {
                    return slot.policies.clone();
                }
            }
        }
        self.refresh()
    }

    fn refresh(&self) -> Arc<Vec<Policy>> {
        let loaded: Vec<Policy> = self
            .store
            .get(POLICY_KEY)
            .and_then(|json| match serde_json::from_str(&json) {
                Ok(policies) => Some(policies),
                Err(e) => {
                    warn!(error = %e, "undecodable policy list in store");
                    None
                }
            })
            .unwrap_or_default();

        let policies = Arc::new(loaded);
        *self.cached.lock() = Some(CachedPolicies {
            policies: policies.clone(),
            loaded_at: Instant::now(),
        });
        policies
    }

    /// Insert or replace a policy. The stored version is bumped past the
    /// previous one and the cache is invalidated.
    pub fn upsert(&self, mut policy: Policy) -> Result<Policy> {
        if policy.id.is_empty() {
            return Err(Error::InvalidInput("policy id must not be empty".into()));
        }

        let mut policies: Vec<Policy> = self
            .store
            .get(POLICY_KEY)
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();

        match policies.iter_mut().find(|p| p.id == policy.id) {
            Some(existing) => {
                policy.version = existing.version + 1;
                *existing = policy.clone();
            }
            None => {
                policy.version = policy.version.max(1);
                policies.push(policy.clone());
            }
        }

        let json = serde_json::to_string(&policies)?;
        self.store.set(POLICY_KEY, &json);
        *self.cached.lock() = None;
        info!(policy = %policy.id, version = policy.version, "policy stored");
        Ok(policy)
    }

    /// Append one emergency transition to the durable log.
    pub fn record_emergency<T: Serialize>(&self, record: &T) {
        match serde_json::to_string(record) {
            Ok(json) => self.store.append(EMERGENCY_LOG_KEY, &json),
            Err(e) => warn!(error = %e, "failed to serialise emergency record"),
        }
    }

    /// Most recent emergency transitions, oldest first.
    pub fn emergency_log(&self, limit: usize) -> Vec<serde_json::Value> {
        self.store
            .list(EMERGENCY_LOG_KEY, limit)
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;

    fn store_with_defaults(ttl: Duration) -> PolicyStore {
        PolicyStore::open(
            Arc::new(MemoryStore::new()),
            ttl,
            default_policies(&RiskConfig::default()),
        )
    }

    #[test]
    fn operators_evaluate() {
        assert!(PolicyOp::Gt.evaluate(0.21, 0.20));
        assert!(!PolicyOp::Gt.evaluate(0.20, 0.20));
        assert!(PolicyOp::Ge.evaluate(0.20, 0.20));
        assert!(PolicyOp::Lt.evaluate(1.0, 2.0));
        assert!(PolicyOp::Eq.evaluate(0.5, 0.5));
        assert!(PolicyOp::Ne.evaluate(0.5, 0.6));
    }

    #[test]
    fn scope_parses_and_matches() {
        let account: PolicyScope = "account".parse().unwrap();
        let symbol: PolicyScope = "symbol:BTCUSDT".parse().unwrap();
        let strategy: PolicyScope = "strategy:momentum".parse().unwrap();

        assert!(account.applies_to("ETHUSDT", None));
        assert!(symbol.applies_to("BTCUSDT", None));
        assert!(!symbol.applies_to("ETHUSDT", None));
        assert!(strategy.applies_to("BTCUSDT", Some("momentum")));
        assert!(!strategy.applies_to("BTCUSDT", None));

        assert!("symbol:".parse::<PolicyScope>().is_err());
        assert!("everything".parse::<PolicyScope>().is_err());
    }

    #[test]
    fn scope_serialises_as_string() {
        let policy = &default_policies(&RiskConfig::default())[0];
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["scope"], "account");
        assert_eq!(json["operator"], ">");

        let back: Policy = serde_json::from_value(json).unwrap();
        assert_eq!(back.scope, PolicyScope::Account);
    }

    #[test]
    fn defaults_reflect_risk_config() {
        let mut cfg = RiskConfig::default();
        cfg.max_leverage = 5.0;
        cfg.max_drawdown_percent = 20.0;
        cfg.emergency_threshold = 25.0;

        let policies = default_policies(&cfg);
        let leverage = policies.iter().find(|p| p.id == "max-leverage").unwrap();
        assert_eq!(leverage.threshold, 5.0);
        let emergency = policies.iter().find(|p| p.id == "emergency-drawdown").unwrap();
        assert_eq!(emergency.severity, Severity::Emergency);
        assert!((emergency.threshold - 0.25).abs() < 1e-12);
    }

    #[test]
    fn policies_are_seeded_once_and_cached() {
        let store = store_with_defaults(Duration::from_secs(60));
        let first = store.policies();
        assert_eq!(first.len(), 6);
        // Second read comes from cache (same Arc).
        let second = store.policies();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn upsert_bumps_version_and_invalidates_cache() {
        let store = store_with_defaults(Duration::from_secs(60));
        let _ = store.policies();

        let mut policy = default_policies(&RiskConfig::default())
            .into_iter()
            .find(|p| p.id == "max-leverage")
            .unwrap();
        policy.threshold = 3.0;

        let stored = store.upsert(policy).unwrap();
        assert_eq!(stored.version, 2);

        let policies = store.policies();
        let leverage = policies.iter().find(|p| p.id == "max-leverage").unwrap();
        assert_eq!(leverage.threshold, 3.0);
        assert_eq!(leverage.version, 2);
    }

    #[test]
    fn upsert_inserts_new_policy() {
        let store = store_with_defaults(Duration::from_secs(60));
        let policy = Policy {
            id: "btc-cap".into(),
            name: "BTC Exposure Cap".into(),
            severity: Severity::Hard,
            metric: "symbol_concentration".into(),
            operator: PolicyOp::Gt,
            threshold: 0.3,
            scope: PolicyScope::Symbol("BTCUSDT".into()),
            enabled: true,
            priority: 15,
            version: 1,
        };
        store.upsert(policy).unwrap();
        assert_eq!(store.policies().len(), 7);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Emergency > Severity::Hard);
        assert!(Severity::Hard > Severity::Soft);
    }

    #[test]
    fn emergency_log_roundtrips() {
        let store = store_with_defaults(Duration::from_secs(60));
        store.record_emergency(&serde_json::json!({"active": true, "reason": "drawdown"}));
        let log = store.emergency_log(10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0]["reason"], "drawdown");
    }
}
