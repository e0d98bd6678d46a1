// =============================================================================
// Risk gate — synchronous pre-trade decision pipeline
// =============================================================================
//
// For each candidate order: emergency latch → price resolution → account
// state → simulation → metrics → policy evaluation → decision. Rejections
// are successful responses with a stable reason code; missing upstream data
// is an explicit error, never a default. Every response carries its
// processing time in microseconds.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::publisher::EventPublisher;
use crate::cache::account::AccountSource;
use crate::cache::PriceCache;
use crate::config::RiskConfig;
use crate::error::{Error, Result};
use crate::risk::emergency::{CircuitBreaker, EmergencyCoordinator};
use crate::risk::policy::{PolicyStore, Severity};
use crate::risk::simulation::{
    compute_metrics, portfolio_state, simulate_order, OrderRequest, RiskMetrics,
};
use crate::telemetry;
use crate::types::OrderType;

// ---------------------------------------------------------------------------
// Decision types
// ---------------------------------------------------------------------------

/// One breached policy.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub policy_id: String,
    pub policy_name: String,
    pub severity: Severity,
    pub metric: String,
    pub operator: &'static str,
    pub threshold: f64,
    pub observed: f64,
}

/// Outcome of one `CheckOrder`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckDecision {
    pub approved: bool,
    /// Stable rejection code: `emergency_stop_active`, `simulation_failed`,
    /// or `policy_violation`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Hard and emergency breaches (empty on approval).
    pub violations: Vec<Violation>,
    /// Soft breaches; present on approvals too.
    pub warnings: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RiskMetrics>,
    pub processing_time_us: u64,
}

impl CheckDecision {
    fn approved(warnings: Vec<Violation>, metrics: RiskMetrics) -> Self {
        Self {
            approved: true,
            reason_code: None,
            reason: None,
            violations: Vec::new(),
            warnings,
            metrics: Some(metrics),
            processing_time_us: 0,
        }
    }

    fn rejected(reason_code: &'static str, reason: String) -> Self {
        Self {
            approved: false,
            reason_code: Some(reason_code),
            reason: Some(reason),
            violations: Vec::new(),
            warnings: Vec::new(),
            metrics: None,
            processing_time_us: 0,
        }
    }

    fn stamped(mut self, started: Instant) -> Self {
        self.processing_time_us = started.elapsed().as_micros() as u64;
        self
    }
}

/// One entry of a batch check: either a decision or a per-order error code.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<CheckDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct RiskGate {
    prices: Arc<PriceCache>,
    accounts: Arc<dyn AccountSource>,
    policies: Arc<PolicyStore>,
    coordinator: Arc<EmergencyCoordinator>,
    breaker: CircuitBreaker,
    publisher: EventPublisher,
    cfg: RiskConfig,
}

impl RiskGate {
    pub fn new(
        prices: Arc<PriceCache>,
        accounts: Arc<dyn AccountSource>,
        policies: Arc<PolicyStore>,
        coordinator: Arc<EmergencyCoordinator>,
        publisher: EventPublisher,
        cfg: RiskConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(cfg.circuit_breaker_window(), cfg.circuit_breaker_threshold);
        Self {
            prices,
            accounts,
            policies,
            coordinator,
            breaker,
            publisher,
            cfg,
        }
    }

    /// Decide one candidate order.
    ///
    /// `Err` is reserved for invalid input and upstream unavailability;
    /// every risk-based refusal is an `Ok` decision with `approved = false`.
    pub async fn check_order(&self, request: &OrderRequest) -> Result<CheckDecision> {
        let started = Instant::now();
        request.validate()?;

        // 1. Emergency latch absorbs everything first.
        if self.coordinator.status().active {
            let reason = self
                .coordinator
                .status()
                .reason
                .unwrap_or_else(|| "emergency stop active".to_string());
            return Ok(self.finish(
                CheckDecision::rejected("emergency_stop_active", reason),
                started,
            ));
        }

        // 2. Execution price: limit orders bring their own, everything else
        //    needs a fresh cached price. Stale is a miss, not a fallback.
        let exec_price = match (request.order_type, request.price) {
            (OrderType::Limit, Some(price)) => price,
            _ => match self.prices.get_price(&request.symbol) {
                Some((price, _age)) => price,
                None => return Err(Error::PriceUnavailable(request.symbol.clone())),
            },
        };

        // 3. Authoritative account state, loudly unavailable on failure.
        let account_id = request
            .account_id
            .clone()
            .unwrap_or_else(|| self.cfg.account_id.clone());
        let account = self.accounts.account_state(&account_id).await?;

        // 4. Simulate the fill.
        let marks = |symbol: &str| self.prices.get_price(symbol).map(|(price, _)| price);
        let portfolio = match simulate_order(&account, request, exec_price, &marks) {
            Ok(portfolio) => portfolio,
            Err(reason) => {
                debug!(symbol = %request.symbol, reason = %reason, "simulation rejected order");
                return Ok(self.finish(
                    CheckDecision::rejected("simulation_failed", reason),
                    started,
                ));
            }
        };

        // 5. Post-trade metrics.
        let metrics = compute_metrics(&account, &portfolio);

        // 6. Evaluate matching policies in priority order.
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let mut emergency_policy: Option<String> = None;

        let policies = self.policies.policies();
        let mut applicable: Vec<_> = policies
            .iter()
            .filter(|p| p.enabled && p.scope.applies_to(&request.symbol, request.strategy_id.as_deref()))
            .collect();
        applicable.sort_by_key(|p| p.priority);

        for policy in applicable {
            let Some(observed) = metrics.metric(&policy.metric, policy.scope.symbol()) else {
                debug!(policy = %policy.id, metric = %policy.metric, "unknown policy metric — skipped");
                continue;
            };
            if !policy.breached(observed) {
                continue;
            }
            let violation = Violation {
                policy_id: policy.id.clone(),
                policy_name: policy.name.clone(),
                severity: policy.severity,
                metric: policy.metric.clone(),
                operator: policy.operator.as_str(),
                threshold: policy.threshold,
                observed,
            };
            match policy.severity {
                Severity::Soft => warnings.push(violation),
                Severity::Hard => violations.push(violation),
                Severity::Emergency => {
                    emergency_policy.get_or_insert_with(|| policy.name.clone());
                    violations.push(violation);
                }
            }
        }

        // 7/8. Decision, latch, breaker, alerts.
        let decision = if violations.is_empty() {
            self.breaker.record_pass();
            if !warnings.is_empty() {
                self.publisher.risk_alert(
                    "soft",
                    &serde_json::json!({
                        "account_id": account_id,
                        "symbol": request.symbol,
                        "warnings": warnings,
                    }),
                );
            }
            CheckDecision::approved(warnings, metrics)
        } else {
            if let Some(policy_name) = &emergency_policy {
                self.coordinator
                    .trigger(&format!("policy {policy_name} breached"), "risk_gate");
            }
            if self.breaker.record_violation()
                && self
                    .coordinator
                    .trigger("circuit breaker: repeated hard violations", "circuit_breaker")
            {
                warn!("circuit breaker tripped the emergency latch");
            }

            let worst = violations
                .iter()
                .map(|v| v.severity)
                .max()
                .unwrap_or(Severity::Hard);
            self.publisher.risk_alert(
                &worst.to_string(),
                &serde_json::json!({
                    "account_id": account_id,
                    "symbol": request.symbol,
                    "violations": violations,
                }),
            );

            let names: Vec<&str> = violations.iter().map(|v| v.policy_name.as_str()).collect();
            info!(symbol = %request.symbol, policies = ?names, "order rejected by policy");
            let mut decision = CheckDecision::rejected(
                "policy_violation",
                format!("breached: {}", names.join(", ")),
            );
            decision.violations = violations;
            decision.warnings = warnings;
            decision.metrics = Some(metrics);
            decision
        };

        Ok(self.finish(decision, started))
    }

    /// Check a batch. Orders are independent: one order's upstream failure
    /// becomes its entry's error code without failing the rest.
    pub async fn check_order_batch(&self, requests: &[OrderRequest]) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let entry = match self.check_order(request).await {
                Ok(decision) => BatchResult {
                    index,
                    decision: Some(decision),
                    error: None,
                    message: None,
                },
                Err(e) => BatchResult {
                    index,
                    decision: None,
                    error: Some(e.code().to_string()),
                    message: Some(e.to_string()),
                },
            };
            results.push(entry);
        }
        results
    }

    /// Current portfolio metrics with no candidate order.
    pub async fn current_metrics(&self, account_id: &str) -> Result<RiskMetrics> {
        let account = self.accounts.account_state(account_id).await?;
        let marks = |symbol: &str| self.prices.get_price(symbol).map(|(price, _)| price);
        let portfolio = portfolio_state(&account, &marks);
        Ok(compute_metrics(&account, &portfolio))
    }

    fn finish(&self, decision: CheckDecision, started: Instant) -> CheckDecision {
        let decision = decision.stamped(started);
        histogram!(
            telemetry::RISK_DECISION_SECONDS,
            started.elapsed().as_secs_f64()
        );
        decision
    }
}

// =============================================================================
// Tests
// =============================================================================
//
// End-to-end gate scenarios (emergency trip, bus announcements, breaker)
// live in tests/risk_scenarios.rs; these unit tests cover the decision
// plumbing with a stub account source.
