//! Token-priced LLM call accounting with budget enforcement (§4.C).
//!
//! The single-mutex-guarded ledger follows the "shared mutable state → per-component
//! lock" design note; the pre-commit budget check mirrors the Cost Tracker's own
//! wording: project first, bill only if under budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CostResult<T> = Result<T, CostError>;

#[derive(Debug, Error, Clone)]
pub enum CostError {
    #[error("budget exceeded: projected {kind} usage {projected:.4} exceeds limit {limit:.4}")]
    BudgetExceeded {
        kind: String,
        projected: f64,
        limit: f64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ModelTariff {
    pub dollars_per_million_input: f64,
    pub dollars_per_million_output: f64,
}

const DEFAULT_TARIFF: ModelTariff = ModelTariff {
    dollars_per_million_input: 3.0,
    dollars_per_million_output: 15.0,
};

fn pricing_table() -> HashMap<&'static str, ModelTariff> {
    let mut table = HashMap::new();
    table.insert(
        "gpt-4o-mini",
        ModelTariff {
            dollars_per_million_input: 0.15,
            dollars_per_million_output: 0.6,
        },
    );
    table.insert(
        "gpt-4o",
        ModelTariff {
            dollars_per_million_input: 2.5,
            dollars_per_million_output: 10.0,
        },
    );
    table.insert(
        "claude-3-5-sonnet",
        ModelTariff {
            dollars_per_million_input: 3.0,
            dollars_per_million_output: 15.0,
        },
    );
    table.insert(
        "claude-3-opus",
        ModelTariff {
            dollars_per_million_input: 15.0,
            dollars_per_million_output: 75.0,
        },
    );
    table
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub provider: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub stage: String,
    pub card_id: String,
    pub purpose: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResult {
    pub cost: f64,
    pub daily_usage: f64,
    pub monthly_usage: f64,
    pub daily_remaining: Option<f64>,
    pub monthly_remaining: Option<f64>,
    pub alert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostStats {
    pub total_cost: f64,
    pub total_calls: usize,
    pub by_stage: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
    pub average_cost_per_call: f64,
}

struct Ledger {
    records: Vec<UsageRecord>,
}

pub struct CostTracker {
    daily_budget: f64,
    monthly_budget: f64,
    alert_threshold: f64,
    pricing: HashMap<&'static str, ModelTariff>,
    ledger: Mutex<Ledger>,
}

pub type SharedCostTracker = Arc<CostTracker>;

impl CostTracker {
    pub fn new(daily_budget: f64, monthly_budget: f64) -> Self {
        Self {
            daily_budget,
            monthly_budget,
            alert_threshold: 0.8,
            pricing: pricing_table(),
            ledger: Mutex::new(Ledger { records: Vec::new() }),
        }
    }

    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    pub fn shared(self) -> SharedCostTracker {
        Arc::new(self)
    }

    fn tariff_for(&self, model: &str) -> ModelTariff {
        self.pricing.get(model).copied().unwrap_or(DEFAULT_TARIFF)
    }

    fn compute_cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let tariff = self.tariff_for(model);
        let input_cost = tokens_in as f64 / 1_000_000.0 * tariff.dollars_per_million_input;
        let output_cost = tokens_out as f64 / 1_000_000.0 * tariff.dollars_per_million_output;
        input_cost + output_cost
    }

    fn usage_since(records: &[UsageRecord], since: DateTime<Utc>) -> f64 {
        records.iter().filter(|r| r.timestamp >= since).map(|r| r.cost).sum()
    }

    fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
        let date: NaiveDate = now.date_naive();
        DateTime::<Utc>::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc)
    }

    fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive().with_day(1).unwrap();
        DateTime::<Utc>::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc)
    }

    /// Projects cost, checks both budgets *before* recording anything. On
    /// `BudgetExceeded` nothing is billed — the invariant this component exists to hold.
    pub fn track(
        &self,
        model: &str,
        provider: &str,
        tokens_in: u64,
        tokens_out: u64,
        stage: &str,
        card_id: &str,
        purpose: &str,
    ) -> CostResult<TrackResult> {
        let projected_cost = self.compute_cost(model, tokens_in, tokens_out);
        let now = Utc::now();

        let mut ledger = self.ledger.lock().unwrap();
        let daily_so_far = Self::usage_since(&ledger.records, Self::day_start(now));
        let monthly_so_far = Self::usage_since(&ledger.records, Self::month_start(now));

        if daily_so_far + projected_cost > self.daily_budget {
            return Err(CostError::BudgetExceeded {
                kind: "daily".to_string(),
                projected: daily_so_far + projected_cost,
                limit: self.daily_budget,
            });
        }
        if monthly_so_far + projected_cost > self.monthly_budget {
            return Err(CostError::BudgetExceeded {
                kind: "monthly".to_string(),
                projected: monthly_so_far + projected_cost,
                limit: self.monthly_budget,
            });
        }

        ledger.records.push(UsageRecord {
            model: model.to_string(),
            provider: provider.to_string(),
            tokens_in,
            tokens_out,
            cost: projected_cost,
            stage: stage.to_string(),
            card_id: card_id.to_string(),
            purpose: purpose.to_string(),
            timestamp: now,
        });

        let daily_usage = daily_so_far + projected_cost;
        let monthly_usage = monthly_so_far + projected_cost;

        let mut alerts = Vec::new();
        if daily_usage >= self.alert_threshold * self.daily_budget {
            alerts.push(format!(
                "daily budget {:.0}% consumed (${daily_usage:.2} / ${:.2})",
                daily_usage / self.daily_budget * 100.0,
                self.daily_budget
            ));
        }
        if monthly_usage >= self.alert_threshold * self.monthly_budget {
            alerts.push(format!(
                "monthly budget {:.0}% consumed (${monthly_usage:.2} / ${:.2})",
                monthly_usage / self.monthly_budget * 100.0,
                self.monthly_budget
            ));
        }

        Ok(TrackResult {
            cost: projected_cost,
            daily_usage,
            monthly_usage,
            daily_remaining: Some((self.daily_budget - daily_usage).max(0.0)),
            monthly_remaining: Some((self.monthly_budget - monthly_usage).max(0.0)),
            alert: if alerts.is_empty() { None } else { Some(alerts.join("; ")) },
        })
    }

    pub fn stats(&self) -> CostStats {
        let ledger = self.ledger.lock().unwrap();
        let total_cost: f64 = ledger.records.iter().map(|r| r.cost).sum();
        let total_calls = ledger.records.len();
        let mut by_stage = HashMap::new();
        let mut by_model = HashMap::new();
        for r in &ledger.records {
            *by_stage.entry(r.stage.clone()).or_insert(0.0) += r.cost;
            *by_model.entry(r.model.clone()).or_insert(0.0) += r.cost;
        }
        CostStats {
            total_cost,
            total_calls,
            by_stage,
            by_model,
            average_cost_per_call: if total_calls == 0 { 0.0 } else { total_cost / total_calls as f64 },
        }
    }

    pub fn cleanup(&self, days: i64) {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut ledger = self.ledger.lock().unwrap();
        ledger.records.retain(|r| r.timestamp >= cutoff);
    }
}
