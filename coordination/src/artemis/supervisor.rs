//! Wraps every stage invocation with retry, circuit-breaking and recovery (§4.G).
//!
//! The breaker shape (consecutive-failure counting, cooldown-gated `Open` → probe)
//! is the same as `router::circuit_breaker::CircuitBreaker`, generalized from a
//! `ModelId` key to a stage name; `retry_delay * backoff_multiplier^(attempt-1)`
//! mirrors the same module's rate-limit backoff formula.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::artemis::card::Card;
use crate::artemis::context::Context;
use crate::artemis::messenger::{MessageType, MessengerError, Priority, SharedMessenger};
use crate::artemis::stage::{result_status, Stage};

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("stage '{stage_name}' failed after {retry_attempt} attempts: {message}")]
    PipelineStage {
        stage_name: String,
        retry_attempt: u32,
        message: String,
    },
    #[error(transparent)]
    Messenger(#[from] MessengerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub timeout: Duration,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
        }
    }
}

struct StageHealth {
    strategy: RecoveryStrategy,
    failure_count: u32,
    last_failure: Option<Instant>,
    circuit_open_until: Option<Instant>,
    timeouts_detected: u32,
}

impl StageHealth {
    fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            failure_count: 0,
            last_failure: None,
            circuit_open_until: None,
            timeouts_detected: 0,
        }
    }

    fn state(&self, now: Instant) -> CircuitState {
        match self.circuit_open_until {
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
        self.circuit_open_until = None;
    }

    fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure = Some(now);
        if self.failure_count >= self.strategy.breaker_threshold {
            self.circuit_open_until = Some(now + self.strategy.breaker_cooldown);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub stages_registered: usize,
    pub total_timeouts: u32,
    pub open_circuits: Vec<String>,
}

pub struct Supervisor {
    health: Mutex<HashMap<String, StageHealth>>,
    messenger: SharedMessenger,
    code_review_retry_limit: u32,
}

impl Supervisor {
    pub fn new(messenger: SharedMessenger) -> Self {
        Self {
            health: Mutex::new(HashMap::new()),
            messenger,
            code_review_retry_limit: 2,
        }
    }

    pub fn with_code_review_retry_limit(mut self, limit: u32) -> Self {
        self.code_review_retry_limit = limit;
        self
    }

    pub fn code_review_retry_limit(&self) -> u32 {
        self.code_review_retry_limit
    }

    pub async fn register_stage(&self, stage_name: &str, strategy: Option<RecoveryStrategy>) {
        let mut health = self.health.lock().await;
        health
            .entry(stage_name.to_string())
            .or_insert_with(|| StageHealth::new(strategy.unwrap_or_default()));
    }

    /// `execute_with_supervision(stage, stage_name, card, context) → result`.
    ///
    /// Registers the stage with a default strategy if not already registered, then
    /// follows the contract in §4.G: skip on an open breaker, run under a timeout,
    /// retry with backoff on failure, open the breaker at threshold, and notify the
    /// Messenger once retries are exhausted.
    pub async fn execute_with_supervision(
        &self,
        stage: &dyn Stage,
        card: &Card,
        context: &Context,
    ) -> SupervisorResult<Value> {
        let stage_name = stage.get_stage_name().to_string();
        self.register_stage(&stage_name, None).await;

        let strategy = {
            let health = self.health.lock().await;
            health.get(&stage_name).unwrap().strategy.clone()
        };

        {
            let mut health = self.health.lock().await;
            let entry = health.get_mut(&stage_name).unwrap();
            let now = Instant::now();
            if entry.state(now) == CircuitState::Open {
                return Ok(serde_json::json!({
                    "status": "skipped",
                    "reason": "circuit_breaker_open",
                }));
            }
        }

        let mut last_error = String::new();
        for attempt in 1..=strategy.max_retries {
            let run = timeout(strategy.timeout, stage.execute(card, context)).await;

            match run {
                Ok(Ok(result)) => {
                    let mut health = self.health.lock().await;
                    health.get_mut(&stage_name).unwrap().record_success();
                    info!(stage = %stage_name, attempt, "stage completed");
                    return Ok(result);
                }
                Ok(Err(message)) => {
                    last_error = message;
                }
                Err(_) => {
                    let mut health = self.health.lock().await;
                    let entry = health.get_mut(&stage_name).unwrap();
                    entry.timeouts_detected += 1;
                    last_error = format!("stage '{stage_name}' timed out after {:?}", strategy.timeout);
                    warn!(stage = %stage_name, attempt, "stage timed out");
                    let _ = self
                        .messenger
                        .send(
                            "orchestrator",
                            MessageType::Notification,
                            serde_json::json!({"event": "stage_timeout", "stage": stage_name, "attempt": attempt}),
                            card.id.clone(),
                            Priority::Medium,
                            None,
                        )
                        .await;
                }
            }

            let now = Instant::now();
            let mut health = self.health.lock().await;
            let entry = health.get_mut(&stage_name).unwrap();
            entry.record_failure(now);
            let opened = entry.state(now) == CircuitState::Open;
            drop(health);

            if opened {
                break;
            }
            if attempt < strategy.max_retries {
                let backoff = strategy.retry_delay.mul_f64(strategy.backoff_multiplier.powi((attempt - 1) as i32));
                tokio::time::sleep(backoff).await;
            }
        }

        let _ = self
            .messenger
            .send(
                "orchestrator",
                MessageType::Error,
                serde_json::json!({"event": "stage_exhausted", "stage": stage_name, "message": last_error}),
                card.id.clone(),
                Priority::High,
                None,
            )
            .await;

        Err(SupervisorError::PipelineStage {
            stage_name,
            retry_attempt: strategy.max_retries,
            message: last_error,
        })
    }

    /// Checks whether a code_review result logically failed, per the business rule
    /// that surfaces into the Supervisor: a FAIL must re-enter `development` before
    /// `code_review` is retried.
    pub fn is_code_review_fail(result: &Value) -> bool {
        result_status(result).map(|s| s.eq_ignore_ascii_case("fail")).unwrap_or(false)
    }

    pub async fn stats(&self) -> SupervisorStats {
        let health = self.health.lock().await;
        let now = Instant::now();
        SupervisorStats {
            stages_registered: health.len(),
            total_timeouts: health.values().map(|h| h.timeouts_detected).sum(),
            open_circuits: health
                .iter()
                .filter(|(_, h)| h.state(now) == CircuitState::Open)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}
